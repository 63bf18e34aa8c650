use crate::interaction::{FollowUpAction, TelegramOrigin};
use crate::model::{JobKind, SubmitError};
use crate::queue::{GenerationJob, ImagineQueue};
use anyhow::Result;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use tracing::{info, instrument, warn};

const HELP_TEXT: &str = "Commands:\n\
    /imagine <prompt> - generate a 2x2 image grid (supports --ar W:H)\n\
    /settings - show the current generation defaults\n\
    /dimensions <WxH> - set the default image dimensions\n\
    /batch <count> <size> - set the default batch parameters";

#[instrument(skip_all)]
pub async fn handle_message(
    bot: &Bot,
    queue: &Arc<ImagineQueue>,
    allowed_users: &[i64],
    msg: &Message,
) -> Result<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    if !allowed_users.is_empty() && !allowed_users.contains(&(user.id.0 as i64)) {
        return Ok(());
    }

    let trimmed = text.trim();
    let (command, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (trimmed, ""),
    };

    match command {
        "/start" | "/help" => {
            let _ = bot.send_message(msg.chat.id, HELP_TEXT).await;
        }
        "/imagine" => {
            if rest.is_empty() {
                let _ = bot
                    .send_message(msg.chat.id, "Usage: /imagine <prompt>")
                    .await;
                return Ok(());
            }
            let origin = Arc::new(TelegramOrigin::for_request(
                bot.clone(),
                msg.chat.id,
                user.id.0,
                msg.id,
            ));
            let job = GenerationJob::new(
                JobKind::New {
                    prompt: rest.to_string(),
                },
                origin,
            );
            match queue.submit(job) {
                Ok(position) => {
                    info!(position, "queued imagine request");
                    let _ = bot
                        .send_message(
                            msg.chat.id,
                            format!(
                                "I'm dreaming something up for you. You are currently #{} in line.",
                                position
                            ),
                        )
                        .await;
                }
                Err(SubmitError::QueueFull) => {
                    let _ = bot
                        .send_message(
                            msg.chat.id,
                            "The queue is full right now. Please try again in a bit.",
                        )
                        .await;
                }
            }
        }
        "/settings" => {
            let settings = queue.defaults().await?;
            let _ = bot
                .send_message(
                    msg.chat.id,
                    format!(
                        "Current defaults: {}x{}, batch count {}, batch size {}.",
                        settings.width, settings.height, settings.batch_count, settings.batch_size
                    ),
                )
                .await;
        }
        "/dimensions" => match parse_dimensions(rest) {
            Some((width, height)) => {
                let settings = queue.update_default_dimensions(width, height).await?;
                let _ = bot
                    .send_message(
                        msg.chat.id,
                        format!(
                            "Default dimensions set to {}x{}.",
                            settings.width, settings.height
                        ),
                    )
                    .await;
            }
            None => {
                let _ = bot
                    .send_message(msg.chat.id, "Usage: /dimensions <WxH>, e.g. /dimensions 768x768")
                    .await;
            }
        },
        "/batch" => match parse_batch(rest) {
            Some((count, size)) => {
                let settings = queue.update_default_batch(count, size).await?;
                let _ = bot
                    .send_message(
                        msg.chat.id,
                        format!(
                            "Default batch set to count {}, size {}.",
                            settings.batch_count, settings.batch_size
                        ),
                    )
                    .await;
            }
            None => {
                let _ = bot
                    .send_message(msg.chat.id, "Usage: /batch <count> <size>, each between 1 and 4")
                    .await;
            }
        },
        command if command.starts_with('/') => {
            let _ = bot.send_message(msg.chat.id, "Unknown command.").await;
        }
        _ => {}
    }

    Ok(())
}

#[instrument(skip_all)]
pub async fn handle_callback(
    bot: &Bot,
    queue: &Arc<ImagineQueue>,
    allowed_users: &[i64],
    callback: &CallbackQuery,
) -> Result<()> {
    let mut answer = bot.answer_callback_query(callback.id.clone());

    if !allowed_users.is_empty() && !allowed_users.contains(&(callback.from.id.0 as i64)) {
        answer.await?;
        return Ok(());
    }

    let parsed = callback
        .data
        .as_deref()
        .and_then(FollowUpAction::parse_callback_data);
    let (Some((action, message_key)), Some(message)) = (parsed, callback.message.as_ref()) else {
        warn!("callback query without usable payload");
        answer.await?;
        return Ok(());
    };

    let kind = match action {
        FollowUpAction::Reroll => JobKind::Reroll,
        FollowUpAction::Variation(index) => JobKind::Variation {
            index: i64::from(index),
        },
        FollowUpAction::Upscale(index) => JobKind::Upscale {
            index: i64::from(index),
        },
    };

    let origin = Arc::new(TelegramOrigin::for_callback(
        bot.clone(),
        message.chat.id,
        callback.from.id.0,
        &callback.id,
        message_key,
    ));

    answer = match queue.submit(GenerationJob::new(kind, origin)) {
        Ok(position) => {
            info!(position, action = %action.action_id(), "queued follow-up request");
            answer.text(format!("Queued. You are #{} in line.", position))
        }
        Err(SubmitError::QueueFull) => {
            answer.text("The queue is full right now. Please try again in a bit.")
        }
    };
    answer.await?;

    Ok(())
}

fn parse_dimensions(input: &str) -> Option<(i64, i64)> {
    let (width, height) = input.split_once(['x', 'X'])?;
    let width: i64 = width.trim().parse().ok()?;
    let height: i64 = height.trim().parse().ok()?;
    (width > 0 && height > 0).then_some((width, height))
}

fn parse_batch(input: &str) -> Option<(i64, i64)> {
    let mut parts = input.split_whitespace();
    let count: i64 = parts.next()?.parse().ok()?;
    let size: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    ((1..=4).contains(&count) && (1..=4).contains(&size)).then_some((count, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_parsing() {
        assert_eq!(parse_dimensions("768x768"), Some((768, 768)));
        assert_eq!(parse_dimensions("1024 X 576"), Some((1024, 576)));
        assert_eq!(parse_dimensions("768"), None);
        assert_eq!(parse_dimensions("0x768"), None);
        assert_eq!(parse_dimensions("-8x768"), None);
        assert_eq!(parse_dimensions("axb"), None);
    }

    #[test]
    fn batch_parsing() {
        assert_eq!(parse_batch("4 1"), Some((4, 1)));
        assert_eq!(parse_batch("  2   2 "), Some((2, 2)));
        assert_eq!(parse_batch("5 1"), None);
        assert_eq!(parse_batch("1"), None);
        assert_eq!(parse_batch("1 1 1"), None);
    }
}
