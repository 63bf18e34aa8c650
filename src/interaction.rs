//! Origin handles: how the queue talks back to whoever asked.
//!
//! The queue never touches the chat transport directly. Every job carries an
//! [`OriginHandle`] that knows how to post a status message, rewrite it with
//! progress, and finally replace it with the finished result. The Telegram
//! implementation lives here too; tests use a recording fake.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use teloxide::prelude::*;
use teloxide::types::{
    ChatId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId,
};
use tracing::debug;

/// Follow-up buttons attached to a finished grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUpAction {
    Reroll,
    Variation(u8),
    Upscale(u8),
}

impl FollowUpAction {
    /// All actions offered on a finished 2x2 grid, in display order.
    pub fn grid() -> Vec<FollowUpAction> {
        let mut actions = vec![FollowUpAction::Reroll];
        actions.extend((1..=4).map(FollowUpAction::Variation));
        actions.extend((1..=4).map(FollowUpAction::Upscale));
        actions
    }

    pub fn action_id(&self) -> String {
        match self {
            FollowUpAction::Reroll => "imagine_reroll".to_string(),
            FollowUpAction::Variation(n) => format!("imagine_variation_{}", n),
            FollowUpAction::Upscale(n) => format!("imagine_upscale_{}", n),
        }
    }

    pub fn label(&self) -> String {
        match self {
            FollowUpAction::Reroll => "🎲 Re-roll".to_string(),
            FollowUpAction::Variation(n) => format!("V{}", n),
            FollowUpAction::Upscale(n) => format!("U{}", n),
        }
    }

    /// Callback payload carrying both the action and the result-message key
    /// the generation records are stored under.
    pub fn callback_data(&self, message_key: &str) -> String {
        format!("{}:{}", self.action_id(), message_key)
    }

    /// Inverse of [`callback_data`]. Returns the action and the message key.
    pub fn parse_callback_data(data: &str) -> Option<(FollowUpAction, String)> {
        let (action_id, key) = data.split_once(':')?;
        let action = match action_id {
            "imagine_reroll" => FollowUpAction::Reroll,
            _ => {
                let index = action_id.rsplit_once('_')?.1.parse::<u8>().ok()?;
                if !(1..=4).contains(&index) {
                    return None;
                }
                if action_id.starts_with("imagine_variation_") {
                    FollowUpAction::Variation(index)
                } else if action_id.starts_with("imagine_upscale_") {
                    FollowUpAction::Upscale(index)
                } else {
                    return None;
                }
            }
        };
        Some((action, key.to_string()))
    }
}

/// Where a running job currently is, for progress rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Render,
    Upscale,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub phase: ProgressPhase,
    pub fraction: f64,
}

impl ProgressUpdate {
    pub fn render_text(&self) -> String {
        let pct = (self.fraction.clamp(0.0, 1.0) * 100.0).round() as u32;
        match self.phase {
            ProgressPhase::Render => format!("Dreaming it up... {}% complete.", pct),
            ProgressPhase::Upscale => format!("Upscaling... {}% complete.", pct),
        }
    }
}

/// Opaque reference back to the requesting session.
///
/// `announce` establishes the status message and returns its identifier; the
/// queue stores generation records under that identifier, and the follow-up
/// buttons embed it so derived jobs can find their source records.
#[async_trait]
pub trait OriginHandle: Send + Sync {
    /// Correlation id of the triggering interaction.
    fn interaction_id(&self) -> String;

    /// Requesting user, persisted with each record.
    fn member_id(&self) -> String;

    /// Result-message key of the generation this job derives from, if any.
    fn source_message_id(&self) -> Option<String>;

    /// Post (or rewrite) the status message; returns its identifier.
    async fn announce(&self, text: &str) -> Result<String>;

    /// Rewrite the status message with a progress report.
    async fn progress(&self, update: ProgressUpdate) -> Result<()>;

    /// Replace the status message with the finished result.
    async fn finish(&self, text: &str, png: Vec<u8>, actions: &[FollowUpAction]) -> Result<()>;

    /// Replace the status message with a failure notice.
    async fn fail(&self, text: &str) -> Result<()>;
}

/// Telegram-backed origin handle: one status message per job, edited in
/// place, finally deleted in favor of the photo reply carrying the buttons.
pub struct TelegramOrigin {
    bot: Bot,
    chat_id: ChatId,
    interaction_id: String,
    member_id: String,
    source_message_id: Option<String>,
    reply_to: Option<MessageId>,
    status_message: Mutex<Option<MessageId>>,
}

impl TelegramOrigin {
    /// Origin for a fresh `/imagine` request.
    pub fn for_request(bot: Bot, chat_id: ChatId, user_id: u64, request_msg: MessageId) -> Self {
        Self {
            bot,
            chat_id,
            interaction_id: request_msg.0.to_string(),
            member_id: user_id.to_string(),
            source_message_id: None,
            reply_to: Some(request_msg),
            status_message: Mutex::new(None),
        }
    }

    /// Origin for a follow-up button press on an earlier result.
    pub fn for_callback(
        bot: Bot,
        chat_id: ChatId,
        user_id: u64,
        callback_id: &str,
        source_message_id: String,
    ) -> Self {
        Self {
            bot,
            chat_id,
            interaction_id: callback_id.to_string(),
            member_id: user_id.to_string(),
            source_message_id: Some(source_message_id),
            reply_to: None,
            status_message: Mutex::new(None),
        }
    }

    fn status_id(&self) -> Option<MessageId> {
        *self.status_message.lock()
    }

    async fn upsert_status(&self, text: &str) -> Result<MessageId> {
        if let Some(id) = self.status_id() {
            self.bot
                .edit_message_text(self.chat_id, id, text)
                .await
                .context("failed to edit status message")?;
            return Ok(id);
        }

        let mut req = self.bot.send_message(self.chat_id, text);
        if let Some(reply_to) = self.reply_to {
            req = req.reply_to_message_id(reply_to);
        }
        let sent = req.await.context("failed to send status message")?;
        *self.status_message.lock() = Some(sent.id);
        Ok(sent.id)
    }
}

fn keyboard_for(actions: &[FollowUpAction], message_key: &str) -> InlineKeyboardMarkup {
    // Original layout: re-roll + variations on top, upscales below.
    let (upscales, rest): (Vec<_>, Vec<_>) = actions
        .iter()
        .partition(|a| matches!(a, FollowUpAction::Upscale(_)));
    let row = |actions: Vec<&FollowUpAction>| {
        actions
            .into_iter()
            .map(|a| InlineKeyboardButton::callback(a.label(), a.callback_data(message_key)))
            .collect::<Vec<_>>()
    };
    let mut rows = Vec::new();
    if !rest.is_empty() {
        rows.push(row(rest));
    }
    if !upscales.is_empty() {
        rows.push(row(upscales));
    }
    InlineKeyboardMarkup::new(rows)
}

#[async_trait]
impl OriginHandle for TelegramOrigin {
    fn interaction_id(&self) -> String {
        self.interaction_id.clone()
    }

    fn member_id(&self) -> String {
        self.member_id.clone()
    }

    fn source_message_id(&self) -> Option<String> {
        self.source_message_id.clone()
    }

    async fn announce(&self, text: &str) -> Result<String> {
        let id = self.upsert_status(text).await?;
        Ok(id.0.to_string())
    }

    async fn progress(&self, update: ProgressUpdate) -> Result<()> {
        // Identical consecutive percentages make Telegram reject the edit;
        // that is not worth surfacing.
        if let Err(err) = self.upsert_status(&update.render_text()).await {
            debug!(?err, "progress edit rejected");
        }
        Ok(())
    }

    async fn finish(&self, text: &str, png: Vec<u8>, actions: &[FollowUpAction]) -> Result<()> {
        let status_id = self.status_id();
        let message_key = status_id
            .map(|id| id.0.to_string())
            .unwrap_or_else(|| self.interaction_id.clone());

        let mut req = self
            .bot
            .send_photo(self.chat_id, InputFile::memory(png).file_name("imagine.png"))
            .caption(text);
        if !actions.is_empty() {
            req = req.reply_markup(keyboard_for(actions, &message_key));
        }
        req.await.context("failed to send result photo")?;

        if let Some(id) = status_id {
            // The result photo replaces the progress message.
            let _ = self.bot.delete_message(self.chat_id, id).await;
        }
        Ok(())
    }

    async fn fail(&self, text: &str) -> Result<()> {
        self.upsert_status(text).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_offers_nine_actions() {
        let actions = FollowUpAction::grid();
        assert_eq!(actions.len(), 9);
        assert_eq!(actions[0], FollowUpAction::Reroll);
        assert!(actions.contains(&FollowUpAction::Variation(4)));
        assert!(actions.contains(&FollowUpAction::Upscale(1)));
    }

    #[test]
    fn callback_data_round_trips() {
        for action in FollowUpAction::grid() {
            let data = action.callback_data("4711");
            let (parsed, key) = FollowUpAction::parse_callback_data(&data).unwrap();
            assert_eq!(parsed, action);
            assert_eq!(key, "4711");
        }
    }

    #[test]
    fn callback_data_rejects_garbage() {
        assert!(FollowUpAction::parse_callback_data("imagine_reroll").is_none());
        assert!(FollowUpAction::parse_callback_data("imagine_upscale_9:1").is_none());
        assert!(FollowUpAction::parse_callback_data("imagine_resize_1:1").is_none());
        assert!(FollowUpAction::parse_callback_data("other:1").is_none());
    }

    #[test]
    fn progress_text_per_phase() {
        let update = ProgressUpdate {
            phase: ProgressPhase::Render,
            fraction: 0.42,
        };
        assert_eq!(update.render_text(), "Dreaming it up... 42% complete.");

        let update = ProgressUpdate {
            phase: ProgressPhase::Upscale,
            fraction: 1.2,
        };
        assert_eq!(update.render_text(), "Upscaling... 100% complete.");
    }
}
