//! Prompt sanitization and aspect-ratio extraction.

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static AR_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s?--ar (\d+):(\d+)\s?").expect("valid aspect-ratio regex"));

const EMDASH: char = '\u{2014}';

/// Mobile keyboards autocorrect `--` into an em dash; undo that before
/// matching directives.
pub(crate) fn fix_em_dash(prompt: &str) -> String {
    prompt.replace(EMDASH, "--")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptDimensions {
    pub sanitized_prompt: String,
    pub width: i64,
    pub height: i64,
}

/// Round up to the next multiple of 8, the step the backend samples at.
fn round_up_to_eight(value: i64) -> i64 {
    (value + 7) & !7
}

/// Find an `--ar W:H` directive, strip it from the prompt, and scale the
/// shorter default dimension up to match the requested ratio.
pub(crate) fn extract_dimensions(
    prompt: &str,
    default_width: i64,
    default_height: i64,
) -> Result<PromptDimensions> {
    let prompt = fix_em_dash(prompt);

    let mut width = default_width;
    let mut height = default_height;

    let Some(caps) = AR_REGEX.captures(&prompt) else {
        return Ok(PromptDimensions {
            sanitized_prompt: prompt,
            width,
            height,
        });
    };

    let first: i64 = caps[1].parse().context("invalid aspect-ratio width")?;
    let second: i64 = caps[2].parse().context("invalid aspect-ratio height")?;
    if first == 0 || second == 0 {
        return Err(anyhow!("aspect ratio must not contain zero"));
    }

    let sanitized = AR_REGEX.replace_all(&prompt, "").into_owned();

    if first > second {
        let scaled = default_height as f64 * (first as f64 / second as f64);
        width = round_up_to_eight(scaled as i64);
    } else if second > first {
        let scaled = default_width as f64 * (second as f64 / first as f64);
        height = round_up_to_eight(scaled as i64);
    }

    Ok(PromptDimensions {
        sanitized_prompt: sanitized,
        width,
        height,
    })
}
