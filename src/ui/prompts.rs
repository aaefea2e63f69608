//! Confirmation prompt with CI fallback

use super::context::UiContext;
use crate::error::{ImgdepsError, ImgdepsResult};

/// Ask for confirmation. `--yes` approves; without a terminal the default wins.
pub async fn confirm(ctx: &UiContext, message: &str, default: bool) -> ImgdepsResult<bool> {
    if ctx.auto_yes() {
        if !ctx.is_machine() {
            println!("  {} (auto-approved)", message);
        }
        return Ok(true);
    }

    if !ctx.is_interactive() {
        return Ok(default);
    }

    // cliclack blocks on the terminal
    let message = message.to_string();
    let answer = tokio::task::spawn_blocking(move || {
        cliclack::confirm(&message).initial_value(default).interact()
    })
    .await
    .map_err(|e| ImgdepsError::Internal(format!("prompt task failed: {}", e)))?;

    answer.map_err(|e| ImgdepsError::User(format!("Prompt cancelled: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn confirm_auto_yes() {
        let ctx = UiContext::non_interactive().with_auto_yes(true);
        assert!(confirm(&ctx, "Remove 3 layers?", false).await.unwrap());
    }

    #[tokio::test]
    async fn confirm_non_interactive_default() {
        let ctx = UiContext::non_interactive();
        assert!(confirm(&ctx, "Remove?", true).await.unwrap());
        assert!(!confirm(&ctx, "Remove?", false).await.unwrap());
    }
}
