//! Interactive confirmation prompts.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::Result;

#[async_trait]
pub trait Prompt: Send + Sync {
    /// Ask a yes/no question. An empty answer picks `default`.
    async fn confirm(&self, label: &str, default: bool) -> Result<bool>;
}

/// Reads answers from stdin, writing the question to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

/// Answers every prompt the same way; used for `--yes` and non-interactive runs.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

/// Interpret a typed answer.
pub fn parse_answer(input: &str, default: bool) -> Option<bool> {
    match input.trim().to_lowercase().as_str() {
        "" => Some(default),
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

#[async_trait]
impl Prompt for StdinPrompt {
    async fn confirm(&self, label: &str, default: bool) -> Result<bool> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let mut stderr = tokio::io::stderr();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            stderr
                .write_all(format!("{} {} ", label, hint).as_bytes())
                .await?;
            stderr.flush().await?;

            let Some(line) = lines.next_line().await? else {
                // EOF: not attached to a terminal
                return Ok(default);
            };
            if let Some(answer) = parse_answer(&line, default) {
                return Ok(answer);
            }
        }
    }
}

#[async_trait]
impl Prompt for AutoConfirm {
    async fn confirm(&self, label: &str, _default: bool) -> Result<bool> {
        log::debug!("Auto-answering prompt; label={}, answer={}", label, self.0);
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("", true), Some(true));
        assert_eq!(parse_answer("\n", false), Some(false));
        assert_eq!(parse_answer("Y", false), Some(true));
        assert_eq!(parse_answer(" yes ", false), Some(true));
        assert_eq!(parse_answer("no", true), Some(false));
        assert_eq!(parse_answer("maybe", true), None);
    }

    #[tokio::test]
    async fn test_auto_confirm() {
        assert!(AutoConfirm(true).confirm("Proceed?", false).await.unwrap());
        assert!(!AutoConfirm(false).confirm("Proceed?", true).await.unwrap());
    }
}
