//! Best-effort English rewrite of commit messages.
//!
//! Commit messages derive from user instructions, which may be in any
//! language. When an Anthropic API key is configured, non-English messages
//! are rewritten via the messages API; any failure keeps the original text.

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::constants::ANTHROPIC_API_VERSION;

#[derive(Debug, Clone)]
pub struct CommitMessageTranslator {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

/// Rough non-English detection: a meaningful share of non-ASCII letters.
pub fn looks_non_english(text: &str) -> bool {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        return false;
    }
    let non_ascii = letters.iter().filter(|c| !c.is_ascii()).count();
    non_ascii * 4 >= letters.len()
}

impl CommitMessageTranslator {
    pub fn from_config(config: &AgentConfig) -> Option<Self> {
        let api_key = config.anthropic_api_key.clone()?;
        Some(Self {
            http: reqwest::Client::new(),
            api_key,
            base_url: config.anthropic_base_url.clone(),
            model: config.translation_model.clone(),
        })
    }

    /// Return an English version of `message`, or the original when it is
    /// already English or translation fails.
    pub async fn ensure_english(&self, message: &str) -> String {
        if !looks_non_english(message) {
            return message.to_string();
        }
        match self.translate(message).await {
            Ok(translated) if !translated.trim().is_empty() => translated,
            Ok(_) => message.to_string(),
            Err(e) => {
                warn!("Commit message translation failed, keeping original: {e}");
                message.to_string()
            }
        }
    }

    async fn translate(&self, message: &str) -> crate::Result<String> {
        debug!("Translating commit message to English");
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .json(&json!({
                "model": self.model,
                "max_tokens": 300,
                "messages": [{
                    "role": "user",
                    "content": format!(
                        "Rewrite this git commit message in English. Keep the \
                         subject/body structure. Reply with the message only.\n\n{message}"
                    )
                }]
            }))
            .send()
            .await?
            .error_for_status()?;

        let parsed: MessagesResponse = response.json().await?;
        Ok(parsed
            .content
            .first()
            .map(|block| block.text.trim().to_string())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_messages_are_left_alone() {
        assert!(!looks_non_english("Add add(a, b) function"));
        assert!(!looks_non_english("fix: update CI config (#42)"));
        assert!(!looks_non_english("1234 !!"));
    }

    #[test]
    fn non_ascii_heavy_messages_are_flagged() {
        assert!(looks_non_english("関数を追加する"));
        assert!(looks_non_english("добавить функцию сложения"));
        // Mostly English with an accented name stays English.
        assert!(!looks_non_english("Rename helper after Café review feedback"));
    }
}
