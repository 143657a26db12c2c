//! Inbound bridge — long-polling Telegram listener.
//!
//! Continuously reads new messages from the Telegram Bot API, filters to
//! the single authorized chat, and posts each text message to the local
//! HTTP ingress as a CRITICAL pulse. The last processed update id is
//! persisted to a single-integer offset file (temp sibling + rename) so
//! restarts never re-process a message.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use reeve_domain::config::Config;

/// Server-side long-poll window.
const LONG_POLL_SECS: u64 = 100;
/// Client timeout must exceed the long-poll window.
const TELEGRAM_CLIENT_TIMEOUT: Duration = Duration::from_secs(120);
const API_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);
/// Consecutive errors before the bridge gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
const MAX_BACKOFF_SECS: u64 = 300;

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("{0} is required")]
    MissingConfig(&'static str),

    #[error("telegram authentication failed: {0}")]
    Auth(String),

    #[error("telegram API: {0}")]
    Http(#[from] reqwest::Error),

    #[error("giving up after {MAX_CONSECUTIVE_ERRORS} consecutive errors")]
    TooManyErrors,
}

pub struct TelegramBridge {
    bot_token: String,
    chat_id: String,
    api_url: String,
    api_token: String,
    offset_file: PathBuf,
    telegram: reqwest::Client,
    api: reqwest::Client,
    last_update_id: Option<i64>,
    error_count: u32,
}

impl TelegramBridge {
    pub fn new(config: &Config) -> Result<Self, BridgeError> {
        let bot_token = config
            .telegram_bot_token
            .clone()
            .ok_or(BridgeError::MissingConfig("TELEGRAM_BOT_TOKEN"))?;
        let chat_id = config
            .telegram_chat_id
            .clone()
            .ok_or(BridgeError::MissingConfig("TELEGRAM_CHAT_ID"))?;
        let api_token = config
            .api_token
            .clone()
            .ok_or(BridgeError::MissingConfig("PULSE_API_TOKEN"))?;

        Ok(Self {
            bot_token,
            chat_id,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_token,
            offset_file: config.offset_file(),
            telegram: reqwest::Client::builder()
                .timeout(TELEGRAM_CLIENT_TIMEOUT)
                .build()?,
            api: reqwest::Client::builder().timeout(API_CLIENT_TIMEOUT).build()?,
            last_update_id: None,
            error_count: 0,
        })
    }

    /// Run until shutdown. Fatal conditions: invalid credentials, or ten
    /// consecutive polling errors. The offset is saved on the way out.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), BridgeError> {
        self.last_update_id = load_offset(&self.offset_file);
        match self.last_update_id {
            Some(offset) => tracing::info!(offset, "loaded telegram offset"),
            None => tracing::info!("no saved offset, starting fresh"),
        }

        self.verify_bot_token().await?;

        tracing::info!("telegram polling loop started");
        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }

            match self.poll_once().await {
                Ok(()) => {
                    self.error_count = 0;
                    tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
                Err(fatal @ BridgeError::Auth(_)) => break Err(fatal),
                Err(e) => {
                    self.error_count += 1;
                    if self.error_count >= MAX_CONSECUTIVE_ERRORS {
                        tracing::error!(error = %e, "error budget exhausted");
                        break Err(BridgeError::TooManyErrors);
                    }
                    let backoff = backoff_secs(self.error_count);
                    tracing::error!(
                        error = %e,
                        attempt = self.error_count,
                        backoff_s = backoff,
                        "polling error, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                    }
                }
            }
        };

        if let Some(offset) = self.last_update_id {
            if let Err(e) = save_offset(&self.offset_file, offset) {
                tracing::error!(error = %e, "saving offset on shutdown failed");
            } else {
                tracing::info!(offset, "saved final offset");
            }
        }
        tracing::info!("telegram polling loop stopped");
        result
    }

    /// Startup credential probe; an invalid token is fatal.
    async fn verify_bot_token(&self) -> Result<(), BridgeError> {
        let url = format!("https://api.telegram.org/bot{}/getMe", self.bot_token);
        let response = self.telegram.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::NOT_FOUND
        {
            return Err(BridgeError::Auth(format!("getMe returned {}", response.status())));
        }
        let data: Value = response.json().await?;
        if !data.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            let detail = data
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(BridgeError::Auth(detail.to_string()));
        }
        let username = data
            .pointer("/result/username")
            .and_then(Value::as_str)
            .unwrap_or("?");
        tracing::info!(bot = %username, "telegram bot verified");
        Ok(())
    }

    /// One long-poll cycle: fetch updates, process the batch, persist the
    /// advanced offset.
    async fn poll_once(&mut self) -> Result<(), BridgeError> {
        let updates = match self.get_updates().await {
            Ok(updates) => updates,
            // The long-poll window closing without traffic is a no-op.
            Err(BridgeError::Http(e)) if e.is_timeout() => {
                tracing::debug!("long poll timed out with no messages");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if updates.is_empty() {
            return Ok(());
        }

        for update in &updates {
            if let Some(prompt) = pulse_prompt(update, &self.chat_id) {
                match self.trigger_pulse(&prompt).await {
                    Some(pulse_id) => tracing::info!(pulse_id, "triggered pulse from telegram"),
                    None => tracing::error!("failed to trigger pulse for telegram message"),
                }
            }
            // The offset advances past every update, processed or filtered.
            advance_offset(&mut self.last_update_id, update);
        }

        if let Some(offset) = self.last_update_id {
            // An offset write failure is logged, not fatal: the rename is
            // retried after the next batch and duplicates are tolerable.
            match save_offset(&self.offset_file, offset) {
                Ok(()) => tracing::debug!(count = updates.len(), offset, "processed update batch"),
                Err(e) => tracing::error!(error = %e, "offset write failed"),
            }
        }
        Ok(())
    }

    async fn get_updates(&self) -> Result<Vec<Value>, BridgeError> {
        let url = format!("https://api.telegram.org/bot{}/getUpdates", self.bot_token);
        let mut request = self
            .telegram
            .get(&url)
            .query(&[("timeout", LONG_POLL_SECS.to_string())]);
        if let Some(offset) = self.last_update_id {
            request = request.query(&[("offset", offset.to_string())]);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::NOT_FOUND {
            return Err(BridgeError::Auth(format!("getUpdates returned {status}")));
        }
        if status.is_server_error() {
            tracing::warn!(status = %status, "telegram server error");
            return Ok(Vec::new());
        }

        let data: Value = response.json().await?;
        if !data.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            tracing::warn!("telegram answered ok=false");
            return Ok(Vec::new());
        }
        Ok(data
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Post a CRITICAL pulse to the local ingress. Delivery failure is
    /// logged, not fatal; the message is acknowledged either way.
    async fn trigger_pulse(&self, prompt: &str) -> Option<i64> {
        let url = format!("{}/api/pulse/schedule", self.api_url);
        let payload = serde_json::json!({
            "prompt": prompt,
            "scheduled_at": "now",
            "priority": "critical",
            "source": "telegram",
            "tags": ["telegram", "user_message"],
        });

        let response = self
            .api
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let data: Value = resp.json().await.ok()?;
                data.get("pulse_id").and_then(Value::as_i64)
            }
            Ok(resp) => {
                tracing::error!(status = %resp.status(), "pulse API rejected schedule request");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "posting pulse failed");
                None
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Update handling (pure)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decide whether an update becomes a pulse, and with which prompt.
/// Filters: no message body, unauthorized chat, non-text content.
pub fn pulse_prompt(update: &Value, authorized_chat_id: &str) -> Option<String> {
    let message = update.get("message")?;

    let chat_id = message.pointer("/chat/id")?;
    let chat_id = match chat_id {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    if chat_id != authorized_chat_id {
        tracing::warn!(chat_id = %chat_id, "ignoring message from unauthorized chat");
        return None;
    }

    // Photos, stickers, and the like carry no text.
    let text = message.get("text").and_then(Value::as_str)?;

    let first_name = message
        .pointer("/from/first_name")
        .and_then(Value::as_str)
        .unwrap_or("User");
    let mut sender = first_name.to_string();
    if let Some(username) = message.pointer("/from/username").and_then(Value::as_str) {
        sender.push_str(&format!(" (@{username})"));
    }

    Some(format!("Telegram message from {sender}: {text}"))
}

/// Advance past this update: `offset = update_id + 1`.
pub fn advance_offset(last_update_id: &mut Option<i64>, update: &Value) {
    if let Some(update_id) = update.get("update_id").and_then(Value::as_i64) {
        let next = update_id + 1;
        *last_update_id = Some(last_update_id.map_or(next, |cur| cur.max(next)));
    }
}

/// Exponential backoff, capped at five minutes.
pub fn backoff_secs(error_count: u32) -> u64 {
    2u64.saturating_pow(error_count).min(MAX_BACKOFF_SECS)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Offset file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read the saved offset: a single integer plus newline.
pub fn load_offset(path: &Path) -> Option<i64> {
    let content = std::fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse() {
        Ok(offset) => Some(offset),
        Err(_) => {
            tracing::warn!(path = %path.display(), "offset file is not an integer, ignoring");
            None
        }
    }
}

/// Atomic write: temp sibling then rename, so a crash mid-write leaves
/// the previous offset intact.
pub fn save_offset(path: &Path, offset: i64) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, format!("{offset}\n"))?;
    std::fs::rename(&tmp, path)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn text_update(update_id: i64, chat_id: i64, text: &str) -> Value {
        serde_json::json!({
            "update_id": update_id,
            "message": {
                "message_id": 1,
                "from": { "id": chat_id, "first_name": "Alice", "username": "alice123" },
                "chat": { "id": chat_id, "type": "private" },
                "text": text,
            }
        })
    }

    #[test]
    fn prompt_includes_sender_and_text() {
        let update = text_update(7, 12345, "hello reeve");
        let prompt = pulse_prompt(&update, "12345").unwrap();
        assert_eq!(prompt, "Telegram message from Alice (@alice123): hello reeve");
    }

    #[test]
    fn prompt_without_username() {
        let update = serde_json::json!({
            "update_id": 7,
            "message": {
                "from": { "id": 12345, "first_name": "Bob" },
                "chat": { "id": 12345 },
                "text": "ping",
            }
        });
        let prompt = pulse_prompt(&update, "12345").unwrap();
        assert_eq!(prompt, "Telegram message from Bob: ping");
    }

    #[test]
    fn unauthorized_chat_is_filtered() {
        let update = text_update(7, 99999, "hello");
        assert!(pulse_prompt(&update, "12345").is_none());
    }

    #[test]
    fn non_text_and_empty_updates_are_filtered() {
        let photo = serde_json::json!({
            "update_id": 8,
            "message": { "chat": { "id": 12345 }, "photo": [{}] }
        });
        assert!(pulse_prompt(&photo, "12345").is_none());

        let bodyless = serde_json::json!({ "update_id": 9 });
        assert!(pulse_prompt(&bodyless, "12345").is_none());
    }

    #[test]
    fn offset_advances_past_filtered_updates() {
        let mut offset = None;
        // Unauthorized chat: no pulse, but the update is still acknowledged.
        let update = text_update(41, 99999, "ignored");
        assert!(pulse_prompt(&update, "12345").is_none());
        advance_offset(&mut offset, &update);
        assert_eq!(offset, Some(42));
    }

    #[test]
    fn offset_never_regresses() {
        let mut offset = Some(100);
        advance_offset(&mut offset, &text_update(41, 1, "old"));
        assert_eq!(offset, Some(100));
        advance_offset(&mut offset, &text_update(120, 1, "new"));
        assert_eq!(offset, Some(121));
    }

    #[test]
    fn offset_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telegram_offset.txt");
        save_offset(&path, 123456).unwrap();
        assert_eq!(load_offset(&path), Some(123456));
        // File format: single integer + newline.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "123456\n");
    }

    #[test]
    fn interrupted_save_keeps_previous_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telegram_offset.txt");
        save_offset(&path, 100).unwrap();

        // A crash after the temp write but before the rename leaves the
        // temp sibling around and the real file untouched.
        std::fs::write(path.with_extension("tmp"), "999\n").unwrap();
        assert_eq!(load_offset(&path), Some(100));
    }

    #[test]
    fn missing_or_garbage_offset_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telegram_offset.txt");
        assert_eq!(load_offset(&path), None);

        std::fs::write(&path, "not-a-number\n").unwrap();
        assert_eq!(load_offset(&path), None);

        std::fs::write(&path, "\n").unwrap();
        assert_eq!(load_offset(&path), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_secs(1), 2);
        assert_eq!(backoff_secs(2), 4);
        assert_eq!(backoff_secs(5), 32);
        assert_eq!(backoff_secs(8), 256);
        assert_eq!(backoff_secs(9), 300, "capped at five minutes");
        assert_eq!(backoff_secs(30), 300);
    }
}
