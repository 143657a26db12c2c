//! Alert delivery backends.
//!
//! Backends are deliberately synchronous and self-contained: the sentinel
//! fires when the normal pulse path is untrustworthy, so delivery must not
//! depend on the daemon's async runtime, store, or executor being healthy.
//! Every backend catches its own failures and answers with a plain bool.

use std::time::Duration;

use reeve_domain::config::Config;

/// Telegram's hard per-message character limit.
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// A channel that can deliver one out-of-band message.
///
/// Implementations must never panic or return an error from `send`;
/// failure is `false`.
pub trait AlertBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deliver `message`, truncating to the platform limit. Never raises.
    fn send(&self, message: &str) -> bool;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Telegram
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Delivery over the Telegram Bot API.
///
/// The HTTP client is built per call, on the calling (blocking) thread,
/// so no long-lived runtime state is involved.
pub struct TelegramBackend {
    bot_token: String,
    chat_id: String,
}

impl TelegramBackend {
    pub fn from_config(config: &Config) -> Option<Self> {
        match (&config.telegram_bot_token, &config.telegram_chat_id) {
            (Some(bot_token), Some(chat_id)) => Some(Self {
                bot_token: bot_token.clone(),
                chat_id: chat_id.clone(),
            }),
            _ => None,
        }
    }
}

impl AlertBackend for TelegramBackend {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn send(&self, message: &str) -> bool {
        let text: String = message.chars().take(TELEGRAM_MESSAGE_LIMIT).collect();
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);

        let client = match reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "sentinel: building HTTP client failed");
                return false;
            }
        };

        let body = serde_json::json!({ "chat_id": self.chat_id, "text": text });
        match client.post(&url).json(&body).send() {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "sentinel: telegram rejected alert");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "sentinel: telegram alert failed");
                false
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve a backend by name, or auto-detect by probing the registry in
/// order. Returns `None` when nothing is configured.
pub fn backend_from_config(config: &Config) -> Option<Box<dyn AlertBackend>> {
    match config.sentinel_backend.as_deref() {
        Some("telegram") => TelegramBackend::from_config(config)
            .map(|b| Box::new(b) as Box<dyn AlertBackend>),
        Some(other) => {
            tracing::warn!(backend = %other, "unknown sentinel backend");
            None
        }
        // Auto-detect: first configured backend wins.
        None => TelegramBackend::from_config(config).map(|b| {
            tracing::debug!(backend = b.name(), "auto-detected sentinel backend");
            Box::new(b) as Box<dyn AlertBackend>
        }),
    }
}
