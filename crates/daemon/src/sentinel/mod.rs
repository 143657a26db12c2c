//! Sentinel — the failsafe alert path.
//!
//! Used only when normal delivery is untrustworthy (a pulse has burned its
//! whole retry budget). Alerts are deduplicated per caller-provided key by
//! zero-byte touch files whose mtime is the last-delivery timestamp, so
//! the cooldown survives restarts without touching the pulse store.

pub mod backends;

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use reeve_domain::config::Config;

use backends::{backend_from_config, AlertBackend};

/// Default per-key cooldown: 30 minutes.
pub const DEFAULT_COOLDOWN_SECS: u64 = 1800;

pub struct Sentinel {
    backend: Option<Box<dyn AlertBackend>>,
    state_dir: PathBuf,
}

impl Sentinel {
    /// Auto-detect the backend from configuration. A sentinel without a
    /// backend is valid; every alert just reports `false`.
    pub fn from_config(config: &Config) -> Self {
        let backend = backend_from_config(config);
        if backend.is_none() {
            tracing::warn!("no sentinel backend configured; failsafe alerts will be dropped");
        }
        Self {
            backend,
            state_dir: config.sentinel_dir(),
        }
    }

    /// Explicit backend + state directory (tests, unusual deployments).
    pub fn with_backend(backend: Box<dyn AlertBackend>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: Some(backend),
            state_dir: state_dir.into(),
        }
    }

    /// Deliver an alert, suppressed when the same `cooldown_key` delivered
    /// within `cooldown_seconds`. Synchronous and infallible by contract:
    /// returns `true` only on confirmed delivery.
    ///
    /// Async callers should hop through `spawn_blocking`; this path must
    /// not await on a runtime that may itself be wedged.
    pub fn alert(&self, message: &str, cooldown_key: Option<&str>, cooldown_seconds: u64) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };

        if let Some(key) = cooldown_key {
            if !self.cooldown_expired(key, cooldown_seconds) {
                tracing::debug!(key = %key, "alert suppressed by cooldown");
                return false;
            }
        }

        let delivered = backend.send(message);

        if delivered {
            tracing::info!(backend = backend.name(), "sentinel alert delivered");
            if let Some(key) = cooldown_key {
                self.touch_cooldown(key);
            }
        }

        delivered
    }

    fn cooldown_path(&self, key: &str) -> PathBuf {
        self.state_dir.join(format!(".cooldown_{}", sanitize_key(key)))
    }

    fn cooldown_expired(&self, key: &str, cooldown_seconds: u64) -> bool {
        let path = self.cooldown_path(key);
        match last_alert_age_secs(&path) {
            // Unreadable state must not block an alert.
            None => true,
            Some(age) => age >= cooldown_seconds,
        }
    }

    fn touch_cooldown(&self, key: &str) {
        if let Err(e) = std::fs::create_dir_all(&self.state_dir) {
            tracing::warn!(error = %e, "sentinel: creating state dir failed");
            return;
        }
        let path = self.cooldown_path(key);
        // Recreate to refresh the mtime; the file stays zero bytes.
        if let Err(e) = std::fs::write(&path, b"") {
            tracing::warn!(error = %e, key = %key, "sentinel: updating cooldown failed");
        }
    }
}

/// Seconds since the touch file's mtime; `None` if missing or unreadable.
fn last_alert_age_secs(path: &Path) -> Option<u64> {
    let mtime = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(mtime).ok().map(|d| d.as_secs())
}

/// Filesystem-safe cooldown key: anything outside `[A-Za-z0-9_-]` becomes `_`.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
