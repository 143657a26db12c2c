//! Shared application state passed to all API handlers.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use reeve_domain::config::Config;

use crate::store::PulseStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: PulseStore,
    /// SHA-256 of the API bearer token, computed once at startup.
    /// `None` means the token is not configured; protected endpoints
    /// answer 500 rather than running open.
    pub api_token_hash: Option<Vec<u8>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, store: PulseStore) -> Self {
        let api_token_hash = match &config.api_token {
            Some(token) => Some(Sha256::digest(token.as_bytes()).to_vec()),
            None => {
                tracing::error!(
                    "PULSE_API_TOKEN is not set; all protected endpoints will refuse requests"
                );
                None
            }
        };
        Self {
            config,
            store,
            api_token_hash,
        }
    }
}
