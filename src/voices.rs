//! Character-to-voice mapping cache.
//!
//! The mapping is fetched fresh on every (re)connect and replaced
//! wholesale. A failed fetch keeps the previous mapping (stale but
//! available), and `resolve` never fails: unmapped speakers fall back to
//! the default voice.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::scripts::ApiEnvelope;

#[derive(Debug, Deserialize)]
struct VoiceMappingPayload {
    mapping: HashMap<String, String>,
}

pub struct VoiceMappingCache {
    http: reqwest::Client,
    url: String,
    default_voice: String,
    mapping: RwLock<HashMap<String, String>>,
}

impl VoiceMappingCache {
    pub fn new(
        http: reqwest::Client,
        api_url: &str,
        default_voice: impl Into<String>,
    ) -> Self {
        Self {
            http,
            url: format!("{}/voices", api_url),
            default_voice: default_voice.into(),
            mapping: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch-and-replace. Any transport failure or non-success status is
    /// logged and the previous mapping retained.
    pub async fn refresh(&self) {
        let response = match self.http.get(&self.url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Voice mapping fetch failed, keeping stale mapping: {}", e);
                return;
            }
        };
        let envelope: ApiEnvelope<VoiceMappingPayload> = match response.json().await {
            Ok(env) => env,
            Err(e) => {
                warn!("Voice mapping response unreadable, keeping stale mapping: {}", e);
                return;
            }
        };
        match envelope.into_data() {
            Ok(payload) => self.replace(payload.mapping),
            Err(e) => {
                warn!("Voice mapping fetch rejected, keeping stale mapping: {}", e);
            }
        }
    }

    /// Replace the mapping wholesale (mappings are never merged).
    pub fn replace(&self, mapping: HashMap<String, String>) {
        info!("🗣️ Voice mapping replaced ({} characters)", mapping.len());
        *self.mapping.write().expect("voice mapping lock poisoned") = mapping;
    }

    /// Resolve a speaker to a voice id. Infallible: unmapped speakers get
    /// the default voice.
    pub fn resolve(&self, speaker: &str) -> String {
        let mapping = self.mapping.read().expect("voice mapping lock poisoned");
        match mapping.get(speaker) {
            Some(voice) => voice.clone(),
            None => {
                debug!("No voice for {:?}, using default", speaker);
                self.default_voice.clone()
            }
        }
    }
}
