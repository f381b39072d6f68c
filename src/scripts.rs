//! Thin read API for scripts and their characters.
//!
//! The backend wraps every REST response in a status envelope; anything
//! other than `"success"` is treated as a failure.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClientError, Result};

/// Standard REST response envelope used by the game backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub status: String,
    // No serde(default): the derive would demand T: Default, and a
    // missing Option field already comes out as None
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

impl<T> ApiEnvelope<T> {
    /// Unwrap the payload, converting a non-success status into an error.
    pub fn into_data(self) -> Result<T> {
        if self.status == "success" {
            self.data.ok_or_else(|| {
                ClientError::Backend("success response without payload".to_string())
            })
        } else {
            Err(ClientError::Backend(
                self.message
                    .unwrap_or_else(|| format!("status {}", self.status)),
            ))
        }
    }
}

/// A murder-mystery script as stored by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// A playable or AI-driven character within a script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Read-only client for the script/character endpoints.
#[derive(Debug, Clone)]
pub struct ScriptApi {
    http: reqwest::Client,
    base_url: String,
}

impl ScriptApi {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub async fn fetch_script(&self, script_id: &str) -> Result<Script> {
        let url = format!("{}/scripts/{}", self.base_url, script_id);
        debug!("Fetching script from {}", url);
        let envelope: ApiEnvelope<Script> = self.http.get(&url).send().await?.json().await?;
        envelope.into_data()
    }

    pub async fn fetch_characters(&self, script_id: &str) -> Result<Vec<Character>> {
        let url = format!("{}/scripts/{}/characters", self.base_url, script_id);
        debug!("Fetching characters from {}", url);
        let envelope: ApiEnvelope<Vec<Character>> =
            self.http.get(&url).send().await?.json().await?;
        envelope.into_data()
    }
}
