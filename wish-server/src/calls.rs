//! Outbound celebration calls through a voice-call API.
//!
//! Calls rotate through a small list of caller profiles. The rotation position
//! lives in the persisted session and is reserved there before each call, so
//! it advances whether or not the call goes through;
//! [`CallPlacer::place_call`] only receives the reserved position.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;
use wish_core::GiftId;

use crate::config::CallApiConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallProfile {
    pub name: String,
    pub assistant_id: String,
    pub phone_number_id: String,
    #[serde(default)]
    pub phone_number: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallRequest {
    pub present_id: Option<GiftId>,
    pub custom_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallReceipt {
    pub call_id: String,
    pub profile: String,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call placement not configured: {0}")]
    NotConfigured(&'static str),
    #[error("call request failed: {0}")]
    RequestFailed(String),
    #[error("call rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

#[async_trait]
pub trait CallPlacer: Send + Sync {
    /// Number of caller profiles the rotation position cycles through.
    fn profile_count(&self) -> usize;

    async fn place_call(
        &self,
        rotation_index: u32,
        request: CallRequest,
    ) -> Result<CallReceipt, CallError>;
}

/// Reads caller profiles; a missing or unreadable file means no profiles.
pub fn load_profiles(path: impl AsRef<Path>) -> Vec<CallProfile> {
    let path = path.as_ref();
    let parsed = fs::read(path)
        .map_err(|e| e.to_string())
        .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()));
    match parsed {
        Ok(profiles) => profiles,
        Err(err) => {
            tracing::warn!("no call profiles loaded from {}: {err}", path.display());
            Vec::new()
        }
    }
}

#[derive(Clone)]
pub struct VoiceCallClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    destination: Option<String>,
    profiles: Vec<CallProfile>,
}

impl VoiceCallClient {
    pub fn new(config: &CallApiConfig, profiles: Vec<CallProfile>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            destination: config.destination.clone(),
            profiles,
        }
    }

    /// Profile for `rotation_index`; one with a malformed phone number id is
    /// replaced by the first profile.
    pub fn profile_for(&self, rotation_index: u32) -> Option<&CallProfile> {
        let first = self.profiles.first()?;
        let profile = &self.profiles[rotation_index as usize % self.profiles.len()];
        if Uuid::parse_str(&profile.phone_number_id).is_err() {
            tracing::warn!(
                profile = %profile.name,
                "invalid phone number id {}, falling back to {}",
                profile.phone_number_id,
                first.name
            );
            return Some(first);
        }
        Some(profile)
    }

    fn payload(&self, profile: &CallProfile, destination: &str, request: &CallRequest) -> Value {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let mut metadata = json!({
            "source": "wish_oracle",
            "birthday_call": true,
            "timestamp": timestamp,
            "profile": profile.name,
            "calling_from": profile.phone_number,
        });
        if let Some(present_id) = request.present_id {
            metadata["present_id"] = json!(present_id);
            metadata["gift_reveal"] = json!(true);
        }
        if let Some(message) = &request.custom_message {
            metadata["custom_message"] = json!(message);
        }

        json!({
            "assistantId": profile.assistant_id,
            "phoneNumberId": profile.phone_number_id,
            "customer": { "number": destination },
            "metadata": metadata,
        })
    }

    async fn send(
        &self,
        profile: &CallProfile,
        request: &CallRequest,
    ) -> Result<CallReceipt, CallError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(CallError::NotConfigured("missing API key"))?;
        let destination = self
            .destination
            .as_deref()
            .ok_or(CallError::NotConfigured("missing destination number"))?;
        if profile.assistant_id.is_empty() {
            return Err(CallError::NotConfigured("missing assistant id"));
        }

        tracing::info!(
            profile = %profile.name,
            present_id = ?request.present_id,
            "placing call from {}",
            profile.phone_number
        );

        let response = self
            .client
            .post(format!("{}/call", self.base_url))
            .bearer_auth(api_key)
            .json(&self.payload(profile, destination, request))
            .send()
            .await
            .map_err(|e| CallError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status != StatusCode::CREATED {
            let message = body
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(CallError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let call_id = body
            .get("id")
            .and_then(|id| id.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(CallReceipt {
            call_id,
            profile: profile.name.clone(),
        })
    }
}

#[async_trait]
impl CallPlacer for VoiceCallClient {
    fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    async fn place_call(
        &self,
        rotation_index: u32,
        request: CallRequest,
    ) -> Result<CallReceipt, CallError> {
        let result = match self.profile_for(rotation_index) {
            Some(profile) => self.send(profile, &request).await,
            None => Err(CallError::NotConfigured("no call profiles")),
        };
        if let Err(err) = &result {
            tracing::error!("call placement failed: {err}");
        }
        result
    }
}
