//! Reveal message generation through an OpenAI-compatible chat API, with
//! canned messages for when the API is unavailable.

use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wish_core::{Character, Gift, GiftId};

use crate::config::TextApiConfig;

/// Stands in for the gift description while the gift is still a secret.
pub const REDACTED_DESCRIPTION: &str = "a magical birthday surprise";

pub const DEFAULT_INTERESTS: [&str; 4] = ["birthday magic", "surprise", "wonder", "Disney dreams"];

const FALLBACK_REVEALS: [&str; 3] = [
    "🎁 The magic reveals itself! Open gift #{gift_id}: {gift_description}! ✨",
    "🌟 A mystical gift awaits! Time to unwrap #{gift_id}: {gift_description}! Make a wish! 🎂",
    "✨ The oracle has spoken! Your next treasure is gift #{gift_id}: {gift_description}! 🎉",
];

#[derive(Debug, Error)]
pub enum TextGenError {
    #[error("text generation is not configured")]
    NotConfigured,
    #[error("text generation request failed: {0}")]
    RequestFailed(String),
    #[error("invalid text generation response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// `gift` may carry a redacted description; implementations use whatever it holds.
    async fn generate_reveal_text(
        &self,
        character: &Character,
        gift: &Gift,
        interests: &[String],
    ) -> Result<String, TextGenError>;
}

pub fn fallback_reveal_text<R: Rng + ?Sized>(
    gift_id: GiftId,
    description: &str,
    rng: &mut R,
) -> String {
    let template = FALLBACK_REVEALS.choose(rng).copied().unwrap_or(FALLBACK_REVEALS[0]);
    template
        .replace("{gift_id}", &gift_id.to_string())
        .replace("{gift_description}", description)
}

pub fn reveal_prompt(character: &Character, gift: &Gift, interests: &[String]) -> String {
    format!(
        "You are {name}, a Disney character. {personality}\n\n\
         Create a fun, magical 50-70 word message revealing birthday gift #{id}: {description}.\n\n\
         Style guidelines:\n\
         - Use {voice} tone\n\
         - Include warm birthday wishes\n\
         - Reference the gift themes: {themes}\n\
         - Tie to these interests: {interests}\n\
         - End with excitement about the gift\n\
         - Use emojis sparingly\n\
         - Stay in character as {name}",
        name = character.name,
        personality = character.personality,
        id = gift.id,
        description = gift.description,
        voice = character.voice_style,
        themes = gift.themes.join(", "),
        interests = interests.join(", "),
    )
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct ChatCompletionsClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl ChatCompletionsClient {
    pub fn new(config: &TextApiConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[async_trait]
impl TextGenerator for ChatCompletionsClient {
    async fn generate_reveal_text(
        &self,
        character: &Character,
        gift: &Gift,
        interests: &[String],
    ) -> Result<String, TextGenError> {
        let api_key = self.api_key.as_deref().ok_or(TextGenError::NotConfigured)?;
        let prompt = reveal_prompt(character, gift, interests);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "You are a helpful, creative Disney character oracle.",
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.8,
            max_tokens: 200,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| TextGenError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TextGenError::RequestFailed(format!("{status}: {body}")));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| TextGenError::InvalidResponse(e.to_string()))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| TextGenError::InvalidResponse("no message content".into()))
    }
}
