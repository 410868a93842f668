pub mod calls;
pub mod config;
pub mod text;

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, TimeDelta, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::{self, JoinError};
use tower_http::trace::TraceLayer;
use wish_core::{
    Character, GameLogic, Gift, GiftId, RevealError, Revealed, SelectionMode, Summary,
};

use crate::calls::{CallError, CallPlacer, CallReceipt, CallRequest};
use crate::config::{Config, DEFAULT_SPECIAL_GIFTS};
use crate::text::{fallback_reveal_text, TextGenerator, DEFAULT_INTERESTS, REDACTED_DESCRIPTION};

pub const SERVICE_NAME: &str = "Wish Oracle Web Server";

/// Longest look-back accepted by `/api/recent_reveals`.
const MAX_RECENT_WINDOW_SECS: i64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealOptions {
    /// Gifts whose reveal places a celebration call; also revealed first by `/reveal_random`.
    pub special_gifts: Vec<GiftId>,
    /// Upper bound accepted for `present_id` at the webhook boundary.
    pub max_gift_id: GiftId,
    pub interests: Vec<String>,
}

impl Default for RevealOptions {
    fn default() -> Self {
        Self {
            special_gifts: DEFAULT_SPECIAL_GIFTS.to_vec(),
            max_gift_id: 30,
            interests: DEFAULT_INTERESTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl From<&Config> for RevealOptions {
    fn from(config: &Config) -> Self {
        Self {
            special_gifts: config.special_gifts.clone(),
            max_gift_id: config.max_gift_id,
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    logic: Arc<GameLogic>,
    text: Arc<dyn TextGenerator>,
    calls: Arc<dyn CallPlacer>,
    events: broadcast::Sender<ServerMessage>,
    options: Arc<RevealOptions>,
}

impl AppState {
    pub fn new(
        logic: Arc<GameLogic>,
        text: Arc<dyn TextGenerator>,
        calls: Arc<dyn CallPlacer>,
        options: RevealOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            logic,
            text,
            calls,
            events,
            options: Arc::new(options),
        }
    }

    pub fn logic(&self) -> &GameLogic {
        &self.logic
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.events.subscribe()
    }

    fn is_special(&self, gift_id: GiftId) -> bool {
        self.options.special_gifts.contains(&gift_id)
    }

    /// Publishes a successful reveal and kicks off the celebration call for special gifts.
    fn announce_reveal(&self, gift: &Gift, source: &'static str) {
        let special = self.is_special(gift.id);
        let _ = self.events.send(ServerMessage::Revealed(RevealEvent {
            gift: GiftView::from(gift),
            is_special_gift: special,
            source,
        }));

        if special {
            let state = self.clone();
            let request = CallRequest {
                present_id: Some(gift.id),
                custom_message: Some(format!("Disney magic is revealing gift #{}!", gift.id)),
            };
            tokio::spawn(async move {
                if let Ok(receipt) = state.place_call(request).await {
                    tracing::info!(call_id = %receipt.call_id, "celebration call placed");
                }
            });
        }
    }

    /// Runs a `GameLogic` operation that may write the snapshot on the blocking pool.
    async fn with_logic<T, F>(&self, op: F) -> Result<T, JoinError>
    where
        F: FnOnce(&GameLogic) -> T + Send + 'static,
        T: Send + 'static,
    {
        let logic = self.logic.clone();
        task::spawn_blocking(move || op(&logic)).await
    }

    /// Reserves the next caller profile, then places the call without holding
    /// the game lock.
    async fn place_call(&self, request: CallRequest) -> Result<CallReceipt, CallError> {
        let profile_count = self.calls.profile_count();
        let reserved = self
            .with_logic(move |logic| {
                logic.advance_rotation(profile_count).unwrap_or_else(|err| {
                    tracing::warn!("call rotation not persisted: {err}");
                    logic.rotation_index()
                })
            })
            .await;
        let rotation_index = match reserved {
            Ok(index) => index,
            Err(err) => {
                tracing::error!("rotation task failed: {err}");
                self.logic.rotation_index()
            }
        };
        self.calls.place_call(rotation_index, request).await
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/reveal_present", post(reveal_present))
        .route("/reveal_random", post(reveal_random))
        .route("/api/game_status", get(game_status))
        .route("/api/spin_wheel", post(spin_wheel))
        .route("/api/accept_gift", post(accept_gift))
        .route("/api/save_settings", post(save_settings))
        .route("/api/trigger_call", post(trigger_call))
        .route("/api/recent_reveals", get(recent_reveals))
        .route("/api/reset_game", post(reset_game))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GiftView {
    pub id: GiftId,
    pub description: String,
    pub themes: Vec<String>,
    pub image_path: String,
    pub revealed: bool,
    pub revealed_at: Option<DateTime<Utc>>,
    pub revealed_by: Option<String>,
}

impl From<&Gift> for GiftView {
    fn from(gift: &Gift) -> Self {
        Self {
            id: gift.id,
            description: gift.description.clone(),
            themes: gift.themes.clone(),
            image_path: gift.image_path.clone(),
            revealed: gift.is_revealed(),
            revealed_at: gift.revealed_at(),
            revealed_by: gift.revealed_by().map(str::to_string),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CharacterView {
    pub name: String,
    pub personality: String,
    pub voice_style: String,
    pub image_path: String,
}

impl From<&Character> for CharacterView {
    fn from(character: &Character) -> Self {
        Self {
            name: character.name.clone(),
            personality: character.personality.clone(),
            voice_style: character.voice_style.clone(),
            image_path: character.image_path.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusView {
    #[serde(flatten)]
    pub summary: Summary,
    pub available_gift_ids: Vec<GiftId>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct RevealEvent {
    pub gift: GiftView,
    pub is_special_gift: bool,
    pub source: &'static str,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status(StatusView),
    Revealed(RevealEvent),
    Reset,
}

fn status_view(logic: &GameLogic) -> StatusView {
    StatusView {
        summary: logic.summary(),
        available_gift_ids: logic.available_gifts().iter().map(|g| g.id).collect(),
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn task_failed(err: JoinError) -> Response {
    tracing::error!("game task failed: {err}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
}

fn reveal_error_response(err: RevealError) -> Response {
    match err {
        RevealError::NotFound(id) => {
            error_response(StatusCode::NOT_FOUND, format!("Gift {id} not found"))
        }
        RevealError::AlreadyRevealed {
            id,
            revealed_at,
            revealed_by,
        } => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": format!("Gift {id} has already been revealed"),
                "revealed_at": revealed_at,
                "revealed_by": revealed_by,
            })),
        )
            .into_response(),
        RevealError::Persistence(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to reveal gift")
        }
    }
}

/// Reads an integer id that may arrive as a JSON number or a numeric string.
fn parse_gift_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "active",
        "service": SERVICE_NAME,
        "endpoints": {
            "status": "GET /status",
            "reveal_present": "POST /reveal_present",
            "reveal_random": "POST /reveal_random",
            "health": "GET /health",
            "events": "GET /ws",
        }
    }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(status_view(&state.logic))
}

#[derive(Serialize)]
struct RevealResponse {
    success: bool,
    message: String,
    present_id: GiftId,
    status: &'static str,
    revealed_by: String,
    is_special_gift: bool,
    gift_description: String,
}

async fn reveal_present(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Ok(Json(payload)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "Request must be JSON");
    };
    let Some(raw_id) = payload.get("present_id") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing present_id field");
    };
    let Some(present_id) = parse_gift_id(raw_id) else {
        return error_response(StatusCode::BAD_REQUEST, "present_id must be an integer");
    };
    let max = state.options.max_gift_id;
    if present_id < 1 || present_id > i64::from(max) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("present_id must be between 1 and {max}"),
        );
    }
    let present_id = present_id as GiftId;

    let revealed = state
        .with_logic(move |logic| -> Result<Revealed, RevealError> {
            let gift = logic
                .find_by_id(present_id)
                .ok_or(RevealError::NotFound(present_id))?;
            let character = logic.best_match(&gift);
            let gift = logic.reveal(present_id, &character)?;
            Ok(Revealed { gift, character })
        })
        .await;

    match revealed {
        Ok(Ok(Revealed { gift, character })) => {
            tracing::info!(gift_id = present_id, "webhook reveal");
            state.announce_reveal(&gift, "webhook");
            Json(RevealResponse {
                success: true,
                message: format!("Gift {present_id} revealed successfully!"),
                present_id,
                status: "revealed",
                revealed_by: character.name,
                is_special_gift: state.is_special(present_id),
                gift_description: gift.description,
            })
            .into_response()
        }
        Ok(Err(err)) => reveal_error_response(err),
        Err(err) => task_failed(err),
    }
}

async fn reveal_random(State(state): State<AppState>) -> Response {
    let special_gifts = state.options.special_gifts.clone();
    let revealed = state
        .with_logic(move |logic| logic.reveal_next(None, &special_gifts))
        .await;

    match revealed {
        Ok(Ok(Some(revealed))) => {
            let gift = revealed.gift;
            state.announce_reveal(&gift, "webhook");
            Json(RevealResponse {
                success: true,
                message: format!("Gift {} revealed successfully!", gift.id),
                present_id: gift.id,
                status: "revealed",
                revealed_by: revealed.character.name,
                is_special_gift: state.is_special(gift.id),
                gift_description: gift.description,
            })
            .into_response()
        }
        Ok(Ok(None)) => error_response(StatusCode::NOT_FOUND, "No gifts available to reveal"),
        Ok(Err(err)) => reveal_error_response(err),
        Err(err) => task_failed(err),
    }
}

#[derive(Serialize)]
struct GameStatusResponse {
    success: bool,
    summary: Summary,
    available_gifts: Vec<GiftView>,
    all_gifts: Vec<GiftView>,
}

async fn game_status(State(state): State<AppState>) -> impl IntoResponse {
    let gifts = state.logic.gifts();
    Json(GameStatusResponse {
        success: true,
        summary: state.logic.summary(),
        available_gifts: gifts
            .iter()
            .filter(|g| !g.is_revealed())
            .map(GiftView::from)
            .collect(),
        all_gifts: gifts.iter().map(GiftView::from).collect(),
    })
}

#[derive(Deserialize)]
struct SpinRequest {
    gift_id: Option<GiftId>,
}

#[derive(Serialize)]
struct SpinResponse {
    success: bool,
    gift: GiftView,
    character: CharacterView,
    message: String,
}

/// Picks the narrator and message for a gift without revealing it; the UI
/// confirms through `/api/accept_gift`.
async fn spin_wheel(
    State(state): State<AppState>,
    payload: Result<Json<SpinRequest>, JsonRejection>,
) -> Response {
    let Some(gift_id) = payload.ok().and_then(|Json(body)| body.gift_id) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing gift_id");
    };
    let Some(gift) = state.logic.find_by_id(gift_id) else {
        return error_response(StatusCode::NOT_FOUND, format!("Gift {gift_id} not found"));
    };
    if gift.is_revealed() {
        return error_response(
            StatusCode::CONFLICT,
            format!("Gift {gift_id} already revealed"),
        );
    }

    let character = state.logic.best_match(&gift);
    let secret = Gift {
        description: REDACTED_DESCRIPTION.to_string(),
        ..gift.clone()
    };
    let generated = state
        .text
        .generate_reveal_text(&character, &secret, &state.options.interests)
        .await;
    let message = generated.unwrap_or_else(|err| {
        tracing::warn!("using fallback reveal text: {err}");
        fallback_reveal_text(gift.id, REDACTED_DESCRIPTION, &mut rand::thread_rng())
    });

    Json(SpinResponse {
        success: true,
        gift: GiftView::from(&gift),
        character: CharacterView::from(&character),
        message,
    })
    .into_response()
}

#[derive(Deserialize)]
struct AcceptRequest {
    gift_id: Option<GiftId>,
    character_name: Option<String>,
}

async fn accept_gift(
    State(state): State<AppState>,
    payload: Result<Json<AcceptRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(AcceptRequest {
        gift_id: Some(gift_id),
        character_name: Some(character_name),
    })) = payload
    else {
        return error_response(StatusCode::BAD_REQUEST, "Missing gift_id or character_name");
    };

    if state.logic.find_by_id(gift_id).is_none() {
        return reveal_error_response(RevealError::NotFound(gift_id));
    }
    let Some(character) = state.logic.find_character_by_name(&character_name).cloned() else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("Character {character_name} not found"),
        );
    };

    let revealed = state
        .with_logic(move |logic| logic.reveal(gift_id, &character))
        .await;

    match revealed {
        Ok(Ok(gift)) => {
            state.announce_reveal(&gift, "web_interface");
            Json(json!({ "success": true, "message": "Gift revealed successfully" }))
                .into_response()
        }
        Ok(Err(err)) => reveal_error_response(err),
        Err(err) => task_failed(err),
    }
}

#[derive(Deserialize)]
struct SettingsRequest {
    mode: Option<String>,
}

async fn save_settings(
    State(state): State<AppState>,
    payload: Result<Json<SettingsRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(settings)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "No settings data provided");
    };

    if let Some(raw) = settings.mode {
        let mode: SelectionMode = match raw.parse() {
            Ok(mode) => mode,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, err),
        };
        match state.with_logic(move |logic| logic.set_mode(mode)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to save settings",
                )
            }
            Err(err) => return task_failed(err),
        }
    }

    Json(json!({ "success": true, "message": "Settings saved successfully" })).into_response()
}

#[derive(Deserialize, Default)]
struct TriggerCallRequest {
    gift_id: Option<GiftId>,
    message: Option<String>,
}

async fn trigger_call(
    State(state): State<AppState>,
    payload: Result<Json<TriggerCallRequest>, JsonRejection>,
) -> Response {
    let body = payload.map(|Json(body)| body).unwrap_or_default();
    let custom_message = body.message.or_else(|| {
        body.gift_id
            .map(|id| format!("Disney magic is revealing gift #{id}!"))
    });
    let result = state
        .place_call(CallRequest {
            present_id: body.gift_id,
            custom_message,
        })
        .await;

    let body = match result {
        Ok(receipt) => json!({
            "success": true,
            "call_id": receipt.call_id,
            "profile": receipt.profile,
            "status": "call_initiated",
        }),
        Err(err) => json!({
            "success": false,
            "error": err.to_string(),
            "message": "Failed to trigger character call",
        }),
    };
    Json(body).into_response()
}

#[derive(Deserialize)]
struct RecentParams {
    seconds: Option<i64>,
}

async fn recent_reveals(
    State(state): State<AppState>,
    Query(params): Query<RecentParams>,
) -> impl IntoResponse {
    let window = params
        .seconds
        .unwrap_or(10)
        .clamp(0, MAX_RECENT_WINDOW_SECS);
    let since = TimeDelta::try_seconds(window)
        .and_then(|delta| Utc::now().checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let recent: Vec<Value> = state
        .logic
        .recent_reveals(since)
        .iter()
        .map(|gift| {
            json!({
                "id": gift.id,
                "description": gift.description,
                "revealed_at": gift.revealed_at(),
                "revealed_by": gift.revealed_by(),
                "is_special_gift": state.is_special(gift.id),
            })
        })
        .collect();

    Json(json!({
        "success": true,
        "count": recent.len(),
        "recent_reveals": recent,
    }))
}

async fn reset_game(State(state): State<AppState>) -> Response {
    let result = match state.with_logic(|logic| logic.reset()).await {
        Ok(result) => result,
        Err(err) => return task_failed(err),
    };
    // Memory is reset even when the snapshot could not be deleted.
    let _ = state.events.send(ServerMessage::Reset);

    match result {
        Ok(()) => {
            Json(json!({ "success": true, "message": "Game reset successfully" })).into_response()
        }
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to reset game"),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(stream: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = stream.split();
    let mut rx = state.subscribe();

    let snapshot = ServerMessage::Status(status_view(&state.logic));
    if let Ok(text) = serde_json::to_string(&snapshot) {
        if sender.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            let msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "reveal feed subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // The feed is one-way; inbound frames only tell us when the client leaves.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}
