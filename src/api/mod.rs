//! HTTP API for the LifeGuard node.
//! Endpoints for the device to push sensor data and for the driver UI to
//! drive the alert cycle.

pub mod websocket;

use axum::{
    extract::{Path, State, Json},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::session::runtime::SessionRuntime;
use crate::session::SessionError;
use crate::types::{AccelerationReading, Position, Profile, Recipient, TriggerReason};

/// Shared application state
pub type AppState = Arc<SessionRuntime>;

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }
}

impl ApiResponse<()> {
    pub fn err(msg: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(msg.into()) }
    }
}

fn reply<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::ok(data))).into_response()
}

fn reject(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiResponse::<()>::err(msg))).into_response()
}

fn session_error(e: SessionError) -> Response {
    let status = match e {
        SessionError::AlreadyRegistered => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    };
    reject(status, e.to_string())
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        // Device input
        .route("/register", post(register))
        .route("/motion", post(submit_motion))
        .route("/location", post(submit_location))
        .route("/config/threshold", put(set_threshold))
        // Alert cycle controls
        .route("/alert/trigger", post(trigger_alert))
        .route("/alert/cancel", post(cancel_alert))
        .route("/alert/dispatch", post(dispatch_now))
        .route("/alert/confirm", post(confirm_alert))
        .route("/alert/acknowledge/:recipient", post(acknowledge))
        .route("/alert/send/:recipient", post(send_message))
        .route("/alert/resume", post(resume_monitoring))
        // Live updates
        .route("/ws", get(websocket::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    /// Whether messages come from the generator or only from templates
    generator_online: bool,
    ws_subscribers: usize,
}

/// Health check endpoint
async fn health_check(State(runtime): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::ok(Health {
        status: "LifeGuard node is alive",
        generator_online: runtime.dispatcher_online(),
        ws_subscribers: runtime.broadcaster().subscriber_count(),
    }))
}

/// Current session view
async fn get_status(State(runtime): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::ok(runtime.view().await))
}

/// Register the driver profile
async fn register(
    State(runtime): State<AppState>,
    Json(profile): Json<Profile>,
) -> Response {
    match runtime.register(profile).await {
        Ok(()) => reply(runtime.view().await),
        Err(e) => session_error(e),
    }
}

#[derive(Serialize)]
struct TriggerResponse {
    triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    cycle_id: Option<u64>,
}

impl From<Option<u64>> for TriggerResponse {
    fn from(cycle_id: Option<u64>) -> Self {
        Self { triggered: cycle_id.is_some(), cycle_id }
    }
}

/// Submit one accelerometer sample
async fn submit_motion(
    State(runtime): State<AppState>,
    Json(reading): Json<AccelerationReading>,
) -> Response {
    let started = runtime.ingest_motion(reading).await;
    reply(TriggerResponse::from(started))
}

/// Reject coordinates outside WGS84 bounds
fn validate_position(position: &Position) -> Result<(), String> {
    if !position.latitude.is_finite() || position.latitude.abs() > 90.0 {
        return Err(format!("Latitude out of range: {}", position.latitude));
    }
    if !position.longitude.is_finite() || position.longitude.abs() > 180.0 {
        return Err(format!("Longitude out of range: {}", position.longitude));
    }
    Ok(())
}

/// Push a position fix; evaluated on the next location poll
async fn submit_location(
    State(runtime): State<AppState>,
    Json(position): Json<Position>,
) -> Response {
    if let Err(e) = validate_position(&position) {
        return reject(StatusCode::BAD_REQUEST, e);
    }
    runtime.push_fix(position);
    reply(position)
}

#[derive(Deserialize)]
struct ThresholdRequest {
    gforce: f64,
}

/// Adjust the impact threshold
async fn set_threshold(
    State(runtime): State<AppState>,
    Json(req): Json<ThresholdRequest>,
) -> Response {
    match runtime.set_threshold(req.gforce).await {
        Ok(()) => reply(runtime.view().await),
        Err(e) => session_error(e),
    }
}

/// Manual "simulate impact" trigger
async fn trigger_alert(State(runtime): State<AppState>) -> Response {
    match runtime.trigger_manual(TriggerReason::Impact).await {
        Some(cycle_id) => reply(TriggerResponse::from(Some(cycle_id))),
        None => reject(StatusCode::CONFLICT, "Not monitoring"),
    }
}

/// Map an accepted/rejected transition to a response
async fn transition(runtime: &AppState, accepted: bool, rejected: &str) -> Response {
    if accepted {
        reply(runtime.view().await)
    } else {
        reject(StatusCode::CONFLICT, rejected)
    }
}

async fn cancel_alert(State(runtime): State<AppState>) -> Response {
    let accepted = runtime.cancel().await;
    transition(&runtime, accepted, "No countdown to cancel").await
}

async fn dispatch_now(State(runtime): State<AppState>) -> Response {
    let accepted = runtime.force_dispatch().await;
    transition(&runtime, accepted, "No countdown to skip").await
}

async fn confirm_alert(State(runtime): State<AppState>) -> Response {
    let accepted = runtime.confirm().await;
    transition(&runtime, accepted, "Messages not sent yet").await
}

async fn acknowledge(
    State(runtime): State<AppState>,
    Path(recipient): Path<Recipient>,
) -> Response {
    let accepted = runtime.acknowledge(recipient).await;
    transition(&runtime, accepted, "Not confirming delivery").await
}

/// Hand one message to the platform messenger again
async fn send_message(
    State(runtime): State<AppState>,
    Path(recipient): Path<Recipient>,
) -> Response {
    #[derive(Serialize)]
    struct IntentResponse {
        to: String,
        body: String,
        uri: String,
    }

    match runtime.send_to(recipient).await {
        Some(intent) => reply(IntentResponse {
            uri: intent.uri(),
            to: intent.to,
            body: intent.body,
        }),
        None => reject(StatusCode::CONFLICT, "No message available"),
    }
}

async fn resume_monitoring(State(runtime): State<AppState>) -> Response {
    let accepted = runtime.resume().await;
    transition(&runtime, accepted, "Alert cycle still open").await
}

/// Start the API server
pub async fn start_server(state: AppState, addr: &str) -> anyhow::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("🌐 API server listening on {}", addr);
    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_validation() {
        assert!(validate_position(&Position::new(12.97, 77.59)).is_ok());
        assert!(validate_position(&Position::new(-90.0, 180.0)).is_ok());
        assert!(validate_position(&Position::new(91.0, 0.0)).is_err());
        assert!(validate_position(&Position::new(0.0, -181.0)).is_err());
        assert!(validate_position(&Position::new(f64::NAN, 0.0)).is_err());
    }

    #[test]
    fn test_envelope_shape() {
        let ok = serde_json::to_value(ApiResponse::ok(TriggerResponse::from(Some(3)))).unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["data"]["cycle_id"], 3);
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(ApiResponse::<()>::err("nope")).unwrap();
        assert_eq!(err["success"], false);
        assert_eq!(err["error"], "nope");
        assert!(err.get("data").is_none());
    }

    #[test]
    fn test_recipient_path_segment() {
        let r: Recipient = serde_json::from_str("\"ambulance\"").unwrap();
        assert_eq!(r, Recipient::Ambulance);
        assert!(serde_json::from_str::<Recipient>("\"police\"").is_err());
    }
}
