//! HTTP handlers: health, TURN credentials, room inspection, push-token
//! registration

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::{Subject, APPLIANCE_SUBJECT};
use crate::error::Result;
use crate::signaling::{mint_ice_servers, ClientSummary, IceServersResponse, RoomOverview};
use crate::state::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Time-limited ICE server credentials for the authenticated subject
pub async fn ice_servers(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<Subject>,
) -> Result<Json<IceServersResponse>> {
    let user = match subject {
        Subject::Appliance => APPLIANCE_SUBJECT.to_string(),
        Subject::User(id) => id.to_string(),
    };
    let config = state.config.get();
    let response = mint_ice_servers(&config.webrtc.turn_server, &user, Utc::now())?;
    Ok(Json(response))
}

/// Active signaling rooms with member counts
pub async fn webrtc_rooms(State(state): State<Arc<AppState>>) -> Json<Vec<RoomOverview>> {
    Json(state.broker.room_overviews())
}

/// Members of one signaling room
pub async fn webrtc_room_clients(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Json<Vec<ClientSummary>> {
    Json(state.broker.room_clients(&room_id))
}

/// Push-token registration request
#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub fcm_token: String,
    pub physical_device_id: String,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
}

#[derive(Serialize)]
pub struct RegisterDeviceResponse {
    pub status: &'static str,
    pub message: &'static str,
}

/// Register or refresh a mobile push endpoint for the authenticated user
pub async fn register_device(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<Subject>,
    Json(request): Json<RegisterDeviceRequest>,
) -> Result<Json<RegisterDeviceResponse>> {
    let owner = state.config.get().owner_user_id;
    let user_id = subject.user_id(owner);

    state
        .fcm_devices
        .register(
            user_id,
            &request.fcm_token,
            &request.physical_device_id,
            request.device_type.as_deref(),
            request.app_version.as_deref(),
        )
        .await?;

    Ok(Json(RegisterDeviceResponse {
        status: "success",
        message: "FCM device registered successfully",
    }))
}
