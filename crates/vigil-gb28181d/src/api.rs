use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use vigil_gb28181::sip::catalog::RecordType;
use vigil_gb28181::sip::session::{generate_stream_id, playback_stream_id};
use vigil_gb28181::sip::{SipServer, TimeRange};
use vigil_gb28181::Gb28181Error;

use crate::observer::DiscoveryObserver;
use crate::ports::PortLeases;

#[derive(Clone)]
pub struct AppState {
    pub sip: Arc<SipServer>,
    pub leases: Arc<PortLeases>,
    pub observer: Arc<DiscoveryObserver>,
}

#[derive(Debug, Deserialize)]
struct InviteRequest {
    device_id: String,
    #[serde(default)]
    channel_id: String,
    /// 缺省时从端口池分配
    rtp_port: Option<u16>,
    media_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ByeRequest {
    device_id: String,
    #[serde(default)]
    channel_id: String,
}

#[derive(Debug, Deserialize)]
struct DeviceRequest {
    device_id: String,
}

/// 时间格式 `YYYY-MM-DDThh:mm:ss`（设备本地时间）
#[derive(Debug, Deserialize)]
struct RecordInfoRequest {
    device_id: String,
    #[serde(default)]
    channel_id: String,
    start_time: String,
    end_time: String,
    /// all/time/alarm/manual
    #[serde(default)]
    record_type: String,
}

#[derive(Debug, Deserialize)]
struct PlaybackRequest {
    device_id: String,
    #[serde(default)]
    channel_id: String,
    start_time: String,
    end_time: String,
    rtp_port: Option<u16>,
    media_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StopPlaybackRequest {
    stream_id: String,
}

#[derive(Debug, Deserialize)]
struct PtzRequest {
    device_id: String,
    #[serde(default)]
    channel_id: String,
    command: String,
    #[serde(default)]
    speed: i32,
}

type ApiResult = std::result::Result<Json<serde_json::Value>, StatusCode>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/gb28181/devices", get(list_devices))
        .route(
            "/api/v1/gb28181/devices/:device_id",
            get(get_device).delete(delete_device),
        )
        .route(
            "/api/v1/gb28181/devices/:device_id/channels",
            get(list_device_channels),
        )
        .route("/api/v1/gb28181/channels/:channel_id", get(get_channel))
        .route("/api/v1/gb28181/statistics", get(statistics))
        .route("/api/v1/gb28181/sessions", get(list_sessions))
        .route("/api/v1/gb28181/invite", post(invite))
        .route("/api/v1/gb28181/bye", post(bye))
        .route("/api/v1/gb28181/catalog", post(query_catalog))
        .route("/api/v1/gb28181/device-info", post(query_device_info))
        .route("/api/v1/gb28181/ptz", post(ptz))
        .route("/api/v1/gb28181/record-info", post(query_record_info))
        .route(
            "/api/v1/gb28181/records/:channel_id",
            get(get_records).delete(clear_records),
        )
        .route("/api/v1/gb28181/playback", post(start_playback))
        .route("/api/v1/gb28181/playback/stop", post(stop_playback))
        .with_state(state)
}

pub fn map_error_to_status(err: Gb28181Error) -> StatusCode {
    let status = match &err {
        Gb28181Error::DeviceNotFound(_)
        | Gb28181Error::SessionNotFound { .. }
        | Gb28181Error::PlaybackNotFound(_) => StatusCode::NOT_FOUND,
        Gb28181Error::Transport(_) => StatusCode::BAD_GATEWAY,
        Gb28181Error::MalformedRequest(_)
        | Gb28181Error::Xml(_)
        | Gb28181Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Gb28181Error::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
        Gb28181Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::warn!(target: "gb28181d", error = %err, "Request failed");
    } else {
        tracing::debug!(target: "gb28181d", error = %err, "Request rejected");
    }
    status
}

async fn list_devices(State(state): State<AppState>) -> ApiResult {
    let devices = state.sip.registry().list_devices().await;
    Ok(Json(serde_json::json!({ "devices": devices })))
}

async fn get_device(State(state): State<AppState>, Path(device_id): Path<String>) -> ApiResult {
    let Some(device) = state.sip.registry().get_device(&device_id).await else {
        return Err(StatusCode::NOT_FOUND);
    };
    Ok(Json(serde_json::json!({ "device": device })))
}

async fn delete_device(State(state): State<AppState>, Path(device_id): Path<String>) -> ApiResult {
    if !state.sip.registry().remove_device(&device_id).await {
        return Err(StatusCode::NOT_FOUND);
    }
    let dropped = state.sip.sessions().drop_for_devices(&[device_id.clone()]).await;
    state.leases.release_device(&device_id).await;

    tracing::info!(target: "gb28181d", %device_id, sessions = dropped.len(), "Device deleted");
    Ok(Json(serde_json::json!({ "status": "ok", "sessions_dropped": dropped.len() })))
}

async fn list_device_channels(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult {
    if state.sip.registry().get_device(&device_id).await.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let channels = state.sip.registry().list_channels(&device_id).await;
    Ok(Json(serde_json::json!({ "channels": channels })))
}

async fn get_channel(State(state): State<AppState>, Path(channel_id): Path<String>) -> ApiResult {
    let Some(channel) = state.sip.registry().get_channel(&channel_id).await else {
        return Err(StatusCode::NOT_FOUND);
    };
    Ok(Json(serde_json::json!({ "channel": channel })))
}

async fn statistics(State(state): State<AppState>) -> ApiResult {
    let stats = state.sip.registry().statistics().await;
    Ok(Json(serde_json::json!({
        "devices": stats,
        "sessions": state.sip.sessions().len().await,
        "discovered_channels": state.observer.discovered_channels(),
        "leased_ports": state.leases.len().await,
    })))
}

async fn list_sessions(State(state): State<AppState>) -> ApiResult {
    let sessions = state.sip.sessions().list().await;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

async fn invite(State(state): State<AppState>, Json(req): Json<InviteRequest>) -> ApiResult {
    if state.sip.registry().get_device(&req.device_id).await.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let channel_id = if req.channel_id.is_empty() {
        req.device_id.clone()
    } else {
        req.channel_id.clone()
    };
    let stream_id = generate_stream_id(&req.device_id, &channel_id);

    let (rtp_port, leased) = match req.rtp_port {
        Some(port) => (port, false),
        None => {
            let port = state
                .leases
                .acquire(&req.device_id, &stream_id)
                .await
                .map_err(map_error_to_status)?;
            (port, true)
        }
    };

    let session = match state
        .sip
        .invite(&req.device_id, &channel_id, rtp_port, req.media_ip.as_deref())
        .await
    {
        Ok(session) => session,
        Err(e) => {
            if leased {
                state.leases.release(&stream_id).await;
            }
            return Err(map_error_to_status(e));
        }
    };

    Ok(Json(serde_json::json!({
        "call_id": session.call_id,
        "stream_id": session.stream_id,
        "ssrc": session.ssrc,
        "rtp_port": session.rtp_port,
        "media_ip": session.media_ip,
        "state": session.state,
    })))
}

async fn bye(State(state): State<AppState>, Json(req): Json<ByeRequest>) -> ApiResult {
    let channel_id = if req.channel_id.is_empty() {
        req.device_id.clone()
    } else {
        req.channel_id.clone()
    };
    let result = state.sip.bye(&req.device_id, &channel_id).await;
    state
        .leases
        .release(&generate_stream_id(&req.device_id, &channel_id))
        .await;
    result.map_err(map_error_to_status)?;

    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn query_catalog(State(state): State<AppState>, Json(req): Json<DeviceRequest>) -> ApiResult {
    state
        .sip
        .query_catalog(&req.device_id)
        .await
        .map_err(map_error_to_status)?;

    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn query_device_info(
    State(state): State<AppState>,
    Json(req): Json<DeviceRequest>,
) -> ApiResult {
    state
        .sip
        .query_device_info(&req.device_id)
        .await
        .map_err(map_error_to_status)?;

    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn ptz(State(state): State<AppState>, Json(req): Json<PtzRequest>) -> ApiResult {
    state
        .sip
        .send_ptz(&req.device_id, &req.channel_id, &req.command, req.speed)
        .await
        .map_err(map_error_to_status)?;

    Ok(Json(serde_json::json!({ "status": "ok" })))
}

fn channel_or_device(device_id: &str, channel_id: &str) -> String {
    if channel_id.is_empty() {
        device_id.to_string()
    } else {
        channel_id.to_string()
    }
}

async fn query_record_info(
    State(state): State<AppState>,
    Json(req): Json<RecordInfoRequest>,
) -> ApiResult {
    let range = TimeRange::parse(&req.start_time, &req.end_time).map_err(map_error_to_status)?;
    let channel_id = channel_or_device(&req.device_id, &req.channel_id);
    state
        .sip
        .query_record_info(
            &req.device_id,
            &channel_id,
            range,
            RecordType::from(req.record_type.as_str()),
        )
        .await
        .map_err(map_error_to_status)?;

    Ok(Json(serde_json::json!({ "status": "ok", "channel_id": channel_id })))
}

async fn get_records(State(state): State<AppState>, Path(channel_id): Path<String>) -> ApiResult {
    let Some(list) = state.sip.records().get(&channel_id).await else {
        return Err(StatusCode::NOT_FOUND);
    };
    Ok(Json(serde_json::json!({
        "complete": list.is_complete(),
        "records": list,
    })))
}

async fn clear_records(State(state): State<AppState>, Path(channel_id): Path<String>) -> ApiResult {
    if !state.sip.records().clear(&channel_id).await {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn start_playback(
    State(state): State<AppState>,
    Json(req): Json<PlaybackRequest>,
) -> ApiResult {
    let range = TimeRange::parse(&req.start_time, &req.end_time).map_err(map_error_to_status)?;
    if state.sip.registry().get_device(&req.device_id).await.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let channel_id = channel_or_device(&req.device_id, &req.channel_id);
    let stream_id = playback_stream_id(&req.device_id, &channel_id, &range);

    let (rtp_port, leased) = match req.rtp_port {
        Some(port) => (port, false),
        None => {
            let port = state
                .leases
                .acquire(&req.device_id, &stream_id)
                .await
                .map_err(map_error_to_status)?;
            (port, true)
        }
    };

    let session = match state
        .sip
        .start_playback(&req.device_id, &channel_id, range, rtp_port, req.media_ip.as_deref())
        .await
    {
        Ok(session) => session,
        Err(e) => {
            if leased {
                state.leases.release(&stream_id).await;
            }
            return Err(map_error_to_status(e));
        }
    };

    Ok(Json(serde_json::json!({
        "call_id": session.call_id,
        "stream_id": session.stream_id,
        "ssrc": session.ssrc,
        "rtp_port": session.rtp_port,
        "media_ip": session.media_ip,
        "state": session.state,
        "range": session.range,
    })))
}

async fn stop_playback(
    State(state): State<AppState>,
    Json(req): Json<StopPlaybackRequest>,
) -> ApiResult {
    let result = state.sip.stop_playback(&req.stream_id).await;
    state.leases.release(&req.stream_id).await;
    result.map_err(map_error_to_status)?;

    Ok(Json(serde_json::json!({ "status": "ok" })))
}
