//! Management-facing endpoints: interactive device sessions, session
//! playback, and the synchronous HTTP overlays (control requests and
//! file transfer) layered on the relay.

use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleetlink_proto::{
    self as proto, Frame, FrameStream, MSG_ACK, MSG_CHECK_UPDATE, MSG_ERROR, MSG_FILE_CHUNK,
    MSG_GET_FILE, MSG_NEW_SESSION, MSG_PING, MSG_PONG, MSG_PUT_FILE, MSG_SEND_INVENTORY,
    PROP_GID, PROP_MODE, PROP_OFFSET, PROP_PATH, PROP_SIZE, PROP_STATUS, PROP_UID,
    PROTO_DEVICE_CLIENT, PROTO_FILE_TRANSFER, PROTO_SHELL,
};

use super::auth::UserIdentity;
use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::bus::subjects;
use crate::session::{SessionError, SessionHandle};
use crate::store::DeviceStatus;

// ---------------------------------------------------------------------------
// Device state
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct DeviceState {
    pub device_id: String,
    pub status: DeviceStatus,
    pub created_ts: i64,
    pub updated_ts: i64,
}

/// `GET /api/devices/{id}` — persisted state overlaid with live
/// presence.
pub async fn device_state(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<DeviceState>> {
    let user = UserIdentity::from_headers(&headers)?;

    let device = state
        .store
        .get_device(&user.tenant_id, &device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Device".to_string()))?;

    let connected = state
        .presence
        .lookup(&user.tenant_id, &device_id)
        .await?
        .is_some();

    // A stale `connected` row without a live presence claim means the
    // owning instance died; report what the fleet actually sees.
    let status = match (connected, device.status) {
        (true, _) => DeviceStatus::Connected,
        (false, DeviceStatus::Connected) => DeviceStatus::Disconnected,
        (false, other) => other,
    };

    Ok(Json(DeviceState {
        device_id: device.device_id,
        status,
        created_ts: device.created_ts,
        updated_ts: device.updated_ts,
    }))
}

// ---------------------------------------------------------------------------
// Synchronous control overlays
// ---------------------------------------------------------------------------

/// `POST /api/devices/{id}/check-update`
pub async fn check_update(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let user = UserIdentity::from_headers(&headers)?;
    control_request(&state, &user, &device_id, MSG_CHECK_UPDATE).await
}

/// `POST /api/devices/{id}/send-inventory`
pub async fn send_inventory(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let user = UserIdentity::from_headers(&headers)?;
    control_request(&state, &user, &device_id, MSG_SEND_INVENTORY).await
}

/// One-shot control exchange: publish on the device subject with a
/// fresh correlation id, wait for the acknowledgment on the
/// correlation subject up to the control deadline.
async fn control_request(
    state: &AppState,
    user: &UserIdentity,
    device_id: &str,
    kind: &str,
) -> ApiResult<StatusCode> {
    if state
        .presence
        .lookup(&user.tenant_id, device_id)
        .await?
        .is_none()
    {
        return Err(ApiError::DeviceNotConnected);
    }

    let correlation = Uuid::new_v4().to_string();
    let mut ack_sub = state.bus.subscribe(&subjects::session(&correlation)).await?;

    let frame = Frame::new(PROTO_DEVICE_CLIENT, kind).with_session(&correlation);
    state
        .bus
        .publish(
            &subjects::device(&user.tenant_id, device_id),
            proto::encode(&frame)?.into(),
        )
        .await?;

    match tokio::time::timeout(state.control_timeout(), ack_sub.recv()).await {
        Ok(Some(payload)) => {
            let reply = proto::decode(&payload)?;
            if reply.typ == MSG_ERROR {
                Err(ApiError::Internal(
                    String::from_utf8_lossy(&reply.body).into_owned(),
                ))
            } else {
                Ok(StatusCode::ACCEPTED)
            }
        }
        Ok(None) => Err(ApiError::Internal("bus subscription closed".to_string())),
        Err(_) => Err(ApiError::Timeout),
    }
}

// ---------------------------------------------------------------------------
// Interactive session
// ---------------------------------------------------------------------------

/// `GET /api/devices/{id}/connect` — upgrade to an interactive
/// session bridged to the device.
pub async fn connect(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user = match UserIdentity::from_headers(&headers) {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };

    match state.store.get_device(&user.tenant_id, &device_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return ApiError::NotFound("Device".to_string()).into_response(),
        Err(e) => return ApiError::from(e).into_response(),
    }

    let handle = match state
        .sessions
        .open_session(&user.user_id, &user.tenant_id, &device_id, true)
        .await
    {
        Ok(handle) => handle,
        Err(e) => return ApiError::from(e).into_response(),
    };

    ws.on_upgrade(move |socket| handle_management_socket(socket, state, handle))
        .into_response()
}

async fn handle_management_socket(mut socket: WebSocket, state: AppState, mut handle: SessionHandle) {
    let session_id = handle.id().to_string();
    let Some(mut receiver) = handle.take_receiver() else {
        let _ = handle.close("internal").await;
        return;
    };

    // OPENING: the device acknowledges the session by echoing the
    // NewSession frame on the session subject; anything else it sends
    // first is treated as implicit acceptance and delivered.
    let pending = match tokio::time::timeout(state.open_timeout(), receiver.recv()).await {
        Err(_) => {
            warn!(session_id = %session_id, "Device did not acknowledge session in time");
            let _ = send_session_error(&mut socket, &session_id, "session open timed out").await;
            drop(receiver);
            let _ = handle.close("open timeout").await;
            return;
        }
        Ok(None) => {
            drop(receiver);
            let _ = handle.close("bus closed").await;
            return;
        }
        Ok(Some(Err(e))) => {
            warn!(session_id = %session_id, error = %e, "Session failed while opening");
            drop(receiver);
            let _ = handle.close("open error").await;
            return;
        }
        Ok(Some(Ok(frame))) => {
            if frame.is_kind(PROTO_SHELL, MSG_ERROR) {
                let _ = send_frame(&mut socket, &frame).await;
                drop(receiver);
                let _ = handle.close("device rejected session").await;
                return;
            }
            if frame.typ == MSG_NEW_SESSION {
                None
            } else {
                Some(frame)
            }
        }
    };

    info!(session_id = %session_id, "Management session open");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
    let out_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    if let Some(frame) = pending {
        if let Ok(payload) = proto::encode(&frame) {
            let _ = out_tx.send(Message::Binary(payload.into())).await;
        }
    }

    let mut overflow_rx = handle.overflow_signal();
    let missed_limit = state.config.sessions.missed_pong_limit;
    let mut missed = 0u32;
    let mut timer = tokio::time::interval(state.ping_period());
    timer.tick().await; // Skip first immediate tick

    let reason = loop {
        tokio::select! {
            maybe = ws_rx.next() => {
                let Some(Ok(msg)) = maybe else { break "user closed" };
                match msg {
                    Message::Binary(payload) => {
                        let mut frame = match proto::decode(&payload) {
                            Ok(frame) => frame,
                            Err(e) => {
                                debug!(session_id = %session_id, error = %e, "Undecodable frame from user");
                                continue;
                            }
                        };
                        if frame.is_kind(PROTO_SHELL, MSG_PING) {
                            if let Ok(pong) = proto::encode(&Frame::new(PROTO_SHELL, MSG_PONG)) {
                                let _ = out_tx.send(Message::Binary(pong.into())).await;
                            }
                            continue;
                        }
                        if frame.is_kind(PROTO_SHELL, MSG_PONG) {
                            missed = 0;
                            continue;
                        }
                        // Frames on this stream are session-scoped by
                        // definition; enforce the id.
                        frame.sid = session_id.clone();
                        if let Err(e) = handle.forward_to_device(&frame).await {
                            warn!(session_id = %session_id, error = %e, "Failed to forward user frame");
                            break "relay error";
                        }
                    }
                    Message::Close(_) => break "user closed",
                    _ => {}
                }
            }
            dev = receiver.recv() => {
                match dev {
                    None => break "bus closed",
                    Some(Err(SessionError::RecorderOverflow)) => {
                        let _ = send_error_via(&out_tx, &session_id, "session recording overflow").await;
                        break "recorder overflow";
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "Session receive failed");
                        break "relay error";
                    }
                    Some(Ok(frame)) => {
                        let device_error = frame.is_kind(PROTO_SHELL, MSG_ERROR);
                        if let Ok(payload) = proto::encode(&frame) {
                            if out_tx.send(Message::Binary(payload.into())).await.is_err() {
                                break "user closed";
                            }
                        }
                        if device_error {
                            break "device error";
                        }
                    }
                }
            }
            changed = overflow_rx.changed() => {
                match changed {
                    Ok(()) if *overflow_rx.borrow() => {
                        let _ = send_error_via(&out_tx, &session_id, "session recording overflow").await;
                        break "recorder overflow";
                    }
                    Ok(()) => {}
                    Err(_) => break "recorder stopped",
                }
            }
            _ = timer.tick() => {
                if missed >= missed_limit {
                    break "ping timeout";
                }
                if let Ok(ping) = proto::encode(&Frame::new(PROTO_SHELL, MSG_PING)) {
                    if out_tx.send(Message::Binary(ping.into())).await.is_err() {
                        break "user closed";
                    }
                }
                missed += 1;
            }
        }
    };

    drop(receiver);
    if let Err(e) = handle.close(reason).await {
        warn!(session_id = %session_id, error = %e, "Session close failed");
    }
    drop(out_tx);
    let _ = out_task.await;
    info!(session_id = %session_id, reason = %reason, "Management session closed");
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), axum::Error> {
    let payload = proto::encode(frame).map_err(axum::Error::new)?;
    socket.send(Message::Binary(payload.into())).await
}

async fn send_session_error(
    socket: &mut WebSocket,
    session_id: &str,
    message: &str,
) -> Result<(), axum::Error> {
    let frame = Frame::new(PROTO_SHELL, MSG_ERROR)
        .with_session(session_id)
        .with_body(Bytes::copy_from_slice(message.as_bytes()));
    send_frame(socket, &frame).await
}

async fn send_error_via(out_tx: &mpsc::Sender<Message>, session_id: &str, message: &str) -> bool {
    let frame = Frame::new(PROTO_SHELL, MSG_ERROR)
        .with_session(session_id)
        .with_body(Bytes::copy_from_slice(message.as_bytes()));
    match proto::encode(&frame) {
        Ok(payload) => out_tx.send(Message::Binary(payload.into())).await.is_ok(),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PlaybackQuery {
    #[serde(default)]
    pub sleep_ms: u64,
}

/// `GET /api/sessions/{id}/playback` — replay a recorded session's
/// frames over a fresh stream, paced by `sleep_ms`.
pub async fn playback(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<PlaybackQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user = match UserIdentity::from_headers(&headers) {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };

    match state
        .store
        .get_session_recording_meta(&user.tenant_id, &session_id)
        .await
    {
        Ok(Some(meta)) => {
            debug!(
                session_id = %session_id,
                recording_id = %meta.id,
                "Starting playback"
            );
        }
        Ok(None) => return ApiError::NotFound("Recording".to_string()).into_response(),
        Err(e) => return ApiError::from(e).into_response(),
    }

    let mut recording = Vec::new();
    if let Err(e) = state
        .store
        .get_session_recording(&user.tenant_id, &session_id, &mut recording)
        .await
    {
        return ApiError::from(e).into_response();
    }

    ws.on_upgrade(move |socket| handle_playback(socket, recording, query.sleep_ms))
        .into_response()
}

async fn handle_playback(mut socket: WebSocket, recording: Vec<u8>, sleep_ms: u64) {
    let mut first = true;
    for result in FrameStream::new(&recording) {
        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Truncated recording, stopping playback");
                break;
            }
        };
        if !first && sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
        first = false;

        let Ok(payload) = proto::encode(&frame) else {
            break;
        };
        if socket.send(Message::Binary(payload.into())).await.is_err() {
            return;
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

// ---------------------------------------------------------------------------
// File transfer
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub path: Option<String>,
}

/// `GET /api/devices/{id}/download?path=` — pull a file off the
/// device, streaming chunks as they arrive.
pub async fn download(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let user = UserIdentity::from_headers(&headers)?;
    let path = query
        .path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("path: cannot be blank".to_string()))?;

    if state
        .presence
        .lookup(&user.tenant_id, &device_id)
        .await?
        .is_none()
    {
        return Err(ApiError::DeviceNotConnected);
    }

    let correlation = Uuid::new_v4().to_string();
    let mut sub = state.bus.subscribe(&subjects::session(&correlation)).await?;

    let request = Frame::new(PROTO_FILE_TRANSFER, MSG_GET_FILE)
        .with_session(&correlation)
        .with_prop(PROP_PATH, path.clone());
    state
        .bus
        .publish(
            &subjects::device(&user.tenant_id, &device_id),
            proto::encode(&request)?.into(),
        )
        .await?;

    // The device answers with a stat acknowledgment before the first
    // chunk, or an error.
    let stat = match tokio::time::timeout(state.control_timeout(), sub.recv()).await {
        Ok(Some(payload)) => proto::decode(&payload)?,
        Ok(None) => return Err(ApiError::Internal("bus subscription closed".to_string())),
        Err(_) => return Err(ApiError::Timeout),
    };
    match stat.typ.as_str() {
        MSG_ACK => {}
        MSG_ERROR => return Err(file_transfer_error(&stat)),
        other => {
            return Err(ApiError::Internal(format!(
                "unexpected frame {other} in file transfer"
            )))
        }
    }

    let chunk_deadline = state.control_timeout();
    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    tokio::spawn(async move {
        loop {
            match tokio::time::timeout(chunk_deadline, sub.recv()).await {
                Ok(Some(payload)) => {
                    let Ok(frame) = proto::decode(&payload) else {
                        continue;
                    };
                    match frame.typ.as_str() {
                        MSG_FILE_CHUNK if frame.body.is_empty() => break,
                        MSG_FILE_CHUNK => {
                            if body_tx.send(Ok(frame.body)).await.is_err() {
                                break;
                            }
                        }
                        MSG_ERROR => {
                            let message = String::from_utf8_lossy(&frame.body).into_owned();
                            let _ = body_tx.send(Err(std::io::Error::other(message))).await;
                            break;
                        }
                        _ => {}
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    let _ = body_tx
                        .send(Err(std::io::Error::other("file transfer timed out")))
                        .await;
                    break;
                }
            }
        }
    });

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header("X-MEN-File-Path", path);
    if let Some(size) = stat.prop_i64(PROP_SIZE) {
        response = response.header("X-MEN-File-Size", size);
    }
    if let Some(mode) = stat.prop_i64(PROP_MODE) {
        response = response.header("X-MEN-File-Mode", mode);
    }
    if let Some(uid) = stat.prop_i64(PROP_UID) {
        response = response.header("X-MEN-File-UID", uid);
    }
    if let Some(gid) = stat.prop_i64(PROP_GID) {
        response = response.header("X-MEN-File-GID", gid);
    }

    response
        .body(Body::from_stream(ReceiverStream::new(body_rx)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// `PUT /api/devices/{id}/upload` — push a multipart file onto the
/// device, then await its acknowledgment.
pub async fn upload(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<StatusCode> {
    let user = UserIdentity::from_headers(&headers)?;

    if state
        .presence
        .lookup(&user.tenant_id, &device_id)
        .await?
        .is_none()
    {
        return Err(ApiError::DeviceNotConnected);
    }

    let correlation = Uuid::new_v4().to_string();
    let mut ack_sub = state.bus.subscribe(&subjects::session(&correlation)).await?;
    let device_subject = subjects::device(&user.tenant_id, &device_id);

    let mut path: Option<String> = None;
    let mut uid: Option<i64> = None;
    let mut gid: Option<i64> = None;
    let mut mode: Option<i64> = None;
    let mut sent_file = false;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "path" => path = Some(field_text(field).await?),
            "uid" => uid = field_text(field).await?.parse().ok(),
            "gid" => gid = field_text(field).await?.parse().ok(),
            "mode" => mode = field_text(field).await?.parse().ok(),
            "file" => {
                let path = path
                    .clone()
                    .ok_or_else(|| ApiError::InvalidRequest("path: cannot be blank".to_string()))?;

                let mut request = Frame::new(PROTO_FILE_TRANSFER, MSG_PUT_FILE)
                    .with_session(&correlation)
                    .with_prop(PROP_PATH, path);
                if let Some(uid) = uid {
                    request = request.with_prop(PROP_UID, uid);
                }
                if let Some(gid) = gid {
                    request = request.with_prop(PROP_GID, gid);
                }
                if let Some(mode) = mode {
                    request = request.with_prop(PROP_MODE, mode);
                }
                state
                    .bus
                    .publish(&device_subject, proto::encode(&request)?.into())
                    .await?;

                let mut offset: i64 = 0;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ApiError::InvalidRequest(e.to_string()))?
                {
                    let len = chunk.len() as i64;
                    let frame = Frame::new(PROTO_FILE_TRANSFER, MSG_FILE_CHUNK)
                        .with_session(&correlation)
                        .with_prop(PROP_OFFSET, offset)
                        .with_body(chunk);
                    state
                        .bus
                        .publish(&device_subject, proto::encode(&frame)?.into())
                        .await?;
                    offset += len;
                }

                // Empty chunk terminates the transfer.
                let terminator = Frame::new(PROTO_FILE_TRANSFER, MSG_FILE_CHUNK)
                    .with_session(&correlation)
                    .with_prop(PROP_OFFSET, offset);
                state
                    .bus
                    .publish(&device_subject, proto::encode(&terminator)?.into())
                    .await?;
                sent_file = true;
            }
            other => {
                debug!(field = %other, "Ignoring unknown multipart field");
            }
        }
    }

    if !sent_file {
        return Err(ApiError::InvalidRequest("file: cannot be blank".to_string()));
    }

    match tokio::time::timeout(state.control_timeout(), ack_sub.recv()).await {
        Ok(Some(payload)) => {
            let reply = proto::decode(&payload)?;
            match reply.typ.as_str() {
                MSG_ACK => Ok(StatusCode::CREATED),
                MSG_ERROR => Err(file_transfer_error(&reply)),
                other => Err(ApiError::Internal(format!(
                    "unexpected frame {other} in file transfer"
                ))),
            }
        }
        Ok(None) => Err(ApiError::Internal("bus subscription closed".to_string())),
        Err(_) => Err(ApiError::Timeout),
    }
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> ApiResult<String> {
    field
        .text()
        .await
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

/// Map a device-side file transfer error frame onto an HTTP error.
fn file_transfer_error(frame: &Frame) -> ApiError {
    let message = String::from_utf8_lossy(&frame.body).into_owned();
    match frame.prop_i64(PROP_STATUS) {
        Some(404) => ApiError::NotFound("File".to_string()),
        Some(403) => ApiError::Forbidden,
        _ => ApiError::InvalidRequest(message),
    }
}
