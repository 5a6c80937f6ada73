//! Device-facing endpoint: the server side of the device <-> relay
//! framed stream.
//!
//! A device holds one long-lived WebSocket to the relay. The endpoint
//! provisions the device, claims presence for this instance, and runs
//! three cooperative tasks per link: a reader (decode frames, answer
//! pings, publish session traffic), a bus forwarder (device-subject
//! deliveries out to the socket), and a ping watchdog. Every exit path
//! runs full disconnect cleanup.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use fleetlink_proto::{
    self as proto, Frame, MSG_ERROR, MSG_PING, MSG_PONG, PROP_STATUS, PROTO_SHELL,
};

use super::auth::DeviceIdentity;
use super::error::ApiError;
use super::AppState;
use crate::bus::{subjects, Subscription};
use crate::presence::{PresenceError, PresenceSession};

/// `GET /api/devices/connect` — device stream upgrade.
pub async fn connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match DeviceIdentity::from_headers(&headers) {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    if let Err(e) = state
        .store
        .provision_device(&identity.tenant_id, &identity.device_id)
        .await
    {
        return ApiError::from(e).into_response();
    }

    // Claim the link before upgrading so a duplicate connection is
    // rejected with a proper status code.
    let link = match state
        .presence
        .device_connected(&identity.tenant_id, &identity.device_id)
        .await
    {
        Ok(link) => link,
        Err(PresenceError::DeviceAlreadyConnected(owner)) => {
            warn!(
                device_id = %identity.device_id,
                owner = %owner,
                "Rejecting duplicate device connection"
            );
            return ApiError::DeviceAlreadyConnected.into_response();
        }
        Err(e) => return ApiError::from(e).into_response(),
    };

    let device_sub = match state
        .bus
        .subscribe(&subjects::device(&identity.tenant_id, &identity.device_id))
        .await
    {
        Ok(sub) => sub,
        Err(e) => {
            link.close().await;
            return ApiError::from(e).into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_device_socket(socket, state, identity, link, device_sub))
        .into_response()
}

async fn handle_device_socket(
    socket: WebSocket,
    state: AppState,
    identity: DeviceIdentity,
    link: PresenceSession,
    mut device_sub: Subscription,
) {
    info!(
        tenant_id = %identity.tenant_id,
        device_id = %identity.device_id,
        "Device connected"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
    let missed_pongs = Arc::new(AtomicU32::new(0));
    let timed_out = Arc::new(AtomicBool::new(false));
    let seen_sessions: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Outgoing pump: single writer on the socket.
    let out_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    // Bus-to-socket forwarder for frames addressed to this device.
    let fwd_out = out_tx.clone();
    let fwd_sessions = Arc::clone(&seen_sessions);
    let mut fwd_shutdown = shutdown_rx.clone();
    let bus_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                payload = device_sub.recv() => {
                    let Some(payload) = payload else { break };
                    if let Ok(frame) = proto::decode(&payload) {
                        if !frame.sid.is_empty() {
                            fwd_sessions
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert(frame.sid.clone());
                        }
                    }
                    if fwd_out.send(Message::Binary(payload)).await.is_err() {
                        break;
                    }
                }
                _ = fwd_shutdown.changed() => break,
            }
        }
    });

    // Ping watchdog: one probe per period, three misses end the link.
    let ping_out = out_tx.clone();
    let ping_missed = Arc::clone(&missed_pongs);
    let ping_timed_out = Arc::clone(&timed_out);
    let ping_shutdown_tx = shutdown_tx.clone();
    let mut watchdog_shutdown = shutdown_rx.clone();
    let ping_period = state.ping_period();
    let missed_limit = state.config.sessions.missed_pong_limit;
    let watchdog_device = identity.device_id.clone();
    let watchdog_task = tokio::spawn(async move {
        let mut timer = tokio::time::interval(ping_period);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if ping_missed.load(Ordering::SeqCst) >= missed_limit {
                        warn!(device_id = %watchdog_device, "Ping watchdog expired, terminating link");
                        ping_timed_out.store(true, Ordering::SeqCst);
                        let _ = ping_shutdown_tx.send(true);
                        return;
                    }
                    let Ok(ping) = proto::encode(&Frame::new(PROTO_SHELL, MSG_PING)) else {
                        return;
                    };
                    if ping_out.send(Message::Binary(ping.into())).await.is_err() {
                        return;
                    }
                    ping_missed.fetch_add(1, Ordering::SeqCst);
                }
                _ = watchdog_shutdown.changed() => return,
            }
        }
    });

    // Reader: decode device frames and route them.
    let mut reader_shutdown = shutdown_rx.clone();
    loop {
        tokio::select! {
            maybe = ws_rx.next() => {
                let Some(Ok(msg)) = maybe else { break };
                match msg {
                    Message::Binary(payload) => {
                        let frame = match proto::decode(&payload) {
                            Ok(frame) => frame,
                            Err(e) => {
                                debug!(device_id = %identity.device_id, error = %e, "Undecodable frame from device");
                                continue;
                            }
                        };

                        if frame.is_kind(PROTO_SHELL, MSG_PING) {
                            if let Ok(pong) = proto::encode(&Frame::new(PROTO_SHELL, MSG_PONG)) {
                                let _ = out_tx.send(Message::Binary(pong.into())).await;
                            }
                        } else if frame.is_kind(PROTO_SHELL, MSG_PONG) {
                            missed_pongs.store(0, Ordering::SeqCst);
                        } else if frame.sid.is_empty() {
                            debug!(
                                device_id = %identity.device_id,
                                typ = %frame.typ,
                                "Dropping sessionless frame from device"
                            );
                        } else {
                            seen_sessions
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert(frame.sid.clone());
                            if let Err(e) = state
                                .bus
                                .publish(&subjects::session(&frame.sid), payload)
                                .await
                            {
                                warn!(session_id = %frame.sid, error = %e, "Failed to relay device frame");
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = reader_shutdown.changed() => break,
        }
    }

    // Cleanup, identical on every exit path.
    let _ = shutdown_tx.send(true);
    let _ = bus_task.await;
    let _ = watchdog_task.await;
    drop(out_tx);
    let _ = out_task.await;

    // Tell the peers of any session this link carried that the device
    // side is gone.
    let status = if timed_out.load(Ordering::SeqCst) {
        "timeout"
    } else {
        "disconnected"
    };
    let sessions: Vec<String> = seen_sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .cloned()
        .collect();
    for sid in sessions {
        let error_frame = Frame::new(PROTO_SHELL, MSG_ERROR)
            .with_session(&sid)
            .with_prop(PROP_STATUS, status)
            .with_body(&b"device disconnected"[..]);
        if let Ok(payload) = proto::encode(&error_frame) {
            let _ = state
                .bus
                .publish(&subjects::session(&sid), payload.into())
                .await;
        }
    }

    link.close().await;
    info!(
        tenant_id = %identity.tenant_id,
        device_id = %identity.device_id,
        status = %status,
        "Device disconnected"
    );
}
