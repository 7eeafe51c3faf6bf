//! WebSocket handler — bidirectional frame relay.
//!
//! DESIGN
//! ======
//! On upgrade, generates a client ID and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Broadcast frames from map peers → forward to client
//!
//! Handler functions are pure business logic — they validate, mutate state,
//! and return an `Outcome`. The dispatch layer owns all outbound concerns:
//! reply to sender and broadcast to peers.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `client_id`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Dispatch applies Outcome (reply / broadcast / both)
//! 4. Close → broadcast `map:part` → cleanup

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::services;
use crate::services::navigation::NavStep;
use crate::state::AppState;
use crate::timeline::ActionKind;

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what — handlers never send frames directly.
enum Outcome {
    /// Broadcast done+data to ALL map clients including sender.
    /// Sender's copy carries `parent_id` for correlation.
    Broadcast(Data),
    /// Send done+data to sender only.
    Reply(Data),
    /// Send empty done to sender only.
    Done,
    /// Reply to sender with one payload, broadcast different data to peers.
    ReplyAndBroadcast { reply: Data, broadcast: Data },
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let name = params.get("name").cloned().unwrap_or_else(|| "anonymous".into());
    ws.on_upgrade(move |socket| run_ws(socket, state, name))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, name: String) {
    let client_id = Uuid::new_v4();

    // Per-connection channel for receiving broadcast frames from peers.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(256);

    let welcome = Frame::request("session:connected", Data::new())
        .with_data("client_id", client_id.to_string())
        .with_data("name", name.clone());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(%client_id, %name, "ws: client connected");

    // Track which map this client has joined.
    let mut current_map: Option<Uuid> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let frames = process_inbound_text(&state, &mut current_map, client_id, &name, &client_tx, &text).await;
                        for frame in frames {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    // Broadcast map:part to peers BEFORE cleanup (part_map may evict state).
    if let Some(map_id) = current_map {
        let mut part_data = Data::new();
        part_data.insert("client_id".into(), serde_json::json!(client_id));
        let part_frame = Frame::request("map:part", part_data).with_map_id(map_id);
        services::map::broadcast(&state, map_id, &part_frame, Some(client_id)).await;

        services::map::part_map(&state, map_id, client_id).await;
    }
    info!(%client_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// This keeps the websocket transport concerns separate from frame handling,
/// so tests can exercise dispatch and broadcast behavior end-to-end.
async fn process_inbound_text(
    state: &AppState,
    current_map: &mut Option<Uuid>,
    client_id: Uuid,
    name: &str,
    client_tx: &mpsc::Sender<Frame>,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    req.from = Some(name.to_string());
    info!(%client_id, id = %req.id, syscall = %req.syscall, status = ?req.status, "ws: recv frame");

    // Dispatch to handler — returns Outcome or error Frame.
    let result = match req.prefix() {
        "map" => handle_map(state, current_map, client_id, client_tx, &req).await,
        "object" => handle_object(state, *current_map, &req).await,
        "combat" => handle_combat(state, *current_map, &req).await,
        "timeline" => handle_timeline(state, *current_map, &req).await,
        prefix => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    // Apply outcome — the dispatch layer owns all outbound logic.
    let map_id = *current_map;
    match result {
        Ok(Outcome::Broadcast(data)) => {
            let sender_frame = req.done_with(data);
            // Peers get a copy without parent_id (they didn't originate the request).
            let mut peer_frame = sender_frame.clone();
            peer_frame.id = Uuid::new_v4();
            peer_frame.parent_id = None;
            if let Some(mid) = map_id {
                services::map::broadcast(state, mid, &peer_frame, Some(client_id)).await;
            }
            vec![sender_frame]
        }
        Ok(Outcome::Reply(data)) => {
            vec![req.done_with(data)]
        }
        Ok(Outcome::Done) => {
            vec![req.done()]
        }
        Ok(Outcome::ReplyAndBroadcast { reply, broadcast }) => {
            let sender_frame = req.done_with(reply);
            if let Some(mid) = map_id {
                let notif = Frame::request(&req.syscall, broadcast).with_map_id(mid);
                services::map::broadcast(state, mid, &notif, Some(client_id)).await;
            }
            vec![sender_frame]
        }
        Err(err_frame) => {
            vec![err_frame]
        }
    }
}

// =============================================================================
// MAP HANDLERS
// =============================================================================

async fn handle_map(
    state: &AppState,
    current_map: &mut Option<Uuid>,
    client_id: Uuid,
    client_tx: &mpsc::Sender<Frame>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    match req.op() {
        "join" => {
            let Some(map_id) = req.map_id.or_else(|| data_uuid(&req.data, "map_id")) else {
                return Err(req.error("map_id required"));
            };

            // Part current map if already joined.
            if let Some(old_map) = current_map.take() {
                services::map::part_map(state, old_map, client_id).await;
            }

            match services::map::join_map(state, map_id, client_id, client_tx.clone()).await {
                Ok(objects) => {
                    *current_map = Some(map_id);

                    let mut reply = Data::new();
                    reply.insert("objects".into(), serde_json::to_value(&objects).unwrap_or_default());

                    let mut broadcast = Data::new();
                    broadcast.insert("client_id".into(), serde_json::json!(client_id));

                    Ok(Outcome::ReplyAndBroadcast { reply, broadcast })
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "part" => {
            let Some(map_id) = current_map.take() else {
                return Err(req.error("not in a map"));
            };
            let mut part_data = Data::new();
            part_data.insert("client_id".into(), serde_json::json!(client_id));
            let notif = Frame::request("map:part", part_data).with_map_id(map_id);
            services::map::broadcast(state, map_id, &notif, Some(client_id)).await;
            services::map::part_map(state, map_id, client_id).await;
            Ok(Outcome::Done)
        }
        "create" => {
            let name = req
                .data
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("Untitled Map");
            let grid_size = req
                .data
                .get("grid_size")
                .and_then(serde_json::Value::as_i64)
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(50);
            match services::map::create_map(&state.pool, name, grid_size).await {
                Ok(row) => {
                    let mut data = Data::new();
                    data.insert("id".into(), serde_json::json!(row.id));
                    data.insert("name".into(), serde_json::json!(row.name));
                    Ok(Outcome::Reply(data))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "list" => match services::map::list_maps(&state.pool).await {
            Ok(maps) => {
                let list: Vec<serde_json::Value> = maps
                    .iter()
                    .map(|m| serde_json::json!({"id": m.id, "name": m.name, "grid_size": m.grid_size}))
                    .collect();
                let mut data = Data::new();
                data.insert("maps".into(), serde_json::json!(list));
                Ok(Outcome::Reply(data))
            }
            Err(e) => Err(req.error_from(&e)),
        },
        "delete" => {
            let Some(map_id) = data_uuid(&req.data, "map_id") else {
                return Err(req.error("map_id required"));
            };
            match services::map::delete_map(state, map_id).await {
                Ok(()) => Ok(Outcome::Done),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        op => Err(req.error(format!("unknown map op: {op}"))),
    }
}

// =============================================================================
// OBJECT HANDLERS
// =============================================================================

async fn handle_object(state: &AppState, current_map: Option<Uuid>, req: &Frame) -> Result<Outcome, Frame> {
    let Some(map_id) = current_map else {
        return Err(req.error("must join a map first"));
    };

    match req.op() {
        "create" => {
            let kind = req
                .data
                .get("kind")
                .and_then(|v| v.as_str())
                .unwrap_or("token");
            let x = req
                .data
                .get("x")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0);
            let y = req
                .data
                .get("y")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0);
            let props = req
                .data
                .get("props")
                .cloned()
                .unwrap_or(serde_json::json!({}));

            match services::object::create_object(state, map_id, kind, x, y, props, None).await {
                Ok(obj) => Ok(Outcome::Broadcast(object_to_data(&obj))),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "update" => {
            let Some(object_id) = data_uuid(&req.data, "id") else {
                return Err(req.error("id required"));
            };
            let version = req
                .data
                .get("version")
                .and_then(serde_json::Value::as_i64)
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(0);

            match services::object::update_object(state, map_id, object_id, &req.data, version).await {
                Ok(obj) => Ok(Outcome::Broadcast(object_to_data(&obj))),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "delete" => {
            let Some(object_id) = data_uuid(&req.data, "id") else {
                return Err(req.error("id required"));
            };

            match services::object::delete_object(state, map_id, object_id).await {
                Ok(()) => {
                    let mut data = Data::new();
                    data.insert("id".into(), serde_json::json!(object_id));
                    Ok(Outcome::Broadcast(data))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        op => Err(req.error(format!("unknown object op: {op}"))),
    }
}

// =============================================================================
// COMBAT HANDLERS
// =============================================================================

async fn handle_combat(state: &AppState, current_map: Option<Uuid>, req: &Frame) -> Result<Outcome, Frame> {
    let Some(map_id) = current_map else {
        return Err(req.error("must join a map first"));
    };

    match req.op() {
        "start" => match services::navigation::start_combat(state, map_id).await {
            Ok(()) => Ok(Outcome::Broadcast(timeline_to_data(state, map_id).await)),
            Err(e) => Err(req.error_from(&e)),
        },
        "end" => match services::navigation::end_combat(state, map_id).await {
            Ok(()) => Ok(Outcome::Broadcast(timeline_to_data(state, map_id).await)),
            Err(e) => Err(req.error_from(&e)),
        },
        op => Err(req.error(format!("unknown combat op: {op}"))),
    }
}

// =============================================================================
// TIMELINE HANDLERS
// =============================================================================

async fn handle_timeline(state: &AppState, current_map: Option<Uuid>, req: &Frame) -> Result<Outcome, Frame> {
    let Some(map_id) = current_map else {
        return Err(req.error("must join a map first"));
    };

    match req.op() {
        "add_action" => {
            let Some(token_id) = data_uuid(&req.data, "token_id") else {
                return Err(req.error("token_id required"));
            };
            let Some(action_value) = req.data.get("action").cloned() else {
                return Err(req.error("action required"));
            };
            let kind: ActionKind = match serde_json::from_value(action_value) {
                Ok(k) => k,
                Err(e) => return Err(req.error(format!("invalid action payload: {e}"))),
            };
            let event_number = data_u32(&req.data, "event").unwrap_or(1);

            match services::action::add_action(state, map_id, token_id, kind, event_number).await {
                Ok(()) => Ok(Outcome::Done),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "execute_event" => {
            let Some(event_number) = data_u32(&req.data, "event") else {
                return Err(req.error("event required"));
            };
            match services::execution::execute_event_actions(state, map_id, event_number).await {
                Ok(()) => Ok(Outcome::Broadcast(objects_to_data(state, map_id).await)),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "next_event" => nav_outcome(req, services::navigation::next_event(state, map_id).await, state, map_id).await,
        "next_round" => nav_outcome(req, services::navigation::next_round(state, map_id).await, state, map_id).await,
        "previous_event" => {
            nav_outcome(req, services::navigation::previous_event(state, map_id).await, state, map_id).await
        }
        "previous_round" => {
            nav_outcome(req, services::navigation::previous_round(state, map_id).await, state, map_id).await
        }
        "goto_event" => {
            let Some(target) = data_u32(&req.data, "event") else {
                return Err(req.error("event required"));
            };
            nav_outcome(req, services::navigation::go_to_event(state, map_id, target).await, state, map_id).await
        }
        "goto_round" => {
            let Some(target) = data_u32(&req.data, "round") else {
                return Err(req.error("round required"));
            };
            nav_outcome(req, services::navigation::go_to_round(state, map_id, target).await, state, map_id).await
        }
        "cleanup" => {
            let (round, event) = {
                let maps = state.maps.read().await;
                let Some(map) = maps.get(&map_id) else {
                    return Err(req.error("must join a map first"));
                };
                (map.timeline.current_round, map.timeline.current_event)
            };
            let round = data_u32(&req.data, "round").unwrap_or(round);
            let event = data_u32(&req.data, "event").unwrap_or(event);
            match services::expiry::cleanup_expired_spells(state, map_id, round, event).await {
                Ok(removed) => {
                    let mut data = Data::new();
                    data.insert("removed".into(), serde_json::json!(removed));
                    Ok(Outcome::Broadcast(data))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "state" => Ok(Outcome::Reply(timeline_to_data(state, map_id).await)),
        op => Err(req.error(format!("unknown timeline op: {op}"))),
    }
}

/// Convert a navigation result into a broadcast outcome carrying the new
/// pointer, expired effect ids, and the post-navigation object snapshot so
/// clients can redraw without a follow-up fetch.
async fn nav_outcome(
    req: &Frame,
    result: Result<NavStep, services::navigation::NavigationError>,
    state: &AppState,
    map_id: Uuid,
) -> Result<Outcome, Frame> {
    match result {
        Ok(step) => {
            let mut data = objects_to_data(state, map_id).await;
            data.insert("round".into(), serde_json::json!(step.round));
            data.insert("event".into(), serde_json::json!(step.event));
            data.insert("removed_effects".into(), serde_json::json!(step.removed_effects));
            Ok(Outcome::Broadcast(data))
        }
        Err(e) => Err(req.error_from(&e)),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == crate::frame::Status::Error {
        let code = frame
            .data
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        let message = frame
            .data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

fn data_uuid(data: &Data, key: &str) -> Option<Uuid> {
    data.get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
}

fn data_u32(data: &Data, key: &str) -> Option<u32> {
    data.get(key)
        .and_then(serde_json::Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

fn object_to_data(obj: &crate::state::MapObject) -> Data {
    let mut data = Data::new();
    data.insert("id".into(), serde_json::json!(obj.id));
    data.insert("map_id".into(), serde_json::json!(obj.map_id));
    data.insert("kind".into(), serde_json::json!(obj.kind));
    data.insert("x".into(), serde_json::json!(obj.x));
    data.insert("y".into(), serde_json::json!(obj.y));
    data.insert("width".into(), serde_json::json!(obj.width));
    data.insert("height".into(), serde_json::json!(obj.height));
    data.insert("rotation".into(), serde_json::json!(obj.rotation));
    data.insert("z_index".into(), serde_json::json!(obj.z_index));
    data.insert("props".into(), obj.props.clone());
    data.insert("version".into(), serde_json::json!(obj.version));
    data
}

async fn objects_to_data(state: &AppState, map_id: Uuid) -> Data {
    let maps = state.maps.read().await;
    let mut data = Data::new();
    if let Some(map) = maps.get(&map_id) {
        let objects: Vec<_> = map.objects.values().cloned().collect();
        data.insert("objects".into(), serde_json::to_value(objects).unwrap_or_default());
    }
    data
}

async fn timeline_to_data(state: &AppState, map_id: Uuid) -> Data {
    let maps = state.maps.read().await;
    let mut data = Data::new();
    if let Some(map) = maps.get(&map_id) {
        data.insert("timeline".into(), serde_json::to_value(&map.timeline).unwrap_or_default());
    }
    data
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
