//! Map service — CRUD, join/part, and state hydration.
//!
//! DESIGN
//! ======
//! Maps are created and listed via REST-like operations (dispatched from WS
//! frames or HTTP). Map state — objects plus the combat timeline — is
//! hydrated from Postgres on first join and kept in memory while any client
//! is connected.
//!
//! ERROR HANDLING
//! ==============
//! On last-client part, dirty objects are flushed before eviction. If that
//! flush fails, the map is intentionally kept in memory with dirty flags
//! intact so the persistence worker can retry instead of losing edits.

use std::collections::HashMap;

use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::frame::Frame;
use crate::state::{AppState, MapObject, MapState};
use crate::timeline::Timeline;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("map not found: {0}")]
    NotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for MapError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_MAP_NOT_FOUND",
            Self::Database(_) => "E_DATABASE",
        }
    }
}

/// Row returned from map queries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MapRow {
    pub id: Uuid,
    pub name: String,
    pub grid_size: i32,
}

// =============================================================================
// CRUD
// =============================================================================

/// Create a new map.
///
/// # Errors
///
/// Returns a database error if the insert fails.
pub async fn create_map(pool: &PgPool, name: &str, grid_size: i32) -> Result<MapRow, MapError> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO maps (id, name, grid_size, timeline) VALUES ($1, $2, $3, $4)")
        .bind(id)
        .bind(name)
        .bind(grid_size)
        .bind(serde_json::to_value(Timeline::new()).unwrap_or_default())
        .execute(pool)
        .await?;

    Ok(MapRow { id, name: name.to_string(), grid_size })
}

/// List all maps.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_maps(pool: &PgPool) -> Result<Vec<MapRow>, MapError> {
    let rows = sqlx::query_as::<_, (Uuid, String, i32)>(
        "SELECT id, name, grid_size
         FROM maps
         ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, name, grid_size)| MapRow { id, name, grid_size })
        .collect())
}

/// Fetch one map row by ID.
///
/// # Errors
///
/// Returns `NotFound` if no such map exists.
pub async fn get_map(pool: &PgPool, map_id: Uuid) -> Result<MapRow, MapError> {
    let row = sqlx::query_as::<_, (Uuid, String, i32)>(
        "SELECT id, name, grid_size FROM maps WHERE id = $1",
    )
    .bind(map_id)
    .fetch_optional(pool)
    .await?;

    let Some((id, name, grid_size)) = row else {
        return Err(MapError::NotFound(map_id));
    };
    Ok(MapRow { id, name, grid_size })
}

/// Delete a map and its objects. Also evicts any in-memory state.
///
/// # Errors
///
/// Returns `NotFound` if no such map exists.
pub async fn delete_map(state: &AppState, map_id: Uuid) -> Result<(), MapError> {
    let result = sqlx::query("DELETE FROM maps WHERE id = $1")
        .bind(map_id)
        .execute(&state.pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(MapError::NotFound(map_id));
    }

    sqlx::query("DELETE FROM map_objects WHERE map_id = $1")
        .bind(map_id)
        .execute(&state.pool)
        .await?;

    let mut maps = state.maps.write().await;
    maps.remove(&map_id);
    Ok(())
}

// =============================================================================
// JOIN / PART
// =============================================================================

/// Join a map. Hydrates objects and the timeline from Postgres if not already
/// in memory. Returns the current list of map objects.
///
/// # Errors
///
/// Returns `NotFound` if the map doesn't exist, or a database error if
/// hydration fails.
pub async fn join_map(
    state: &AppState,
    map_id: Uuid,
    client_id: Uuid,
    tx: mpsc::Sender<Frame>,
) -> Result<Vec<MapObject>, MapError> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM maps WHERE id = $1)")
        .bind(map_id)
        .fetch_one(&state.pool)
        .await?;
    if !exists {
        return Err(MapError::NotFound(map_id));
    }

    // Fetch hydration snapshots outside locks; applied only if needed.
    let hydrated_objects = hydrate_objects(&state.pool, map_id).await?;
    let hydrated_timeline = load_timeline(&state.pool, map_id).await?;

    let mut maps = state.maps.write().await;
    let map_state = maps.entry(map_id).or_insert_with(MapState::new);

    // Hydrate from Postgres if this is the first live client for this map.
    if map_state.clients.is_empty() {
        map_state.objects = hydrated_objects;
        map_state.timeline = hydrated_timeline;
        info!(%map_id, count = map_state.objects.len(), "hydrated map from database");
    }

    map_state.clients.insert(client_id, tx);
    let objects: Vec<MapObject> = map_state.objects.values().cloned().collect();

    info!(%map_id, %client_id, clients = map_state.clients.len(), "client joined map");
    Ok(objects)
}

/// Leave a map. Removes the client sender. If last client, flushes dirty
/// state and evicts the map from memory.
pub async fn part_map(state: &AppState, map_id: Uuid, client_id: Uuid) {
    let mut maps = state.maps.write().await;
    let Some(map_state) = maps.get_mut(&map_id) else {
        return;
    };

    map_state.clients.remove(&client_id);
    info!(%map_id, %client_id, remaining = map_state.clients.len(), "client left map");

    if map_state.clients.is_empty() {
        // Fast path: no pending mutations, evict without I/O.
        if map_state.dirty.is_empty() && map_state.deleted.is_empty() && !map_state.timeline_dirty {
            maps.remove(&map_id);
            info!(%map_id, "evicted map from memory");
        } else {
            let dirty_objects = map_state
                .dirty
                .iter()
                .filter_map(|id| map_state.objects.get(id).cloned())
                .collect::<Vec<_>>();
            let dirty_versions = dirty_objects
                .iter()
                .map(|obj| (obj.id, obj.version))
                .collect::<Vec<_>>();
            let deleted: Vec<Uuid> = map_state.deleted.iter().copied().collect();
            let timeline = map_state.timeline.clone();

            // Release lock before writing to Postgres.
            drop(maps);
            let flush_result = final_flush(&state.pool, map_id, &dirty_objects, &deleted, &timeline).await;

            // Clear dirties only when persisted. On error, retain state.
            let mut maps = state.maps.write().await;
            let Some(ms) = maps.get_mut(&map_id) else {
                return;
            };
            if !ms.clients.is_empty() {
                return;
            }

            match flush_result {
                Ok(()) => {
                    clear_flushed_dirty_ids(ms, &dirty_versions);
                    for id in &deleted {
                        ms.deleted.remove(id);
                    }
                    ms.timeline_dirty = false;
                    if ms.dirty.is_empty() && ms.deleted.is_empty() {
                        maps.remove(&map_id);
                        info!(%map_id, "evicted map from memory");
                    } else {
                        tracing::warn!(
                            %map_id,
                            remaining_dirty = ms.dirty.len(),
                            "retaining map after final flush because newer dirty objects exist"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, %map_id, "final flush failed; map retained for retry");
                }
            }
        }
    }
}

async fn final_flush(
    pool: &PgPool,
    map_id: Uuid,
    objects: &[MapObject],
    deleted: &[Uuid],
    timeline: &Timeline,
) -> Result<(), sqlx::Error> {
    flush_objects(pool, objects).await?;
    delete_objects(pool, deleted).await?;
    save_timeline(pool, map_id, timeline).await?;
    Ok(())
}

pub(crate) fn clear_flushed_dirty_ids(map_state: &mut MapState, flushed_versions: &[(Uuid, i32)]) {
    for (object_id, flushed_version) in flushed_versions {
        // Keep the dirty flag if the object was updated again after snapshot.
        let can_clear = match map_state.objects.get(object_id) {
            Some(current) => current.version == *flushed_version,
            None => true,
        };
        if can_clear {
            map_state.dirty.remove(object_id);
        }
    }
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Broadcast a frame to all clients on a map, optionally excluding one.
pub async fn broadcast(state: &AppState, map_id: Uuid, frame: &Frame, exclude: Option<Uuid>) {
    let maps = state.maps.read().await;
    let Some(map_state) = maps.get(&map_id) else {
        return;
    };

    for (client_id, tx) in &map_state.clients {
        if exclude == Some(*client_id) {
            continue;
        }
        // Best-effort: if a client's channel is full, skip it.
        let _ = tx.try_send(frame.clone());
    }
}

// =============================================================================
// HELPERS
// =============================================================================

pub(crate) async fn hydrate_objects(
    pool: &PgPool,
    map_id: Uuid,
) -> Result<HashMap<Uuid, MapObject>, sqlx::Error> {
    let rows = sqlx::query_as::<
        _,
        (
            Uuid,
            Uuid,
            String,
            f64,
            f64,
            Option<f64>,
            Option<f64>,
            f64,
            i32,
            serde_json::Value,
            Option<Uuid>,
            i32,
        ),
    >(
        "SELECT id, map_id, kind, x, y, width, height, rotation, z_index, props, created_by, version \
         FROM map_objects WHERE map_id = $1",
    )
    .bind(map_id)
    .fetch_all(pool)
    .await?;

    let mut objects = HashMap::new();
    for (id, map_id, kind, x, y, width, height, rotation, z_index, props, created_by, version) in rows {
        objects.insert(
            id,
            MapObject { id, map_id, kind, x, y, width, height, rotation, z_index, props, created_by, version },
        );
    }
    Ok(objects)
}

/// Load a map's timeline JSON. A missing or malformed column yields a fresh
/// timeline rather than an error so a corrupt snapshot can't brick the map.
pub async fn load_timeline(pool: &PgPool, map_id: Uuid) -> Result<Timeline, sqlx::Error> {
    let value: Option<serde_json::Value> = sqlx::query_scalar("SELECT timeline FROM maps WHERE id = $1")
        .bind(map_id)
        .fetch_optional(pool)
        .await?
        .flatten();

    Ok(value
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default())
}

/// Persist a map's timeline as its nested JSON representation.
pub async fn save_timeline(pool: &PgPool, map_id: Uuid, timeline: &Timeline) -> Result<(), sqlx::Error> {
    let value = serde_json::to_value(timeline).unwrap_or_default();
    sqlx::query("UPDATE maps SET timeline = $2, updated_at = now() WHERE id = $1")
        .bind(map_id)
        .bind(value)
        .execute(pool)
        .await?;
    Ok(())
}

/// Batch upsert objects to Postgres.
pub async fn flush_objects(pool: &PgPool, objects: &[MapObject]) -> Result<(), sqlx::Error> {
    for obj in objects {
        sqlx::query(
            "INSERT INTO map_objects (id, map_id, kind, x, y, width, height, rotation, z_index, props, created_by, version, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now()) \
             ON CONFLICT (id) DO UPDATE SET \
                 x = EXCLUDED.x, y = EXCLUDED.y, width = EXCLUDED.width, height = EXCLUDED.height, \
                 rotation = EXCLUDED.rotation, z_index = EXCLUDED.z_index, props = EXCLUDED.props, \
                 version = EXCLUDED.version, updated_at = now()",
        )
        .bind(obj.id)
        .bind(obj.map_id)
        .bind(&obj.kind)
        .bind(obj.x)
        .bind(obj.y)
        .bind(obj.width)
        .bind(obj.height)
        .bind(obj.rotation)
        .bind(obj.z_index)
        .bind(&obj.props)
        .bind(obj.created_by)
        .bind(obj.version)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Batch delete object rows removed from memory.
pub async fn delete_objects(pool: &PgPool, object_ids: &[Uuid]) -> Result<(), sqlx::Error> {
    if object_ids.is_empty() {
        return Ok(());
    }
    sqlx::query("DELETE FROM map_objects WHERE id = ANY($1)")
        .bind(object_ids)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
#[path = "map_test.rs"]
mod tests;
