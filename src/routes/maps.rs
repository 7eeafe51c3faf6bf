//! Map REST routes.
//!
//! The REST surface is a thin read/CRUD layer for tooling and the map picker.
//! Live editing and combat all flow over the websocket; these handlers only
//! translate HTTP into service calls.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::services::map::{self, MapError, MapRow};
use crate::state::{AppState, MapObject};
use crate::timeline::Timeline;

#[derive(Deserialize)]
pub struct CreateMapBody {
    pub name: Option<String>,
    pub grid_size: Option<i32>,
}

/// `GET /api/map` — list all maps.
pub async fn list_maps_rest(State(state): State<AppState>) -> Result<Json<Vec<MapRow>>, StatusCode> {
    let rows = map::list_maps(&state.pool).await.map_err(map_error_to_status)?;
    Ok(Json(rows))
}

/// `POST /api/map` — create a new map.
pub async fn create_map_rest(
    State(state): State<AppState>,
    Json(body): Json<CreateMapBody>,
) -> Result<Json<MapRow>, StatusCode> {
    let name = body.name.as_deref().unwrap_or("Untitled Map");
    let grid_size = body.grid_size.unwrap_or(50);
    let row = map::create_map(&state.pool, name, grid_size)
        .await
        .map_err(map_error_to_status)?;
    Ok(Json(row))
}

/// `GET /api/map/:id` — fetch one map.
pub async fn get_map_rest(
    State(state): State<AppState>,
    Path(map_id): Path<Uuid>,
) -> Result<Json<MapRow>, StatusCode> {
    let row = map::get_map(&state.pool, map_id)
        .await
        .map_err(map_error_to_status)?;
    Ok(Json(row))
}

/// `DELETE /api/map/:id` — delete a map and evict it from memory.
pub async fn delete_map_rest(
    State(state): State<AppState>,
    Path(map_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    map::delete_map(&state, map_id)
        .await
        .map_err(map_error_to_status)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `GET /api/map/:id/objects` — list objects. Serves from memory when the map
/// is loaded (live state), falls back to Postgres otherwise.
pub async fn list_objects_rest(
    State(state): State<AppState>,
    Path(map_id): Path<Uuid>,
) -> Result<Json<Vec<MapObject>>, StatusCode> {
    {
        let maps = state.maps.read().await;
        if let Some(map_state) = maps.get(&map_id) {
            let mut objects: Vec<MapObject> = map_state.objects.values().cloned().collect();
            objects.sort_by_key(|o| o.z_index);
            return Ok(Json(objects));
        }
    }

    let hydrated = map::hydrate_objects(&state.pool, map_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let mut objects: Vec<MapObject> = hydrated.into_values().collect();
    objects.sort_by_key(|o| o.z_index);
    Ok(Json(objects))
}

/// `GET /api/map/:id/timeline` — fetch the combat timeline. Serves the live
/// in-memory timeline when the map is loaded, the persisted one otherwise.
pub async fn get_timeline_rest(
    State(state): State<AppState>,
    Path(map_id): Path<Uuid>,
) -> Result<Json<Timeline>, StatusCode> {
    {
        let maps = state.maps.read().await;
        if let Some(map_state) = maps.get(&map_id) {
            return Ok(Json(map_state.timeline.clone()));
        }
    }

    // Ensure the map exists before reporting an empty timeline.
    map::get_map(&state.pool, map_id)
        .await
        .map_err(map_error_to_status)?;
    let timeline = map::load_timeline(&state.pool, map_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(timeline))
}

pub(crate) fn map_error_to_status(err: MapError) -> StatusCode {
    match err {
        MapError::NotFound(_) => StatusCode::NOT_FOUND,
        MapError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
