//! Persistence service — background flush for dirty map state.
//!
//! DESIGN
//! ======
//! A background task snapshots each map's dirty objects, deleted ids, and
//! timeline (when changed) under the lock, performs the Postgres I/O
//! lock-free, then acknowledges the flushed state. It sleeps between cycles
//! so websocket handling never blocks on Postgres I/O.
//!
//! ERROR HANDLING
//! ==============
//! Dirty flags are cleared only after successful writes. This prioritizes
//! durability over duplicate flush attempts: repeated upserts are acceptable,
//! silent data loss is not.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::services::map;
use crate::state::{AppState, MapObject};
use crate::timeline::Timeline;

const DEFAULT_OBJECT_FLUSH_INTERVAL_MS: u64 = 100;

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Spawn the background persistence task. Returns a handle for shutdown.
pub fn spawn_persistence_task(state: AppState) -> JoinHandle<()> {
    let flush_interval_ms = env_parse("OBJECT_FLUSH_INTERVAL_MS", DEFAULT_OBJECT_FLUSH_INTERVAL_MS);
    info!(flush_interval_ms, "map persistence flush configured");
    tokio::spawn(async move {
        loop {
            flush_all_dirty(&state).await;
            tokio::time::sleep(Duration::from_millis(flush_interval_ms)).await;
        }
    })
}

#[derive(Debug)]
struct DirtyFlushBatch {
    map_id: Uuid,
    objects: Vec<MapObject>,
    flushed_versions: Vec<(Uuid, i32)>,
    deleted: Vec<Uuid>,
    timeline: Option<Timeline>,
}

async fn flush_all_dirty(state: &AppState) {
    // Snapshot dirty state under the lock, then perform I/O lock-free.
    let batches = {
        let mut maps = state.maps.write().await;
        let mut collected = Vec::new();

        for (map_id, map_state) in maps.iter_mut() {
            if map_state.dirty.is_empty() && map_state.deleted.is_empty() && !map_state.timeline_dirty {
                continue;
            }

            let objects = map_state
                .dirty
                .iter()
                .filter_map(|id| map_state.objects.get(id).cloned())
                .collect::<Vec<_>>();
            let versions = objects
                .iter()
                .map(|obj| (obj.id, obj.version))
                .collect::<Vec<_>>();
            let deleted: Vec<Uuid> = map_state.deleted.iter().copied().collect();
            let timeline = map_state.timeline_dirty.then(|| map_state.timeline.clone());

            collected.push(DirtyFlushBatch {
                map_id: *map_id,
                objects,
                flushed_versions: versions,
                deleted,
                timeline,
            });
        }

        collected
    };

    // Flush per map, then ack. If flush fails, flags are kept for retry.
    for batch in batches {
        if let Err(e) = flush_batch(state, &batch).await {
            error!(
                error = %e,
                count = batch.objects.len(),
                deleted = batch.deleted.len(),
                map_id = %batch.map_id,
                "persistence flush failed"
            );
        }
    }
}

async fn flush_batch(state: &AppState, batch: &DirtyFlushBatch) -> Result<(), sqlx::Error> {
    map::flush_objects(&state.pool, &batch.objects).await?;
    map::delete_objects(&state.pool, &batch.deleted).await?;
    if let Some(timeline) = &batch.timeline {
        map::save_timeline(&state.pool, batch.map_id, timeline).await?;
    }
    ack_flushed(state, batch).await;
    Ok(())
}

async fn ack_flushed(state: &AppState, batch: &DirtyFlushBatch) {
    let mut maps = state.maps.write().await;
    let Some(map_state) = maps.get_mut(&batch.map_id) else {
        return;
    };

    map::clear_flushed_dirty_ids(map_state, &batch.flushed_versions);
    for id in &batch.deleted {
        // An id resurrected since the snapshot (snapshot restore) is already
        // out of the deleted set and marked dirty; only ack ids still gone.
        if !map_state.objects.contains_key(id) {
            map_state.deleted.remove(id);
        }
    }
    if batch.timeline.is_some() {
        map_state.timeline_dirty = false;
    }
}

#[cfg(test)]
pub(crate) async fn flush_all_dirty_for_tests(state: &AppState) {
    flush_all_dirty(state).await;
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
