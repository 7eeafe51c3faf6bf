//! Timeline navigation — round/event pointer management and replay.
//!
//! DESIGN
//! ======
//! Forward navigation executes, advances, prunes expired effects, then
//! snapshots, in that order: the boundary snapshot records the state a client
//! observes on entering the boundary, after expiry has run. Backward
//! navigation never deletes future rounds or events; it restores the position
//! snapshot taken when the target boundary was first entered. Direct jumps (`go_to_*`) are implemented as repeated
//! steps so their side effects — replay and cleanup at every boundary
//! crossed — are identical to manual stepping. That equivalence is what makes
//! fast scrubbing through the timeline safe.
//!
//! Snapshots capture token positions plus full clones of the persistent
//! effect objects live at the boundary, because an expired effect is gone
//! from the store by the time a rewind wants it back.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};
use uuid::Uuid;

use crate::services::{execution, expiry};
use crate::state::{AppState, KIND_PERSISTENT_EFFECT, MapState, PositionSnapshot};

fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

#[derive(Debug, thiserror::Error)]
pub enum NavigationError {
    #[error("map not loaded: {0}")]
    MapNotLoaded(Uuid),
    #[error("combat is not active")]
    CombatInactive,
}

impl crate::frame::ErrorCode for NavigationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MapNotLoaded(_) => "E_MAP_NOT_LOADED",
            Self::CombatInactive => "E_COMBAT_INACTIVE",
        }
    }
}

/// Where the pointer landed and which effects expired on the way.
#[derive(Debug, Clone)]
pub struct NavStep {
    pub round: u32,
    pub event: u32,
    pub removed_effects: Vec<Uuid>,
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// Record store state at the current pointer. Re-entering a boundary replaces
/// its snapshot, which is a no-op in practice since replay reproduces the
/// same state.
pub(crate) fn take_snapshot(map: &mut MapState) {
    let round = map.timeline.current_round;
    let event = map.timeline.current_event;

    let positions = map
        .objects
        .values()
        .filter(|o| o.kind != KIND_PERSISTENT_EFFECT)
        .map(|o| (o.id, o.position()))
        .collect();
    let effects = map
        .objects
        .values()
        .filter(|o| o.kind == KIND_PERSISTENT_EFFECT)
        .cloned()
        .collect();
    let tracked = map.timeline.tracked_effects.clone();

    map.snapshots.retain(|s| !(s.round == round && s.event == event));
    map.snapshots.push(PositionSnapshot { round, event, ts: now_ms(), positions, effects, tracked });
}

/// Restore the snapshot for a boundary and move the pointer there.
/// Returns false (and only moves the pointer) if no snapshot exists.
pub(crate) fn restore_snapshot(map: &mut MapState, round: u32, event: u32) -> bool {
    let Some(snapshot) = map.snapshot_at(round, event).cloned() else {
        warn!(round, event, "no snapshot at boundary; moving pointer without restore");
        map.timeline.current_round = round;
        map.timeline.current_event = event;
        map.timeline_dirty = true;
        return false;
    };

    for (object_id, position) in &snapshot.positions {
        if let Some(obj) = map.objects.get_mut(object_id) {
            if obj.position() != *position {
                obj.x = position.x;
                obj.y = position.y;
                obj.version += 1;
                map.dirty.insert(*object_id);
            }
        }
    }

    // Drop effects spawned after the boundary, resurrect ones expired since.
    let current_effects: Vec<Uuid> = map
        .objects
        .values()
        .filter(|o| o.kind == KIND_PERSISTENT_EFFECT)
        .map(|o| o.id)
        .collect();
    for object_id in current_effects {
        map.objects.remove(&object_id);
        map.dirty.remove(&object_id);
        map.deleted.insert(object_id);
    }
    for effect in snapshot.effects {
        map.deleted.remove(&effect.id);
        map.dirty.insert(effect.id);
        map.objects.insert(effect.id, effect);
    }

    map.timeline.tracked_effects = snapshot.tracked;
    map.timeline.current_round = round;
    map.timeline.current_event = event;
    map.timeline_dirty = true;
    true
}

// =============================================================================
// FORWARD STEPS
// =============================================================================

/// Execute the current event and advance the pointer one event, creating the
/// next event if absent. Returns the ids of effects expired at the new
/// boundary.
pub(crate) fn step_event_forward(map: &mut MapState, map_id: Uuid) -> Vec<Uuid> {
    let round = map.timeline.current_round;
    let event = map.timeline.current_event;

    execution::apply_event_actions(map, map_id, event);

    let next_event = event + 1;
    map.timeline.ensure_round(round).ensure_event(next_event);
    map.timeline.current_event = next_event;
    let removed = expiry::cleanup_on_map(map, round, next_event);
    take_snapshot(map);
    map.timeline.log(format!("advanced to event {next_event} of round {round}"));
    removed
}

/// Execute every remaining event of the current round, close the round, and
/// open the next one at event 1. Executed events are re-applied as well so
/// stepping forward after a rewind replays the round.
pub(crate) fn step_round_forward(map: &mut MapState, map_id: Uuid) -> Vec<Uuid> {
    let round = map.timeline.current_round;
    let last_event = map
        .timeline
        .round(round)
        .map_or(1, crate::timeline::Round::last_event_number);

    let first = map.timeline.current_event;
    for event in first..=last_event {
        map.timeline.current_event = event;
        execution::apply_event_actions(map, map_id, event);
    }

    if let Some(r) = map.timeline.round_mut(round) {
        r.executed = true;
    }

    let next_round = round + 1;
    map.timeline.ensure_round(next_round);
    map.timeline.current_round = next_round;
    map.timeline.current_event = 1;
    let removed = expiry::cleanup_on_map(map, next_round, 1);
    take_snapshot(map);
    map.timeline.log(format!("started round {next_round}"));
    removed
}

// =============================================================================
// COMBAT LIFECYCLE
// =============================================================================

/// Activate the timeline. First activation materializes round 1 / event 1 and
/// records the initial snapshot; re-activating after `end_combat` resumes at
/// the existing pointer with history intact.
///
/// # Errors
///
/// Returns `MapNotLoaded` if the map isn't in memory.
pub async fn start_combat(state: &AppState, map_id: Uuid) -> Result<(), NavigationError> {
    let mut maps = state.maps.write().await;
    let map = maps
        .get_mut(&map_id)
        .ok_or(NavigationError::MapNotLoaded(map_id))?;

    if map.timeline.is_active {
        warn!(%map_id, "start_combat: already active");
        return Ok(());
    }

    if map.timeline.rounds.is_empty() {
        map.timeline.ensure_round(1);
        map.timeline.current_round = 1;
        map.timeline.current_event = 1;
        take_snapshot(map);
    }
    map.timeline.is_active = true;
    map.timeline.log("combat started");
    map.timeline_dirty = true;
    info!(%map_id, "combat started");
    Ok(())
}

/// Deactivate the timeline. Rounds, snapshots, and history are kept.
///
/// # Errors
///
/// Returns `MapNotLoaded` if the map isn't in memory.
pub async fn end_combat(state: &AppState, map_id: Uuid) -> Result<(), NavigationError> {
    let mut maps = state.maps.write().await;
    let map = maps
        .get_mut(&map_id)
        .ok_or(NavigationError::MapNotLoaded(map_id))?;

    if map.timeline.is_active {
        map.timeline.is_active = false;
        map.timeline.log("combat ended");
        map.timeline_dirty = true;
        info!(%map_id, "combat ended");
    }
    Ok(())
}

// =============================================================================
// NAVIGATION PRIMITIVES
// =============================================================================

fn with_active_map<T>(
    maps: &mut std::collections::HashMap<Uuid, MapState>,
    map_id: Uuid,
    f: impl FnOnce(&mut MapState) -> T,
) -> Result<T, NavigationError> {
    let map = maps
        .get_mut(&map_id)
        .ok_or(NavigationError::MapNotLoaded(map_id))?;
    if !map.timeline.is_active {
        return Err(NavigationError::CombatInactive);
    }
    Ok(f(map))
}

fn nav_step(map: &MapState, removed: Vec<Uuid>) -> NavStep {
    NavStep {
        round: map.timeline.current_round,
        event: map.timeline.current_event,
        removed_effects: removed,
    }
}

/// Execute the current event and move to the next one.
///
/// # Errors
///
/// Returns `MapNotLoaded` or `CombatInactive`.
pub async fn next_event(state: &AppState, map_id: Uuid) -> Result<NavStep, NavigationError> {
    let mut maps = state.maps.write().await;
    with_active_map(&mut maps, map_id, |map| {
        let removed = step_event_forward(map, map_id);
        nav_step(map, removed)
    })
}

/// Finish the current round and open the next one.
///
/// # Errors
///
/// Returns `MapNotLoaded` or `CombatInactive`.
pub async fn next_round(state: &AppState, map_id: Uuid) -> Result<NavStep, NavigationError> {
    let mut maps = state.maps.write().await;
    with_active_map(&mut maps, map_id, |map| {
        let removed = step_round_forward(map, map_id);
        nav_step(map, removed)
    })
}

/// Rewind one event within the current round. Clamped at event 1.
///
/// # Errors
///
/// Returns `MapNotLoaded` or `CombatInactive`.
pub async fn previous_event(state: &AppState, map_id: Uuid) -> Result<NavStep, NavigationError> {
    let mut maps = state.maps.write().await;
    with_active_map(&mut maps, map_id, |map| {
        let round = map.timeline.current_round;
        let event = map.timeline.current_event;
        if event > 1 {
            restore_snapshot(map, round, event - 1);
            map.timeline.log(format!("rewound to event {} of round {round}", event - 1));
        }
        nav_step(map, Vec::new())
    })
}

/// Rewind to the start of the previous round. Clamped at round 1.
///
/// # Errors
///
/// Returns `MapNotLoaded` or `CombatInactive`.
pub async fn previous_round(state: &AppState, map_id: Uuid) -> Result<NavStep, NavigationError> {
    let mut maps = state.maps.write().await;
    with_active_map(&mut maps, map_id, |map| {
        let round = map.timeline.current_round;
        if round > 1 {
            // Executed flags stay set; forward replay re-applies regardless.
            restore_snapshot(map, round - 1, 1);
            map.timeline.log(format!("rewound to round {}", round - 1));
        }
        nav_step(map, Vec::new())
    })
}

/// Jump to an event of the current round. Out-of-range targets are clamped.
/// Forward jumps step event by event so replay and cleanup run at every
/// boundary crossed; backward jumps restore the target snapshot.
///
/// # Errors
///
/// Returns `MapNotLoaded` or `CombatInactive`.
pub async fn go_to_event(state: &AppState, map_id: Uuid, target: u32) -> Result<NavStep, NavigationError> {
    let mut maps = state.maps.write().await;
    with_active_map(&mut maps, map_id, |map| {
        let round = map.timeline.current_round;
        let last = map
            .timeline
            .round(round)
            .map_or(1, crate::timeline::Round::last_event_number);
        let target = target.clamp(1, last);

        let mut removed = Vec::new();
        while map.timeline.current_event < target {
            removed.extend(step_event_forward(map, map_id));
        }
        if map.timeline.current_event > target {
            restore_snapshot(map, round, target);
            map.timeline.log(format!("jumped to event {target} of round {round}"));
        }
        nav_step(map, removed)
    })
}

/// Jump to a round. Out-of-range targets are clamped. Forward jumps close
/// intervening rounds one at a time; backward jumps restore the snapshot at
/// the target round's start.
///
/// # Errors
///
/// Returns `MapNotLoaded` or `CombatInactive`.
pub async fn go_to_round(state: &AppState, map_id: Uuid, target: u32) -> Result<NavStep, NavigationError> {
    let mut maps = state.maps.write().await;
    with_active_map(&mut maps, map_id, |map| {
        let last = map.timeline.last_round_number().max(1);
        let target = target.clamp(1, last);

        let mut removed = Vec::new();
        while map.timeline.current_round < target {
            removed.extend(step_round_forward(map, map_id));
        }
        if map.timeline.current_round > target {
            restore_snapshot(map, target, 1);
            map.timeline.log(format!("jumped to round {target}"));
        }
        nav_step(map, removed)
    })
}

#[cfg(test)]
#[path = "navigation_test.rs"]
mod tests;
