//! Expiry evaluator — time-bounded cleanup of persistent spell effects.
//!
//! DESIGN
//! ======
//! `should_expire` is a pure predicate over a tracked effect and the current
//! round/event pointer. `cleanup_expired_spells` applies it to every tracked
//! effect of a map, removes matches from the object store, and returns the
//! removed ids for observability. It mutates the store and the tracking list
//! only — never rounds, events, or the pointer.
//!
//! ERROR HANDLING
//! ==============
//! An effect missing its creation stamp or duration is treated as never
//! expiring. Deleting an un-stamped object silently would be worse than
//! letting it linger.

use tracing::info;
use uuid::Uuid;

use crate::state::{AppState, MapState};
use crate::timeline::{DurationType, TrackedEffect};

/// Event-scoped effects stay visible one event past their duration: an effect
/// created in event E with duration 1 is visible at E and E+1, removed at E+2.
/// Kept as a named constant because the boundary is a product decision, not
/// arithmetic that should be re-derived at call sites.
pub const EVENT_EXPIRY_GRACE: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ExpiryError {
    #[error("map not loaded: {0}")]
    MapNotLoaded(Uuid),
}

impl crate::frame::ErrorCode for ExpiryError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MapNotLoaded(_) => "E_MAP_NOT_LOADED",
        }
    }
}

// =============================================================================
// PREDICATE
// =============================================================================

/// Decide whether a tracked effect has run out at the given pointer.
///
/// - `rounds`: expires once `current_round >= round_created + duration`.
/// - `events`: expires once
///   `current_event >= event_created + duration + EVENT_EXPIRY_GRACE`,
///   scoped to the creation round; crossing a round boundary ends the effect
///   regardless of the event count.
/// - Missing stamps mean the effect never expires.
#[must_use]
pub fn should_expire(effect: &TrackedEffect, current_round: u32, current_event: u32) -> bool {
    let Some(duration) = effect.persist_duration else {
        return false;
    };
    match effect.duration_type {
        DurationType::Rounds => {
            let Some(round_created) = effect.round_created else {
                return false;
            };
            current_round >= round_created.saturating_add(duration)
        }
        DurationType::Events => {
            let (Some(round_created), Some(event_created)) = (effect.round_created, effect.event_created) else {
                return false;
            };
            if current_round > round_created {
                return true;
            }
            current_round == round_created
                && current_event >= event_created.saturating_add(duration).saturating_add(EVENT_EXPIRY_GRACE)
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

/// Remove every expired effect from the store and the tracking list.
/// Synchronous core shared by navigation and the public wrapper.
pub(crate) fn cleanup_on_map(map: &mut MapState, current_round: u32, current_event: u32) -> Vec<Uuid> {
    let mut removed = Vec::new();
    map.timeline.tracked_effects.retain(|effect| {
        if should_expire(effect, current_round, current_event) {
            removed.push(effect.object_id);
            false
        } else {
            true
        }
    });

    for object_id in &removed {
        if map.objects.remove(object_id).is_some() {
            map.dirty.remove(object_id);
            map.deleted.insert(*object_id);
        }
    }

    if !removed.is_empty() {
        map.timeline_dirty = true;
    }
    removed
}

/// Scan a map's tracked persistent effects and remove the expired ones.
/// Idempotent: a second call at the same pointer removes nothing.
///
/// # Errors
///
/// Returns `MapNotLoaded` if the map isn't in memory.
pub async fn cleanup_expired_spells(
    state: &AppState,
    map_id: Uuid,
    current_round: u32,
    current_event: u32,
) -> Result<Vec<Uuid>, ExpiryError> {
    let mut maps = state.maps.write().await;
    let map = maps
        .get_mut(&map_id)
        .ok_or(ExpiryError::MapNotLoaded(map_id))?;

    let removed = cleanup_on_map(map, current_round, current_event);
    if !removed.is_empty() {
        info!(%map_id, round = current_round, event = current_event, count = removed.len(), "expired persistent effects removed");
    }
    Ok(removed)
}

#[cfg(test)]
#[path = "expiry_test.rs"]
mod tests;
