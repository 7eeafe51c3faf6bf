//! Execution engine — applies an event's scheduled actions to the map store.
//!
//! DESIGN
//! ======
//! Actions execute in insertion order, so a spell scheduled after a move in
//! the same event sees the moved position. Tracking spells and attacks
//! resolve their destination against the live store at execution time;
//! non-tracking ones use the scheduled literal even if the target has since
//! moved.
//!
//! Re-execution is idempotent from the caller's perspective: moves re-apply
//! the same final position, and persistent effects are keyed by their source
//! action id so replay never spawns duplicates.
//!
//! ERROR HANDLING
//! ==============
//! A malformed action (e.g. a move targeting a token that no longer exists)
//! is logged and skipped; one bad action never aborts the rest of the event.

use std::collections::HashMap;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::services::persistence::env_parse;
use crate::state::{AppState, KIND_PERSISTENT_EFFECT, MapObject, MapState};
use crate::timeline::{Action, ActionKind, Position, SpellCast, TrackedEffect};

const DEFAULT_ACTION_ANIMATION_MS: u64 = 0;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("map not loaded: {0}")]
    MapNotLoaded(Uuid),
}

impl crate::frame::ErrorCode for ExecutionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MapNotLoaded(_) => "E_MAP_NOT_LOADED",
        }
    }
}

// =============================================================================
// DESTINATION RESOLUTION
// =============================================================================

/// Resolve where a spell or attack lands. Tracking actions follow the target
/// token's live position; everything else keeps the scheduled literal.
pub(crate) fn resolve_destination(
    objects: &HashMap<Uuid, MapObject>,
    scheduled: Position,
    target_token_id: Option<Uuid>,
    track_target: bool,
) -> Position {
    if track_target
        && let Some(target_id) = target_token_id
        && let Some(target) = objects.get(&target_id)
    {
        return target.position();
    }
    scheduled
}

// =============================================================================
// APPLY
// =============================================================================

/// Execute every action of one event of the current round against the store,
/// then mark the event executed. Returns the number of actions applied.
/// Synchronous core shared by navigation stepping and the public wrapper.
pub(crate) fn apply_event_actions(map: &mut MapState, map_id: Uuid, event_number: u32) -> usize {
    let round_number = map.timeline.current_round;
    let actions = match map
        .timeline
        .round(round_number)
        .and_then(|r| r.event(event_number))
    {
        Some(event) => event.actions.clone(),
        None => {
            warn!(%map_id, round = round_number, event = event_number, "execute: no such event; skipping");
            return 0;
        }
    };

    for action in &actions {
        apply_action(map, map_id, action);
    }

    if let Some(event) = map
        .timeline
        .round_mut(round_number)
        .and_then(|r| r.event_mut(event_number))
    {
        event.executed = true;
    }
    map.timeline_dirty = true;
    actions.len()
}

fn apply_action(map: &mut MapState, map_id: Uuid, action: &Action) {
    match &action.kind {
        ActionKind::Move { to, .. } => {
            let Some(token) = map.objects.get_mut(&action.token_id) else {
                warn!(%map_id, token_id = %action.token_id, "move: token missing; action skipped");
                return;
            };
            token.x = to.x;
            token.y = to.y;
            token.version += 1;
            map.dirty.insert(action.token_id);
        }
        ActionKind::Spell(spell) => {
            let destination =
                resolve_destination(&map.objects, spell.to, spell.target_token_id, spell.track_target);
            if spell.persist_duration > 0 {
                spawn_persistent_effect(map, map_id, action, spell, destination);
            }
        }
        ActionKind::Attack(attack) => {
            let destination =
                resolve_destination(&map.objects, attack.to, attack.target_token_id, attack.track_target);
            // Transient: the strike animation is a presentation concern.
            debug!(%map_id, weapon = %attack.weapon, x = destination.x, y = destination.y, "attack resolved");
        }
        ActionKind::Custom { name, .. } => {
            debug!(%map_id, name = %name, "custom action; no store effect");
        }
    }
}

/// Spawn the lingering store object for a spell with `persist_duration > 0`,
/// stamped for the expiry evaluator. Skipped when an effect from the same
/// action is already tracked, so replay after backward navigation cannot
/// duplicate it.
fn spawn_persistent_effect(
    map: &mut MapState,
    map_id: Uuid,
    action: &Action,
    spell: &SpellCast,
    destination: Position,
) {
    if map
        .timeline
        .tracked_effects
        .iter()
        .any(|t| t.source_action_id == action.id)
    {
        debug!(%map_id, action_id = %action.id, "persistent effect already spawned; replay skip");
        return;
    }

    // Prefer the stamps written at scheduling time; fall back to the pointer.
    let round_created = if spell.round_created > 0 { spell.round_created } else { map.timeline.current_round };
    let event_created = if spell.event_created > 0 { spell.event_created } else { map.timeline.current_event };

    let effect = MapObject {
        id: Uuid::new_v4(),
        map_id,
        kind: KIND_PERSISTENT_EFFECT.into(),
        x: destination.x,
        y: destination.y,
        width: None,
        height: None,
        rotation: 0.0,
        z_index: 0,
        props: serde_json::json!({
            "spell_name": spell.spell_name,
            "caster_token_id": action.token_id,
            "props": spell.props,
        }),
        created_by: None,
        version: 1,
    };

    map.timeline.tracked_effects.push(TrackedEffect {
        object_id: effect.id,
        source_action_id: action.id,
        round_created: Some(round_created),
        event_created: Some(event_created),
        persist_duration: Some(spell.persist_duration),
        duration_type: spell.duration_type,
    });
    map.dirty.insert(effect.id);
    map.objects.insert(effect.id, effect);
    map.timeline_dirty = true;
}

// =============================================================================
// PUBLIC WRAPPER
// =============================================================================

/// Execute the given event of the current round.
///
/// The settle delay models the animation phase: with `ACTION_ANIMATION_MS`
/// set, the call suspends once per applied action before returning, but the
/// store already holds the final positions.
///
/// # Errors
///
/// Returns `MapNotLoaded` if the map isn't in memory.
pub async fn execute_event_actions(
    state: &AppState,
    map_id: Uuid,
    event_number: u32,
) -> Result<(), ExecutionError> {
    let applied = {
        let mut maps = state.maps.write().await;
        let map = maps
            .get_mut(&map_id)
            .ok_or(ExecutionError::MapNotLoaded(map_id))?;
        apply_event_actions(map, map_id, event_number)
    };

    let animation_ms = env_parse("ACTION_ANIMATION_MS", DEFAULT_ACTION_ANIMATION_MS);
    if animation_ms > 0 && applied > 0 {
        let settle = animation_ms.saturating_mul(u64::try_from(applied).unwrap_or(u64::MAX));
        tokio::time::sleep(std::time::Duration::from_millis(settle)).await;
    }
    Ok(())
}

#[cfg(test)]
#[path = "execution_test.rs"]
mod tests;
