//! Action scheduling — append scheduled effects to timeline events.
//!
//! DESIGN
//! ======
//! Actions are appended to an event of the current round, creating trailing
//! events on demand. Spell payloads get their creation stamps filled at
//! scheduling time (round from the pointer, event from the scheduling
//! target); those stamps anchor expiry arithmetic later.
//!
//! ERROR HANDLING
//! ==============
//! Scheduling anomalies (inactive combat, zero event number, nil token) are
//! warn-and-skip, not errors: a dropped schedule request is recoverable in
//! the editor, a crashed timeline is not. Only a missing map surfaces as an
//! error, since that indicates caller misuse rather than user input.

use tracing::{debug, warn};
use uuid::Uuid;

use crate::state::AppState;
use crate::timeline::{Action, ActionKind};

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("map not loaded: {0}")]
    MapNotLoaded(Uuid),
}

impl crate::frame::ErrorCode for ActionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MapNotLoaded(_) => "E_MAP_NOT_LOADED",
        }
    }
}

/// Append an action to the given event of the current round, creating the
/// event (and any gaps before it) if absent.
///
/// # Errors
///
/// Returns `MapNotLoaded` if the map isn't in memory. Out-of-bounds event
/// numbers and inactive timelines are logged no-ops.
pub async fn add_action(
    state: &AppState,
    map_id: Uuid,
    token_id: Uuid,
    kind: ActionKind,
    event_number: u32,
) -> Result<(), ActionError> {
    let mut maps = state.maps.write().await;
    let map = maps
        .get_mut(&map_id)
        .ok_or(ActionError::MapNotLoaded(map_id))?;

    if !map.timeline.is_active {
        warn!(%map_id, "add_action ignored: combat not active");
        return Ok(());
    }
    if event_number == 0 {
        warn!(%map_id, "add_action ignored: event number must be 1-based");
        return Ok(());
    }
    if token_id.is_nil() {
        warn!(%map_id, kind = kind.label(), "add_action ignored: missing token id");
        return Ok(());
    }

    let current_round = map.timeline.current_round;

    // An action always lands in the current round, but may target a future
    // event of it; the event stamp anchors expiry to where the spell will
    // actually fire, not to wherever the pointer happens to sit now.
    let mut kind = kind;
    if let ActionKind::Spell(spell) = &mut kind {
        if spell.round_created == 0 {
            spell.round_created = current_round;
        }
        if spell.event_created == 0 {
            spell.event_created = event_number;
        }
    }

    let action = Action::new(token_id, kind);
    debug!(%map_id, action_id = %action.id, kind = action.kind.label(), round = current_round, event = event_number, "action scheduled");

    let round = map.timeline.ensure_round(current_round);
    round.ensure_event(event_number).actions.push(action);
    map.timeline_dirty = true;
    Ok(())
}

#[cfg(test)]
#[path = "action_test.rs"]
mod tests;
