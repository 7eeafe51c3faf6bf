use super::*;
use crate::services::action::add_action;
use crate::state::test_helpers;
use crate::timeline::{ActionKind, DurationType, Position, SpellCast};
use serde_json::json;

async fn combat_map(state: &AppState, tokens: Vec<crate::state::MapObject>) -> Uuid {
    let map_id = test_helpers::seed_map_with_objects(state, tokens).await;
    start_combat(state, map_id).await.unwrap();
    map_id
}

fn move_kind(to_x: f64, to_y: f64) -> ActionKind {
    ActionKind::Move {
        from: Position::new(0.0, 0.0),
        to: Position::new(to_x, to_y),
        duration_ms: 0,
    }
}

fn spell_kind(
    target: Option<Uuid>,
    track: bool,
    duration: u32,
    duration_type: DurationType,
) -> ActionKind {
    ActionKind::Spell(SpellCast {
        spell_name: "Web".into(),
        from: Position::new(0.0, 0.0),
        to: Position::new(120.0, 80.0),
        target_token_id: target,
        track_target: track,
        persist_duration: duration,
        duration_type,
        round_created: 0,
        event_created: 0,
        props: json!({}),
    })
}

async fn token_position(state: &AppState, map_id: Uuid, token_id: Uuid) -> Position {
    let maps = state.maps.read().await;
    maps.get(&map_id).unwrap().objects[&token_id].position()
}

async fn effect_positions(state: &AppState, map_id: Uuid) -> Vec<Position> {
    let maps = state.maps.read().await;
    maps.get(&map_id)
        .unwrap()
        .objects
        .values()
        .filter(|o| o.kind == KIND_PERSISTENT_EFFECT)
        .map(crate::state::MapObject::position)
        .collect()
}

async fn assert_invariants(state: &AppState, map_id: Uuid) {
    let maps = state.maps.read().await;
    maps.get(&map_id)
        .unwrap()
        .timeline
        .check_invariants()
        .expect("timeline invariants");
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[tokio::test]
async fn start_combat_initializes_once() {
    let state = test_helpers::test_app_state();
    let map_id = test_helpers::seed_map(&state).await;

    start_combat(&state, map_id).await.unwrap();
    {
        let maps = state.maps.read().await;
        let map = maps.get(&map_id).unwrap();
        assert!(map.timeline.is_active);
        assert_eq!(map.timeline.rounds.len(), 1);
        assert_eq!(map.timeline.current_round, 1);
        assert_eq!(map.timeline.current_event, 1);
        // Initial boundary snapshot exists for later rewinds.
        assert!(map.snapshot_at(1, 1).is_some());
    }

    // Second start is a no-op.
    start_combat(&state, map_id).await.unwrap();
    let maps = state.maps.read().await;
    assert_eq!(maps.get(&map_id).unwrap().timeline.rounds.len(), 1);
}

#[tokio::test]
async fn end_combat_keeps_timeline_and_restart_resumes() {
    let state = test_helpers::test_app_state();
    let map_id = combat_map(&state, Vec::new()).await;

    next_round(&state, map_id).await.unwrap();
    end_combat(&state, map_id).await.unwrap();

    {
        let maps = state.maps.read().await;
        let map = maps.get(&map_id).unwrap();
        assert!(!map.timeline.is_active);
        assert_eq!(map.timeline.rounds.len(), 2);
        assert_eq!(map.timeline.current_round, 2);
    }

    let err = next_event(&state, map_id).await.unwrap_err();
    assert!(matches!(err, NavigationError::CombatInactive));

    // Restart resumes at the existing pointer instead of resetting.
    start_combat(&state, map_id).await.unwrap();
    let maps = state.maps.read().await;
    let map = maps.get(&map_id).unwrap();
    assert!(map.timeline.is_active);
    assert_eq!(map.timeline.current_round, 2);
    assert_eq!(map.timeline.rounds.len(), 2);
}

#[tokio::test]
async fn navigation_requires_loaded_map() {
    let state = test_helpers::test_app_state();
    let missing = Uuid::new_v4();
    assert!(matches!(start_combat(&state, missing).await.unwrap_err(), NavigationError::MapNotLoaded(_)));
    assert!(matches!(next_event(&state, missing).await.unwrap_err(), NavigationError::MapNotLoaded(_)));
    assert!(matches!(go_to_round(&state, missing, 2).await.unwrap_err(), NavigationError::MapNotLoaded(_)));
}

// =============================================================================
// FORWARD STEPPING
// =============================================================================

#[tokio::test]
async fn next_event_executes_and_advances() {
    let state = test_helpers::test_app_state();
    let token = test_helpers::dummy_token(0.0, 0.0);
    let token_id = token.id;
    let map_id = combat_map(&state, vec![token]).await;

    add_action(&state, map_id, token_id, move_kind(90.0, 45.0), 1).await.unwrap();

    let step = next_event(&state, map_id).await.unwrap();
    assert_eq!(step.round, 1);
    assert_eq!(step.event, 2);
    assert!(step.removed_effects.is_empty());

    let pos = token_position(&state, map_id, token_id).await;
    assert_eq!(pos, Position::new(90.0, 45.0));
    assert_invariants(&state, map_id).await;
}

#[tokio::test]
async fn next_round_closes_round_and_opens_next() {
    let state = test_helpers::test_app_state();
    let token = test_helpers::dummy_token(0.0, 0.0);
    let token_id = token.id;
    let map_id = combat_map(&state, vec![token]).await;

    // Actions in events 1 and 3; the round closes with all of them applied.
    add_action(&state, map_id, token_id, move_kind(10.0, 0.0), 1).await.unwrap();
    add_action(&state, map_id, token_id, move_kind(30.0, 0.0), 3).await.unwrap();

    let step = next_round(&state, map_id).await.unwrap();
    assert_eq!(step.round, 2);
    assert_eq!(step.event, 1);

    let pos = token_position(&state, map_id, token_id).await;
    assert_eq!(pos, Position::new(30.0, 0.0));

    let maps = state.maps.read().await;
    let map = maps.get(&map_id).unwrap();
    assert!(map.timeline.round(1).unwrap().executed);
    assert!(!map.timeline.round(2).unwrap().executed);
    assert!(map.snapshot_at(2, 1).is_some());
    map.timeline.check_invariants().expect("timeline invariants");
}

// =============================================================================
// EXPIRY WINDOWS
// =============================================================================

#[tokio::test]
async fn round_effect_survives_its_window_and_expires_after() {
    let state = test_helpers::test_app_state();
    let caster = test_helpers::dummy_token(0.0, 0.0);
    let caster_id = caster.id;
    let map_id = combat_map(&state, vec![caster]).await;

    // Created in round 1 with duration 3: present in rounds 1-3, gone at 4.
    add_action(&state, map_id, caster_id, spell_kind(None, false, 3, DurationType::Rounds), 1)
        .await
        .unwrap();

    let step = next_round(&state, map_id).await.unwrap();
    assert_eq!(step.round, 2);
    assert!(step.removed_effects.is_empty());
    assert_eq!(effect_positions(&state, map_id).await.len(), 1);

    let step = next_round(&state, map_id).await.unwrap();
    assert_eq!(step.round, 3);
    assert!(step.removed_effects.is_empty());
    assert_eq!(effect_positions(&state, map_id).await.len(), 1);

    let step = next_round(&state, map_id).await.unwrap();
    assert_eq!(step.round, 4);
    assert_eq!(step.removed_effects.len(), 1);
    assert!(effect_positions(&state, map_id).await.is_empty());

    let maps = state.maps.read().await;
    let map = maps.get(&map_id).unwrap();
    assert!(map.timeline.tracked_effects.is_empty());
    assert!(map.deleted.contains(&step.removed_effects[0]));
}

#[tokio::test]
async fn event_effect_survives_one_extra_event() {
    let state = test_helpers::test_app_state();
    let caster = test_helpers::dummy_token(0.0, 0.0);
    let caster_id = caster.id;
    let map_id = combat_map(&state, vec![caster]).await;

    // Created at event 1 with duration 1: present at events 1 and 2,
    // removed entering event 3.
    add_action(&state, map_id, caster_id, spell_kind(None, false, 1, DurationType::Events), 1)
        .await
        .unwrap();

    let step = next_event(&state, map_id).await.unwrap();
    assert_eq!(step.event, 2);
    assert!(step.removed_effects.is_empty());
    assert_eq!(effect_positions(&state, map_id).await.len(), 1);

    let step = next_event(&state, map_id).await.unwrap();
    assert_eq!(step.event, 3);
    assert_eq!(step.removed_effects.len(), 1);
    assert!(effect_positions(&state, map_id).await.is_empty());
}

#[tokio::test]
async fn event_effect_scheduled_ahead_gets_full_window() {
    let state = test_helpers::test_app_state();
    let caster = test_helpers::dummy_token(0.0, 0.0);
    let caster_id = caster.id;
    let map_id = combat_map(&state, vec![caster]).await;

    // Scheduled into event 2 while the pointer is at event 1: the window is
    // anchored at event 2, so the effect lives through event 3.
    add_action(&state, map_id, caster_id, spell_kind(None, false, 1, DurationType::Events), 2)
        .await
        .unwrap();

    next_event(&state, map_id).await.unwrap();
    assert!(effect_positions(&state, map_id).await.is_empty());

    let step = next_event(&state, map_id).await.unwrap();
    assert_eq!(step.event, 3);
    assert!(step.removed_effects.is_empty());
    assert_eq!(effect_positions(&state, map_id).await.len(), 1);

    let step = next_event(&state, map_id).await.unwrap();
    assert_eq!(step.event, 4);
    assert_eq!(step.removed_effects.len(), 1);
    assert!(effect_positions(&state, map_id).await.is_empty());
}

// =============================================================================
// BACKWARD NAVIGATION AND REPLAY
// =============================================================================

#[tokio::test]
async fn rewind_to_expiry_boundary_does_not_resurrect_effect() {
    let state = test_helpers::test_app_state();
    let caster = test_helpers::dummy_token(0.0, 0.0);
    let caster_id = caster.id;
    let map_id = combat_map(&state, vec![caster]).await;

    // Created at event 1 with duration 1: removed entering event 3.
    add_action(&state, map_id, caster_id, spell_kind(None, false, 1, DurationType::Events), 1)
        .await
        .unwrap();

    next_event(&state, map_id).await.unwrap();
    next_event(&state, map_id).await.unwrap();
    next_event(&state, map_id).await.unwrap();

    // The event-3 snapshot was taken after cleanup, so rewinding to the
    // expiry boundary shows the effect gone, matching the forward view.
    let step = previous_event(&state, map_id).await.unwrap();
    assert_eq!((step.round, step.event), (1, 3));
    assert!(effect_positions(&state, map_id).await.is_empty());
    {
        let maps = state.maps.read().await;
        assert!(maps.get(&map_id).unwrap().timeline.tracked_effects.is_empty());
    }

    // One boundary earlier the effect was still live and does come back.
    let step = previous_event(&state, map_id).await.unwrap();
    assert_eq!((step.round, step.event), (1, 2));
    assert_eq!(effect_positions(&state, map_id).await.len(), 1);
    assert_invariants(&state, map_id).await;
}

#[tokio::test]
async fn previous_event_then_next_event_replays_identically() {
    let state = test_helpers::test_app_state();
    let token = test_helpers::dummy_token(0.0, 0.0);
    let token_id = token.id;
    let map_id = combat_map(&state, vec![token]).await;

    add_action(&state, map_id, token_id, move_kind(100.0, 50.0), 1).await.unwrap();
    add_action(&state, map_id, token_id, spell_kind(None, false, 2, DurationType::Rounds), 1)
        .await
        .unwrap();

    next_event(&state, map_id).await.unwrap();
    let pos_after = token_position(&state, map_id, token_id).await;
    let effects_after = effect_positions(&state, map_id).await;
    assert_eq!(pos_after, Position::new(100.0, 50.0));
    assert_eq!(effects_after, vec![Position::new(120.0, 80.0)]);

    // Rewind: positions and effects return to the round start.
    let step = previous_event(&state, map_id).await.unwrap();
    assert_eq!((step.round, step.event), (1, 1));
    assert_eq!(token_position(&state, map_id, token_id).await, Position::new(0.0, 0.0));
    assert!(effect_positions(&state, map_id).await.is_empty());

    // Replay: identical state, still exactly one effect.
    let step = next_event(&state, map_id).await.unwrap();
    assert_eq!((step.round, step.event), (1, 2));
    assert_eq!(token_position(&state, map_id, token_id).await, pos_after);
    assert_eq!(effect_positions(&state, map_id).await, effects_after);
    assert_invariants(&state, map_id).await;
}

#[tokio::test]
async fn previous_event_clamps_at_event_one() {
    let state = test_helpers::test_app_state();
    let map_id = combat_map(&state, Vec::new()).await;

    let step = previous_event(&state, map_id).await.unwrap();
    assert_eq!((step.round, step.event), (1, 1));
}

#[tokio::test]
async fn previous_round_restores_round_start() {
    let state = test_helpers::test_app_state();
    let token = test_helpers::dummy_token(5.0, 5.0);
    let token_id = token.id;
    let map_id = combat_map(&state, vec![token]).await;

    next_round(&state, map_id).await.unwrap();
    add_action(&state, map_id, token_id, move_kind(77.0, 0.0), 1).await.unwrap();
    next_event(&state, map_id).await.unwrap();
    assert_eq!(token_position(&state, map_id, token_id).await, Position::new(77.0, 0.0));

    let step = previous_round(&state, map_id).await.unwrap();
    assert_eq!((step.round, step.event), (1, 1));
    assert_eq!(token_position(&state, map_id, token_id).await, Position::new(5.0, 5.0));
    // Future rounds are kept, not destroyed.
    {
        let maps = state.maps.read().await;
        assert_eq!(maps.get(&map_id).unwrap().timeline.rounds.len(), 2);
    }

    // Clamped at round 1.
    let step = previous_round(&state, map_id).await.unwrap();
    assert_eq!((step.round, step.event), (1, 1));

    // Stepping forward again replays round 2's move.
    next_round(&state, map_id).await.unwrap();
    next_event(&state, map_id).await.unwrap();
    assert_eq!(token_position(&state, map_id, token_id).await, Position::new(77.0, 0.0));
    assert_invariants(&state, map_id).await;
}

// =============================================================================
// DIRECT JUMPS
// =============================================================================

#[tokio::test]
async fn go_to_event_steps_forward_and_restores_backward() {
    let state = test_helpers::test_app_state();
    let token = test_helpers::dummy_token(0.0, 0.0);
    let token_id = token.id;
    let map_id = combat_map(&state, vec![token]).await;

    add_action(&state, map_id, token_id, move_kind(10.0, 0.0), 1).await.unwrap();
    add_action(&state, map_id, token_id, move_kind(20.0, 0.0), 2).await.unwrap();
    add_action(&state, map_id, token_id, move_kind(30.0, 0.0), 3).await.unwrap();

    // Forward jump executes every event before the target, not the target.
    let step = go_to_event(&state, map_id, 3).await.unwrap();
    assert_eq!((step.round, step.event), (1, 3));
    assert_eq!(token_position(&state, map_id, token_id).await, Position::new(20.0, 0.0));

    // Backward jump restores the boundary snapshot.
    let step = go_to_event(&state, map_id, 1).await.unwrap();
    assert_eq!((step.round, step.event), (1, 1));
    assert_eq!(token_position(&state, map_id, token_id).await, Position::new(0.0, 0.0));

    // Out-of-range target clamps to the last event of the round.
    let step = go_to_event(&state, map_id, 99).await.unwrap();
    assert_eq!(step.event, 3);
    assert_eq!(token_position(&state, map_id, token_id).await, Position::new(20.0, 0.0));
    assert_invariants(&state, map_id).await;
}

#[tokio::test]
async fn go_to_round_replays_intervening_rounds() {
    let state = test_helpers::test_app_state();
    let token = test_helpers::dummy_token(0.0, 0.0);
    let token_id = token.id;
    let map_id = combat_map(&state, vec![token]).await;

    add_action(&state, map_id, token_id, move_kind(10.0, 10.0), 1).await.unwrap();
    next_round(&state, map_id).await.unwrap();
    next_round(&state, map_id).await.unwrap();

    let step = go_to_round(&state, map_id, 1).await.unwrap();
    assert_eq!((step.round, step.event), (1, 1));
    assert_eq!(token_position(&state, map_id, token_id).await, Position::new(0.0, 0.0));

    let step = go_to_round(&state, map_id, 3).await.unwrap();
    assert_eq!((step.round, step.event), (3, 1));
    assert_eq!(token_position(&state, map_id, token_id).await, Position::new(10.0, 10.0));

    // Out-of-range target clamps to the last existing round.
    let step = go_to_round(&state, map_id, 42).await.unwrap();
    assert_eq!(step.round, 3);
    assert_invariants(&state, map_id).await;
}

// =============================================================================
// END TO END
// =============================================================================

#[tokio::test]
async fn two_token_combat_with_tracking_spell() {
    let state = test_helpers::test_app_state();
    let caster = test_helpers::dummy_token(0.0, 0.0);
    let target = test_helpers::dummy_token(200.0, 200.0);
    let (caster_id, target_id) = (caster.id, target.id);
    let map_id = combat_map(&state, vec![caster, target]).await;

    // Event 1: the target moves. Event 2: a tracking spell lands on the
    // target's new position and lingers for two rounds.
    add_action(&state, map_id, target_id, move_kind(300.0, 300.0), 1).await.unwrap();
    add_action(&state, map_id, caster_id, spell_kind(Some(target_id), true, 2, DurationType::Rounds), 2)
        .await
        .unwrap();

    next_event(&state, map_id).await.unwrap();
    assert_eq!(token_position(&state, map_id, target_id).await, Position::new(300.0, 300.0));
    assert!(effect_positions(&state, map_id).await.is_empty());

    next_event(&state, map_id).await.unwrap();
    assert_eq!(effect_positions(&state, map_id).await, vec![Position::new(300.0, 300.0)]);

    // Round 2: the effect is still live.
    let step = next_round(&state, map_id).await.unwrap();
    assert_eq!(step.round, 2);
    assert!(step.removed_effects.is_empty());
    assert_eq!(effect_positions(&state, map_id).await.len(), 1);

    // Round 3: created round 1 + duration 2 = expired.
    let step = next_round(&state, map_id).await.unwrap();
    assert_eq!(step.round, 3);
    assert_eq!(step.removed_effects.len(), 1);
    assert!(effect_positions(&state, map_id).await.is_empty());

    let maps = state.maps.read().await;
    let map = maps.get(&map_id).unwrap();
    assert!(map.timeline.tracked_effects.is_empty());
    assert!(!map.timeline.history.is_empty());
    map.timeline.check_invariants().expect("timeline invariants");
}
