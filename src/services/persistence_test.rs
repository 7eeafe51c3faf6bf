use super::*;
use crate::state::test_helpers;

#[test]
fn env_parse_reads_and_defaults() {
    // SAFETY: test-local env mutation; key is unique to this test.
    unsafe {
        std::env::set_var("BATTLEBOARD_TEST_FLUSH_MS", "250");
    }
    let parsed: u64 = env_parse("BATTLEBOARD_TEST_FLUSH_MS", 100);
    assert_eq!(parsed, 250);

    let missing: u64 = env_parse("BATTLEBOARD_TEST_MISSING", 100);
    assert_eq!(missing, 100);

    unsafe {
        std::env::set_var("BATTLEBOARD_TEST_FLUSH_MS", "not-a-number");
    }
    let malformed: u64 = env_parse("BATTLEBOARD_TEST_FLUSH_MS", 100);
    assert_eq!(malformed, 100);
}

#[tokio::test]
async fn flush_skips_clean_maps() {
    let state = test_helpers::test_app_state();
    let token = test_helpers::dummy_token(0.0, 0.0);
    let map_id = test_helpers::seed_map_with_objects(&state, vec![token]).await;

    // Nothing dirty: the cycle must finish without touching the database.
    flush_all_dirty_for_tests(&state).await;

    let maps = state.maps.read().await;
    let map = maps.get(&map_id).unwrap();
    assert!(map.dirty.is_empty());
    assert!(map.deleted.is_empty());
    assert!(!map.timeline_dirty);
}

#[tokio::test]
async fn failed_flush_retains_dirty_state() {
    let state = test_helpers::test_app_state();
    let token = test_helpers::dummy_token(0.0, 0.0);
    let token_id = token.id;
    let deleted_id = Uuid::new_v4();
    let map_id = test_helpers::seed_map_with_objects(&state, vec![token]).await;
    {
        let mut maps = state.maps.write().await;
        let map = maps.get_mut(&map_id).unwrap();
        map.dirty.insert(token_id);
        map.deleted.insert(deleted_id);
        map.timeline_dirty = true;
    }

    // The lazy pool points at nothing, so the flush fails. Every flag must
    // survive for the next cycle.
    flush_all_dirty_for_tests(&state).await;

    let maps = state.maps.read().await;
    let map = maps.get(&map_id).unwrap();
    assert!(map.dirty.contains(&token_id));
    assert!(map.deleted.contains(&deleted_id));
    assert!(map.timeline_dirty);
}

#[tokio::test]
async fn dirty_id_without_object_is_not_flushed() {
    let state = test_helpers::test_app_state();
    let map_id = test_helpers::seed_map(&state).await;
    let ghost = Uuid::new_v4();
    {
        let mut maps = state.maps.write().await;
        maps.get_mut(&map_id).unwrap().dirty.insert(ghost);
    }

    // A dirty id whose object vanished yields an empty object batch; the
    // cycle must not panic on it.
    flush_all_dirty_for_tests(&state).await;
}
