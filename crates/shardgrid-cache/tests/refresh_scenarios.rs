//! End-to-end refresh scenarios against the in-memory metadata store.
//!
//! Covers the aggregator's selective-refresh protocol: dirty-bit driven
//! category reloads, incremental current-state reload, offline-history
//! write-back, derived instance sets, and memo-cache invalidation.

use std::collections::{HashMap, HashSet};

use shardgrid_cache::{ChangeCategory, ClusterCache};
use shardgrid_meta::{
    ClusterConfig, CurrentState, IdealState, InMemoryMetaStore, InstanceConfig, LiveInstance,
    ParticipantHistory, PropertyKey, ResourceAssignment, get_typed,
};

fn seed_live_instance(store: &InMemoryMetaStore, name: &str, session: &str) {
    store
        .put(
            &PropertyKey::live_instance(name),
            &LiveInstance::new(name, session),
        )
        .unwrap();
}

fn seed_instance_config(store: &InMemoryMetaStore, name: &str, enabled: bool) {
    let mut config = InstanceConfig::new(name);
    config.enabled = enabled;
    store
        .put(&PropertyKey::instance_config(name), &config)
        .unwrap();
}

fn seed_ideal_state(store: &InMemoryMetaStore, resource: &str) {
    store
        .put(&PropertyKey::ideal_state(resource), &IdealState::new(resource))
        .unwrap();
}

fn seed_current_state(store: &InMemoryMetaStore, instance: &str, session: &str, resource: &str) {
    store
        .put(
            &PropertyKey::current_state(instance, session, resource),
            &CurrentState::new(resource, session),
        )
        .unwrap();
}

#[test]
fn cold_start_builds_expected_view() {
    let store = InMemoryMetaStore::new();
    seed_live_instance(&store, "n1", "s1");
    seed_instance_config(&store, "n1", true);
    seed_ideal_state(&store, "r1");

    let mut cache = ClusterCache::new("test");
    cache.refresh(&store).unwrap();

    assert_eq!(
        cache.enabled_live_instances(),
        HashSet::from(["n1".to_string()])
    );
    assert_eq!(
        cache.ideal_states().keys().cloned().collect::<HashSet<_>>(),
        HashSet::from(["r1".to_string()])
    );
    assert!(cache.current_states("n1").is_empty());
}

#[test]
fn unchanged_current_state_is_served_from_cache() {
    let store = InMemoryMetaStore::new();
    seed_live_instance(&store, "n1", "s1");
    seed_instance_config(&store, "n1", true);
    seed_current_state(&store, "n1", "s1", "cs1");

    let mut cache = ClusterCache::new("test");
    cache.refresh(&store).unwrap();
    assert_eq!(cache.current_state("n1", "s1").len(), 1);

    store.reset_counters();
    cache.refresh(&store).unwrap();

    // Stat matched and the record is not bucketed: no full-record fetch.
    assert_eq!(store.full_reads("current_state"), 0);
    assert_eq!(cache.current_state("n1", "s1").len(), 1);
}

#[test]
fn changed_current_state_is_refetched_exactly_once() {
    let store = InMemoryMetaStore::new();
    seed_live_instance(&store, "n1", "s1");
    seed_instance_config(&store, "n1", true);
    seed_current_state(&store, "n1", "s1", "cs1");

    let mut cache = ClusterCache::new("test");
    cache.refresh(&store).unwrap();

    let mut updated = CurrentState::new("cs1", "s1");
    updated
        .partition_states
        .insert("cs1_0".to_string(), "LEADER".to_string());
    store
        .put(&PropertyKey::current_state("n1", "s1", "cs1"), &updated)
        .unwrap();

    store.reset_counters();
    cache.refresh(&store).unwrap();

    assert_eq!(store.full_reads("current_state"), 1);
    assert_eq!(
        cache.current_state("n1", "s1")["cs1"].partition_states["cs1_0"],
        "LEADER"
    );
}

#[test]
fn session_flip_drops_previous_session_state() {
    let store = InMemoryMetaStore::new();
    seed_live_instance(&store, "n1", "s1");
    seed_instance_config(&store, "n1", true);
    seed_current_state(&store, "n1", "s1", "cs1");

    let mut cache = ClusterCache::new("test");
    cache.refresh(&store).unwrap();
    assert_eq!(cache.current_state("n1", "s1").len(), 1);

    // Reconnect under a new session; nothing published there yet.
    seed_live_instance(&store, "n1", "s2");
    cache.notify_data_change(ChangeCategory::LiveInstance);
    cache.refresh(&store).unwrap();

    assert!(cache.current_state("n1", "s1").is_empty());
    assert!(cache.current_state("n1", "s2").is_empty());
    assert!(cache.current_states("n1").is_empty());
}

#[test]
fn current_state_view_only_holds_live_instances_at_their_sessions() {
    let store = InMemoryMetaStore::new();
    seed_live_instance(&store, "n1", "s1");
    seed_live_instance(&store, "n2", "s5");
    seed_instance_config(&store, "n1", true);
    seed_instance_config(&store, "n2", true);
    seed_current_state(&store, "n1", "s1", "db");
    seed_current_state(&store, "n2", "s5", "db");
    // Leftover from a dead session; must never surface.
    seed_current_state(&store, "n2", "s4", "db");

    let mut cache = ClusterCache::new("test");
    cache.refresh(&store).unwrap();

    let live = cache.live_instances();
    let view = cache.current_state_view();
    for (instance, sessions) in view.iter() {
        let live_instance = live.get(instance).expect("view instance must be live");
        for session in sessions.keys() {
            assert_eq!(session, &live_instance.session_id);
        }
    }
}

#[test]
fn offline_instance_transition_is_written_back_once() {
    let store = InMemoryMetaStore::new();
    seed_live_instance(&store, "n1", "s1");
    seed_instance_config(&store, "n1", true);
    // Configured but not live, history still says online.
    seed_instance_config(&store, "n2", true);
    store
        .put(
            &PropertyKey::participant_history("n2"),
            &ParticipantHistory::new("n2"),
        )
        .unwrap();

    let mut cache = ClusterCache::new("test");
    store.reset_counters();
    cache.refresh(&store).unwrap();

    let recorded = cache.instance_offline_times()["n2"];
    assert!(recorded > 0);
    assert_eq!(store.writes("participant_history"), 1);

    let persisted: ParticipantHistory =
        get_typed(&store, &PropertyKey::participant_history("n2"))
            .unwrap()
            .unwrap();
    assert_eq!(persisted.last_offline_time, recorded);

    // Already offline: the next live-instance reload must not write again.
    cache.notify_data_change(ChangeCategory::LiveInstance);
    store.reset_counters();
    cache.refresh(&store).unwrap();
    assert_eq!(store.writes("participant_history"), 0);
    assert_eq!(cache.instance_offline_times()["n2"], recorded);
}

#[test]
fn absent_history_still_transitions_to_offline() {
    let store = InMemoryMetaStore::new();
    seed_instance_config(&store, "n2", true);

    let mut cache = ClusterCache::new("test");
    cache.refresh(&store).unwrap();

    assert!(cache.instance_offline_times()["n2"] > 0);
    let persisted: ParticipantHistory =
        get_typed(&store, &PropertyKey::participant_history("n2"))
            .unwrap()
            .unwrap();
    assert_ne!(persisted.last_offline_time, ParticipantHistory::ONLINE);
}

#[test]
fn selective_refresh_skips_clean_categories() {
    let store = InMemoryMetaStore::new();
    seed_live_instance(&store, "n1", "s1");
    seed_instance_config(&store, "n1", true);
    seed_ideal_state(&store, "r1");

    let mut cache = ClusterCache::new("test");
    cache.refresh(&store).unwrap();

    // Only live instances dirty: ideal states must not be re-listed.
    cache.notify_data_change(ChangeCategory::LiveInstance);
    store.reset_counters();
    cache.refresh(&store).unwrap();
    assert_eq!(store.child_lists("ideal_state"), 0);
    assert_eq!(store.full_reads("ideal_state"), 0);
    assert_eq!(store.child_lists("live_instance"), 1);

    // Full refresh: all four primary categories re-fetched.
    cache.require_full_refresh();
    store.reset_counters();
    cache.refresh(&store).unwrap();
    assert_eq!(store.child_lists("ideal_state"), 1);
    assert_eq!(store.child_lists("live_instance"), 1);
    assert_eq!(store.child_lists("instance_config"), 1);
    assert_eq!(store.child_lists("resource_config"), 1);
}

#[test]
fn quiescent_refreshes_produce_identical_snapshots() {
    let store = InMemoryMetaStore::new();
    seed_live_instance(&store, "n1", "s1");
    seed_instance_config(&store, "n1", true);
    seed_ideal_state(&store, "r1");
    seed_current_state(&store, "n1", "s1", "r1");

    let mut cache = ClusterCache::new("test");
    cache.refresh(&store).unwrap();

    let ideal_states = cache.ideal_states();
    let live_instances = cache.live_instances();
    let instance_configs = cache.instance_configs();
    let view = cache.current_state_view();

    cache.refresh(&store).unwrap();

    assert_eq!(*cache.ideal_states(), *ideal_states);
    assert_eq!(*cache.live_instances(), *live_instances);
    assert_eq!(*cache.instance_configs(), *instance_configs);
    assert_eq!(*cache.current_state_view(), *view);
}

#[test]
fn disabled_flag_round_trips_through_refresh() {
    let store = InMemoryMetaStore::new();
    seed_live_instance(&store, "n1", "s1");
    seed_instance_config(&store, "n1", false);

    let mut cache = ClusterCache::new("test");
    cache.refresh(&store).unwrap();
    assert!(cache.disabled_instances().contains("n1"));
    assert!(!cache.enabled_instances().contains("n1"));

    seed_instance_config(&store, "n1", true);
    cache.notify_data_change(ChangeCategory::InstanceConfig);
    cache.refresh(&store).unwrap();
    assert!(!cache.disabled_instances().contains("n1"));
    assert!(cache.enabled_instances().contains("n1"));
}

#[test]
fn disabled_set_covers_cluster_config_list() {
    let store = InMemoryMetaStore::new();
    seed_instance_config(&store, "n1", false);
    seed_instance_config(&store, "n2", true);

    let mut config = ClusterConfig::new("test");
    config
        .disabled_instances
        .insert("n2".to_string(), "manual".to_string());
    store.put(&PropertyKey::ClusterConfig, &config).unwrap();

    let mut cache = ClusterCache::new("test");
    cache.refresh(&store).unwrap();

    for name in ["n1", "n2"] {
        assert!(cache.disabled_instances().contains(name));
    }
}

#[test]
fn memo_caches_cleared_by_any_primary_category_reload() {
    let store = InMemoryMetaStore::new();
    let mut cache = ClusterCache::new("test");
    cache.refresh(&store).unwrap();

    for category in ChangeCategory::ALL {
        cache.cache_resource_assignment(
            "r1",
            ResourceAssignment {
                resource_name: "r1".to_string(),
                replica_map: HashMap::new(),
            },
        );
        assert!(cache.cached_resource_assignment("r1").is_some());

        cache.notify_data_change(category);
        cache.refresh(&store).unwrap();
        assert!(
            cache.cached_resource_assignments().is_empty(),
            "memo survived a {category:?} reload"
        );
    }
}

#[test]
fn memo_caches_survive_a_clean_refresh() {
    let store = InMemoryMetaStore::new();
    let mut cache = ClusterCache::new("test");
    cache.refresh(&store).unwrap();

    cache.cache_resource_assignment(
        "r1",
        ResourceAssignment {
            resource_name: "r1".to_string(),
            replica_map: HashMap::new(),
        },
    );

    // No dirty bits: nothing reloads, the memo stays warm.
    cache.refresh(&store).unwrap();
    assert!(cache.cached_resource_assignment("r1").is_some());
}

#[test]
fn seeding_setters_apply_on_next_refresh() {
    let store = InMemoryMetaStore::new();
    let mut cache = ClusterCache::new("test");
    // First refresh drains the construction-time dirty bits so the seeds
    // below are not overwritten from the (empty) store.
    cache.refresh(&store).unwrap();

    cache.set_live_instances(vec![LiveInstance::new("n1", "s1")]);
    cache.set_instance_configs(vec![InstanceConfig::new("n1")]);
    cache.set_ideal_states(vec![IdealState::new("r1")]);

    // Not visible until the next refresh publishes the shadow maps.
    assert!(cache.live_instances().is_empty());

    cache.refresh(&store).unwrap();
    assert!(cache.live_instances().contains_key("n1"));
    assert!(cache.instance_configs().contains_key("n1"));
    assert!(cache.ideal_states().contains_key("r1"));
    assert_eq!(
        cache.enabled_live_instances(),
        HashSet::from(["n1".to_string()])
    );
}

#[test]
fn notifier_handle_marks_categories_from_outside() {
    let store = InMemoryMetaStore::new();
    seed_ideal_state(&store, "r1");

    let mut cache = ClusterCache::new("test");
    cache.refresh(&store).unwrap();

    let notifier = cache.notifier();
    seed_ideal_state(&store, "r2");
    notifier.notify_data_change(ChangeCategory::IdealState);

    cache.refresh(&store).unwrap();
    assert!(cache.ideal_state("r2").is_some());
}
