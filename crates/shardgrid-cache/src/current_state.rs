//! Current-state sub-cache with stat-compared incremental reload.
//!
//! Participants publish one current-state record per resource under their
//! ephemeral session. This is the largest and most volatile category, so a
//! refresh only refetches records whose version stat changed; unchanged
//! non-bucketed records are carried over from the previous refresh.
//!
//! After a refresh the cache holds two stores: a flat entry store keyed by
//! property key, and a three-level view (instance → session → resource)
//! shared with readers as an immutable snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use shardgrid_meta::{
    CurrentState, InstanceName, LiveInstance, MetaStore, PropertyKey, ResourceName, SessionId,
    Versioned,
};

use crate::error::CacheResult;

/// Immutable instance → session → resource view of all current states.
pub type CurrentStateView =
    HashMap<InstanceName, HashMap<SessionId, HashMap<ResourceName, CurrentState>>>;

/// Holds every current-state record reported by live participants.
#[derive(Debug)]
pub struct CurrentStateCache {
    cluster_name: String,
    /// Flat store keyed by property key; carries stats for reload compares.
    entries: HashMap<PropertyKey, Versioned<CurrentState>>,
    /// Nested view rebuilt from `entries` after every refresh.
    view: Arc<CurrentStateView>,
}

impl CurrentStateCache {
    pub fn new(cluster_name: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            entries: HashMap::new(),
            view: Arc::new(HashMap::new()),
        }
    }

    /// Rebuild the cache from the store, refetching only entries whose stat
    /// changed since the previous refresh.
    ///
    /// Only keys expected for the given live instances (at their current
    /// sessions) are carried forward; everything else is evicted.
    pub fn refresh<S: MetaStore + ?Sized>(
        &mut self,
        store: &S,
        live_instances: &HashMap<InstanceName, LiveInstance>,
    ) -> CacheResult<()> {
        let started = Instant::now();

        let expected = self.expected_keys(store, live_instances)?;

        // Split into keys we have never seen and keys we may be able to
        // keep based on a stat-only fetch.
        let mut reload_keys: Vec<PropertyKey> = expected
            .iter()
            .filter(|key| !self.entries.contains_key(*key))
            .cloned()
            .collect();
        let maybe_cached: Vec<PropertyKey> = expected
            .iter()
            .filter(|key| self.entries.contains_key(*key))
            .cloned()
            .collect();

        let mut next = HashMap::with_capacity(expected.len());

        let stats = store.stats(&maybe_cached)?;
        for (key, stat) in maybe_cached.into_iter().zip(stats) {
            match stat {
                Some(stat) => {
                    // Carry the cached record only when the single-record
                    // stat compare is conclusive. Bucketed records spread
                    // their content across children, so one stat cannot
                    // vouch for them.
                    let cached = &self.entries[&key];
                    if cached.value.bucket_size == 0 && cached.stat == stat {
                        next.insert(key, cached.clone());
                    } else {
                        reload_keys.push(key);
                    }
                }
                None => {
                    warn!(%key, "stat missing for cached entry");
                    reload_keys.push(key);
                }
            }
        }

        let reload_total = reload_keys.len();
        let records = store.get_batch(&reload_keys)?;
        for (key, record) in reload_keys.into_iter().zip(records) {
            match record {
                Some(raw) => match Versioned::<CurrentState>::decode(&raw) {
                    Ok(entry) => {
                        next.insert(key, entry);
                    }
                    Err(error) => warn!(%key, %error, "dropping undecodable current state"),
                },
                None => warn!(%key, "current state missing for expected key"),
            }
        }

        let skipped = expected.len().saturating_sub(reload_total);
        self.entries = next;
        self.rebuild_view();

        info!(
            cluster = %self.cluster_name,
            reloaded = reload_total,
            skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "refreshed current states"
        );
        Ok(())
    }

    /// Enumerate the keys that should exist for the live instances: one per
    /// current-state child under each instance's current session.
    fn expected_keys<S: MetaStore + ?Sized>(
        &self,
        store: &S,
        live_instances: &HashMap<InstanceName, LiveInstance>,
    ) -> CacheResult<Vec<PropertyKey>> {
        let mut expected = Vec::new();
        for live in live_instances.values() {
            let parent =
                PropertyKey::current_states(&live.instance_name, &live.session_id);
            for name in store.children(&parent)? {
                if let Some(key) = parent.child(&name) {
                    expected.push(key);
                }
            }
        }
        debug!(expected = expected.len(), "enumerated current-state keys");
        Ok(expected)
    }

    fn rebuild_view(&mut self) {
        let mut view: CurrentStateView = HashMap::new();
        for (key, entry) in &self.entries {
            if let PropertyKey::CurrentState { instance, session, resource } = key {
                view.entry(instance.clone())
                    .or_default()
                    .entry(session.clone())
                    .or_default()
                    .insert(resource.clone(), entry.value.clone());
            }
        }
        self.view = Arc::new(view);
    }

    /// The full immutable view, shared by reference.
    pub fn view(&self) -> Arc<CurrentStateView> {
        Arc::clone(&self.view)
    }

    /// All current states reported by one instance, across sessions.
    /// Empty if the instance has none.
    pub fn current_states(
        &self,
        instance: &str,
    ) -> HashMap<SessionId, HashMap<ResourceName, CurrentState>> {
        self.view.get(instance).cloned().unwrap_or_default()
    }

    /// Current states reported by one instance under one session.
    /// Empty if absent.
    pub fn current_state(
        &self,
        instance: &str,
        session: &str,
    ) -> HashMap<ResourceName, CurrentState> {
        self.view
            .get(instance)
            .and_then(|sessions| sessions.get(session))
            .cloned()
            .unwrap_or_default()
    }
}
