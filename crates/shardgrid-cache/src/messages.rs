//! Instance-messages sub-cache.
//!
//! Tracks the pending state-transition messages outstanding on each live
//! instance, reloading with the same stat-compare policy as the
//! current-state sub-cache. Relay messages are revalidated against the
//! freshly refreshed current-state view through a pluggable filter, since
//! a relay hand-off whose precondition no longer holds must not be acted
//! on by the pipeline.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use tracing::{debug, info, warn};

use shardgrid_meta::{InstanceName, LiveInstance, Message, MetaStore, PropertyKey, Versioned};

use crate::current_state::CurrentStateView;
use crate::error::CacheResult;

/// Decides whether a relay message is still valid against current state.
/// Returning `false` removes the message from the pending set.
pub type RelayFilter = Box<
    dyn Fn(&Message, &HashMap<InstanceName, LiveInstance>, &CurrentStateView) -> bool
        + Send
        + Sync,
>;

/// Default relay validation: drop a relay message once its target state is
/// already reached, or once the replica is no longer in the message's
/// from-state. A partition with no reported state keeps its message (the
/// transition simply has not been reported yet).
pub fn default_relay_filter(
    message: &Message,
    live_instances: &HashMap<InstanceName, LiveInstance>,
    view: &CurrentStateView,
) -> bool {
    let Some(live) = live_instances.get(&message.target_instance) else {
        // Target went offline; the message can never apply.
        return false;
    };

    let reported = view
        .get(&message.target_instance)
        .and_then(|sessions| sessions.get(&live.session_id))
        .and_then(|resources| resources.get(&message.resource_name))
        .and_then(|state| state.partition_states.get(&message.partition_name));

    match reported {
        Some(state) if *state == message.to_state => false,
        Some(state) if *state != message.from_state => false,
        _ => true,
    }
}

/// Pending messages per instance, refreshed incrementally.
pub struct InstanceMessagesCache {
    cluster_name: String,
    /// Flat store keyed by property key; carries stats for reload compares.
    entries: HashMap<PropertyKey, Versioned<Message>>,
    /// Per-instance pending map served to readers. Injected messages
    /// overlay this until the next refresh rebuilds it.
    messages: HashMap<InstanceName, HashMap<String, Message>>,
    relay_filter: RelayFilter,
}

impl InstanceMessagesCache {
    pub fn new(cluster_name: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            entries: HashMap::new(),
            messages: HashMap::new(),
            relay_filter: Box::new(default_relay_filter),
        }
    }

    /// Replace the relay validation rule.
    pub fn set_relay_filter(&mut self, filter: RelayFilter) {
        self.relay_filter = filter;
    }

    /// Reload pending messages for every live instance, refetching only
    /// entries whose stat changed.
    pub fn refresh<S: MetaStore + ?Sized>(
        &mut self,
        store: &S,
        live_instances: &HashMap<InstanceName, LiveInstance>,
    ) -> CacheResult<()> {
        let started = Instant::now();

        let mut expected = Vec::new();
        for instance in live_instances.keys() {
            let parent = PropertyKey::messages(instance);
            for name in store.children(&parent)? {
                if let Some(key) = parent.child(&name) {
                    expected.push(key);
                }
            }
        }

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
                    let cached = &self.entries[&key];
                    if cached.stat == stat {
                        next.insert(key, cached.clone());
                    } else {
                        reload_keys.push(key);
                    }
                }
                None => {
                    warn!(%key, "stat missing for cached message");
                    reload_keys.push(key);
                }
            }
        }

        let reloaded = reload_keys.len();
        let records = store.get_batch(&reload_keys)?;
        for (key, record) in reload_keys.into_iter().zip(records) {
            match record {
                Some(raw) => match Versioned::<Message>::decode(&raw) {
                    Ok(entry) => {
                        next.insert(key, entry);
                    }
                    Err(error) => warn!(%key, %error, "dropping undecodable message"),
                },
                None => warn!(%key, "message missing for expected key"),
            }
        }

        self.entries = next;
        self.messages = HashMap::new();
        for entry in self.entries.values() {
            self.messages
                .entry(entry.value.target_instance.clone())
                .or_default()
                .insert(entry.value.id.clone(), entry.value.clone());
        }

        info!(
            cluster = %self.cluster_name,
            reloaded,
            total = self.entries.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "refreshed instance messages"
        );
        Ok(())
    }

    /// Revalidate relay messages against the current-state view published
    /// earlier in the same refresh. Must run after the current-state
    /// sub-cache has been refreshed.
    pub fn update_relay_messages(
        &mut self,
        live_instances: &HashMap<InstanceName, LiveInstance>,
        view: &CurrentStateView,
    ) {
        let filter = &self.relay_filter;
        let mut dropped = 0usize;
        for pending in self.messages.values_mut() {
            pending.retain(|_, message| {
                if !message.is_relay {
                    return true;
                }
                let keep = filter(message, live_instances, view);
                if !keep {
                    dropped += 1;
                }
                keep
            });
        }
        if dropped > 0 {
            debug!(dropped, "filtered stale relay messages");
        }
    }

    /// Inject pre-known messages between refreshes. The overlay lasts until
    /// the next refresh rebuilds the pending map from the store.
    pub fn cache_messages(&mut self, messages: Vec<Message>) {
        for message in messages {
            self.messages
                .entry(message.target_instance.clone())
                .or_default()
                .insert(message.id.clone(), message);
        }
    }

    /// Pending messages for one instance. Empty if none.
    pub fn messages(&self, instance: &str) -> HashMap<String, Message> {
        self.messages.get(instance).cloned().unwrap_or_default()
    }
}

impl fmt::Debug for InstanceMessagesCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceMessagesCache")
            .field("cluster_name", &self.cluster_name)
            .field("entries", &self.entries.len())
            .field("messages", &self.messages)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardgrid_meta::{CurrentState, InMemoryMetaStore};

    fn live_map(entries: &[(&str, &str)]) -> HashMap<InstanceName, LiveInstance> {
        entries
            .iter()
            .map(|(name, session)| (name.to_string(), LiveInstance::new(name, session)))
            .collect()
    }

    fn relay_message(id: &str, target: &str) -> Message {
        Message {
            id: id.to_string(),
            target_instance: target.to_string(),
            resource_name: "db".to_string(),
            partition_name: "db_0".to_string(),
            from_state: "SLAVE".to_string(),
            to_state: "MASTER".to_string(),
            is_relay: true,
        }
    }

    fn view_with_state(instance: &str, session: &str, partition_state: &str) -> CurrentStateView {
        let mut state = CurrentState::new("db", session);
        state
            .partition_states
            .insert("db_0".to_string(), partition_state.to_string());

        let mut view = CurrentStateView::new();
        view.entry(instance.to_string())
            .or_default()
            .entry(session.to_string())
            .or_default()
            .insert("db".to_string(), state);
        view
    }

    #[test]
    fn refresh_groups_messages_by_instance() {
        let store = InMemoryMetaStore::new();
        let m1 = relay_message("m1", "n1");
        let m2 = relay_message("m2", "n2");
        store.put(&PropertyKey::message("n1", "m1"), &m1).unwrap();
        store.put(&PropertyKey::message("n2", "m2"), &m2).unwrap();

        let mut cache = InstanceMessagesCache::new("test");
        cache
            .refresh(&store, &live_map(&[("n1", "s1"), ("n2", "s2")]))
            .unwrap();

        assert_eq!(cache.messages("n1").len(), 1);
        assert_eq!(cache.messages("n2").len(), 1);
        assert!(cache.messages("n3").is_empty());
    }

    #[test]
    fn unchanged_message_is_not_refetched() {
        let store = InMemoryMetaStore::new();
        store
            .put(&PropertyKey::message("n1", "m1"), &relay_message("m1", "n1"))
            .unwrap();

        let mut cache = InstanceMessagesCache::new("test");
        let live = live_map(&[("n1", "s1")]);
        cache.refresh(&store, &live).unwrap();

        store.reset_counters();
        cache.refresh(&store, &live).unwrap();

        assert_eq!(store.stat_reads("message"), 1);
        assert_eq!(store.full_reads("message"), 0);
    }

    #[test]
    fn relay_message_dropped_when_target_state_reached() {
        let mut cache = InstanceMessagesCache::new("test");
        cache.cache_messages(vec![relay_message("m1", "n1")]);

        let live = live_map(&[("n1", "s1")]);
        let view = view_with_state("n1", "s1", "MASTER");
        cache.update_relay_messages(&live, &view);

        assert!(cache.messages("n1").is_empty());
    }

    #[test]
    fn relay_message_dropped_when_precondition_gone() {
        let mut cache = InstanceMessagesCache::new("test");
        cache.cache_messages(vec![relay_message("m1", "n1")]);

        let live = live_map(&[("n1", "s1")]);
        // Partition moved to OFFLINE: neither from-state nor to-state.
        let view = view_with_state("n1", "s1", "OFFLINE");
        cache.update_relay_messages(&live, &view);

        assert!(cache.messages("n1").is_empty());
    }

    #[test]
    fn relay_message_kept_while_precondition_holds() {
        let mut cache = InstanceMessagesCache::new("test");
        cache.cache_messages(vec![relay_message("m1", "n1")]);

        let live = live_map(&[("n1", "s1")]);
        let view = view_with_state("n1", "s1", "SLAVE");
        cache.update_relay_messages(&live, &view);

        assert_eq!(cache.messages("n1").len(), 1);
    }

    #[test]
    fn relay_message_kept_when_no_state_reported() {
        let mut cache = InstanceMessagesCache::new("test");
        cache.cache_messages(vec![relay_message("m1", "n1")]);

        let live = live_map(&[("n1", "s1")]);
        cache.update_relay_messages(&live, &CurrentStateView::new());

        assert_eq!(cache.messages("n1").len(), 1);
    }

    #[test]
    fn non_relay_messages_pass_through_refinement() {
        let mut message = relay_message("m1", "n1");
        message.is_relay = false;

        let mut cache = InstanceMessagesCache::new("test");
        cache.cache_messages(vec![message]);

        let live = live_map(&[("n1", "s1")]);
        let view = view_with_state("n1", "s1", "MASTER");
        cache.update_relay_messages(&live, &view);

        assert_eq!(cache.messages("n1").len(), 1);
    }

    #[test]
    fn injected_messages_overlay_until_next_refresh() {
        let store = InMemoryMetaStore::new();
        let mut cache = InstanceMessagesCache::new("test");
        let live = live_map(&[("n1", "s1")]);
        cache.refresh(&store, &live).unwrap();

        cache.cache_messages(vec![relay_message("inj", "n1")]);
        assert_eq!(cache.messages("n1").len(), 1);

        // Next refresh rebuilds from the (empty) store.
        cache.refresh(&store, &live).unwrap();
        assert!(cache.messages("n1").is_empty());
    }

    #[test]
    fn custom_relay_filter_is_used() {
        let mut cache = InstanceMessagesCache::new("test");
        cache.set_relay_filter(Box::new(|_, _, _| false));
        cache.cache_messages(vec![relay_message("m1", "n1")]);

        let live = live_map(&[("n1", "s1")]);
        cache.update_relay_messages(&live, &CurrentStateView::new());

        assert!(cache.messages("n1").is_empty());
    }
}
