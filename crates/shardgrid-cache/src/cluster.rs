//! Cluster-data aggregator.
//!
//! `ClusterCache` owns the three sub-caches and the category-level maps,
//! drives selective refresh off the dirty-bit table, computes the derived
//! instance sets, and serves the read-only view the rebalance pipeline
//! consumes. One refresh produces one consistent snapshot; readers hold
//! `Arc` snapshots and never observe a half-applied refresh.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};

use shardgrid_meta::{
    ClusterConfig, ClusterConstraints, ConstraintType, CurrentState, ExternalView, IdealMapping,
    IdealState, InstanceConfig, InstanceName, JobConfig, JobContext, LiveInstance, MaintenanceSignal,
    Message, MetaStore, ParticipantHistory, PartitionName, PropertyKey, ResourceAssignment,
    ResourceConfig, ResourceName, StateModelDefinition, TaskContextRecord, WorkflowConfig,
    WorkflowContext, child_values_map, get_typed, set_typed,
};

use crate::current_state::{CurrentStateCache, CurrentStateView};
use crate::dirty::{ChangeCategory, ChangeNotifier, DirtyFlags};
use crate::error::CacheResult;
use crate::messages::{InstanceMessagesCache, RelayFilter};
use crate::task_data::TaskDataCache;

/// Replica count returned when an ideal state is absent or unparseable.
const REPLICAS_UNKNOWN: i32 = -1;

/// Snapshot cache of all cluster state consumed by one pipeline iteration.
///
/// Construction leaves every category dirty, so the first
/// [`ClusterCache::refresh`] loads the whole world. Between refreshes,
/// watcher callbacks mark categories dirty through the [`ChangeNotifier`]
/// handle; refresh reloads exactly the dirty categories and then
/// republishes the live maps as immutable snapshots.
pub struct ClusterCache {
    cluster_name: String,
    flags: Arc<DirtyFlags>,

    // Shadow maps: staging state reloaded per category during refresh (or
    // seeded by the test setters), copied into the live snapshots below.
    ideal_state_shadow: HashMap<ResourceName, IdealState>,
    live_instance_shadow: HashMap<InstanceName, LiveInstance>,
    instance_config_shadow: HashMap<InstanceName, InstanceConfig>,
    resource_config_shadow: HashMap<ResourceName, ResourceConfig>,

    // Live snapshots served to readers.
    ideal_states: Arc<HashMap<ResourceName, IdealState>>,
    live_instances: Arc<HashMap<InstanceName, LiveInstance>>,
    instance_configs: Arc<HashMap<InstanceName, InstanceConfig>>,
    resource_configs: Arc<HashMap<ResourceName, ResourceConfig>>,
    state_model_defs: Arc<HashMap<String, StateModelDefinition>>,
    constraints: HashMap<String, ClusterConstraints>,
    cluster_config: Option<ClusterConfig>,
    ideal_state_rules: HashMap<String, HashMap<String, String>>,
    maintenance_mode: bool,

    // Derived indices, recomputed each refresh.
    disabled_instances: HashSet<InstanceName>,
    disabled_instances_for_partition:
        HashMap<ResourceName, HashMap<PartitionName, HashSet<InstanceName>>>,
    instance_offline_times: HashMap<InstanceName, i64>,
    offline_times_stale: bool,

    // Scratch state owned by pipeline stages; reset semantics only.
    missing_top_states: HashMap<ResourceName, HashMap<PartitionName, i64>>,
    target_external_views: HashMap<ResourceName, ExternalView>,
    participant_active_task_counts: HashMap<InstanceName, i32>,

    // Cross-run memo caches, invalidated by any primary-category reload.
    resource_assignment_memo: HashMap<ResourceName, ResourceAssignment>,
    ideal_mapping_memo: HashMap<ResourceName, IdealMapping>,

    current_state_cache: CurrentStateCache,
    message_cache: InstanceMessagesCache,
    task_data_cache: TaskDataCache,
    task_cache: bool,

    async_tasks_handle: Option<Handle>,
}

impl ClusterCache {
    pub fn new(cluster_name: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            flags: Arc::new(DirtyFlags::new()),
            ideal_state_shadow: HashMap::new(),
            live_instance_shadow: HashMap::new(),
            instance_config_shadow: HashMap::new(),
            resource_config_shadow: HashMap::new(),
            ideal_states: Arc::new(HashMap::new()),
            live_instances: Arc::new(HashMap::new()),
            instance_configs: Arc::new(HashMap::new()),
            resource_configs: Arc::new(HashMap::new()),
            state_model_defs: Arc::new(HashMap::new()),
            constraints: HashMap::new(),
            cluster_config: None,
            ideal_state_rules: HashMap::new(),
            maintenance_mode: false,
            disabled_instances: HashSet::new(),
            disabled_instances_for_partition: HashMap::new(),
            instance_offline_times: HashMap::new(),
            offline_times_stale: true,
            missing_top_states: HashMap::new(),
            target_external_views: HashMap::new(),
            participant_active_task_counts: HashMap::new(),
            resource_assignment_memo: HashMap::new(),
            ideal_mapping_memo: HashMap::new(),
            current_state_cache: CurrentStateCache::new(cluster_name),
            message_cache: InstanceMessagesCache::new(cluster_name),
            task_data_cache: TaskDataCache::new(cluster_name),
            task_cache: false,
            async_tasks_handle: None,
        }
    }

    /// Handle for watcher callbacks; cloneable and lock-free.
    pub fn notifier(&self) -> ChangeNotifier {
        ChangeNotifier::new(Arc::clone(&self.flags))
    }

    /// Mark a category dirty for the next refresh.
    pub fn notify_data_change(&self, category: ChangeCategory) {
        self.flags.mark(category);
    }

    /// Mark every category dirty, forcing a whole-world reload next refresh.
    pub fn require_full_refresh(&self) {
        self.flags.mark_all();
    }

    /// Rebuild the snapshot from the metadata store.
    ///
    /// Reloads dirty primary categories into the shadow maps, republishes
    /// the live snapshots, refreshes the sub-caches in dependency order
    /// (messages, then current states, then relay refinement), and
    /// recomputes the derived indices.
    ///
    /// On a transport error the refresh aborts: live maps keep their prior
    /// values, and dirty bits already cleared stay cleared. Callers that
    /// want a retry should [`Self::require_full_refresh`] first.
    pub fn refresh<S: MetaStore + ?Sized>(&mut self, store: &S) -> CacheResult<()> {
        let started = Instant::now();
        info!(cluster = %self.cluster_name, "starting cluster cache refresh");

        self.reload_dirty_categories(store)?;

        // Publish the live snapshots. Copies, so later shadow seeding never
        // tears the maps readers are holding.
        self.ideal_states = Arc::new(self.ideal_state_shadow.clone());
        self.live_instances = Arc::new(self.live_instance_shadow.clone());
        self.instance_configs = Arc::new(self.instance_config_shadow.clone());
        self.resource_configs = Arc::new(self.resource_config_shadow.clone());

        if self.offline_times_stale {
            self.update_offline_instance_history(store)?;
        }

        if self.task_cache {
            self.task_data_cache.refresh(store, &self.resource_configs)?;
        }

        self.state_model_defs =
            Arc::new(child_values_map(store, &PropertyKey::StateModelDefs)?);
        self.constraints = child_values_map(store, &PropertyKey::Constraints)?;
        self.cluster_config = get_typed(store, &PropertyKey::ClusterConfig)?;

        self.message_cache.refresh(store, &self.live_instances)?;
        self.current_state_cache.refresh(store, &self.live_instances)?;

        // Relay messages are validated against the current-state view
        // published just above, so ordering between these two is fixed.
        let view = self.current_state_cache.view();
        self.message_cache
            .update_relay_messages(&self.live_instances, &view);

        self.ideal_state_rules = match &self.cluster_config {
            Some(config) => config.ideal_state_rules.clone(),
            None => {
                warn!(cluster = %self.cluster_name, "cluster config is missing");
                HashMap::new()
            }
        };

        let maintenance: Option<MaintenanceSignal> =
            get_typed(store, &PropertyKey::Maintenance)?;
        self.maintenance_mode = maintenance.is_some();

        self.update_disabled_instances();

        info!(
            cluster = %self.cluster_name,
            live_instances = self.live_instances.len(),
            resources = self.ideal_states.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "finished cluster cache refresh"
        );
        trace!(cache = ?self, "cache content after refresh");
        Ok(())
    }

    fn reload_dirty_categories<S: MetaStore + ?Sized>(&mut self, store: &S) -> CacheResult<()> {
        if self.flags.take(ChangeCategory::IdealState) {
            self.clear_memo_caches();
            self.ideal_state_shadow = child_values_map(store, &PropertyKey::IdealStates)?;
            debug!(count = self.ideal_state_shadow.len(), "reloaded ideal states");
        }

        if self.flags.take(ChangeCategory::LiveInstance) {
            self.clear_memo_caches();
            self.live_instance_shadow = child_values_map(store, &PropertyKey::LiveInstances)?;
            self.offline_times_stale = true;
            debug!(count = self.live_instance_shadow.len(), "reloaded live instances");
        }

        if self.flags.take(ChangeCategory::InstanceConfig) {
            self.clear_memo_caches();
            self.instance_config_shadow =
                child_values_map(store, &PropertyKey::InstanceConfigs)?;
            debug!(count = self.instance_config_shadow.len(), "reloaded instance configs");
        }

        if self.flags.take(ChangeCategory::ResourceConfig) {
            self.clear_memo_caches();
            self.resource_config_shadow =
                child_values_map(store, &PropertyKey::ResourceConfigs)?;
            debug!(count = self.resource_config_shadow.len(), "reloaded resource configs");
        }

        Ok(())
    }

    /// Record offline timestamps for configured instances that are not
    /// live, transitioning store-side history from online to offline where
    /// needed.
    fn update_offline_instance_history<S: MetaStore + ?Sized>(
        &mut self,
        store: &S,
    ) -> CacheResult<()> {
        let mut offline_times = HashMap::new();

        for instance in self.instance_configs.keys() {
            if self.live_instances.contains_key(instance) {
                continue;
            }
            let key = PropertyKey::participant_history(instance);
            let mut history: ParticipantHistory = get_typed(store, &key)?
                .unwrap_or_else(|| ParticipantHistory::new(instance));

            if history.last_offline_time == ParticipantHistory::ONLINE {
                history.report_offline();
                // Write-back failure is logged but does not abort the
                // refresh; the in-memory timestamp still stands.
                match set_typed(store, &key, &history) {
                    Ok(true) => {}
                    Ok(false) => error!(%instance, "store rejected participant history write"),
                    Err(e) => error!(%instance, error = %e, "failed to persist participant history"),
                }
            }
            offline_times.insert(instance.clone(), history.last_offline_time);
        }

        self.instance_offline_times = offline_times;
        self.offline_times_stale = false;
        Ok(())
    }

    /// Recompute the disabled-instance set and the per-partition disabled
    /// map from instance configs, then union in the cluster-wide list.
    fn update_disabled_instances(&mut self) {
        self.disabled_instances.clear();
        self.disabled_instances_for_partition.clear();

        for config in self.instance_configs.values() {
            if !config.enabled {
                self.disabled_instances.insert(config.instance_name.clone());
            }
            for (resource, partitions) in &config.disabled_partitions {
                let by_partition = self
                    .disabled_instances_for_partition
                    .entry(resource.clone())
                    .or_default();
                for partition in partitions {
                    by_partition
                        .entry(partition.clone())
                        .or_default()
                        .insert(config.instance_name.clone());
                }
            }
        }

        if let Some(config) = &self.cluster_config {
            self.disabled_instances
                .extend(config.disabled_instances.keys().cloned());
        }
    }

    fn clear_memo_caches(&mut self) {
        self.resource_assignment_memo.clear();
        self.ideal_mapping_memo.clear();
    }

    // ── Seeding setters (shadow maps only; applied on next refresh) ────

    /// Seed the ideal-state shadow map. Takes effect on the next refresh,
    /// provided the category is not dirty (a dirty category reloads from
    /// the store and overwrites the seed).
    pub fn set_ideal_states(&mut self, ideal_states: Vec<IdealState>) {
        self.ideal_state_shadow = ideal_states
            .into_iter()
            .map(|is| (is.resource_name.clone(), is))
            .collect();
    }

    /// Seed the live-instance shadow map; also marks the offline-time
    /// index stale, exactly as a store-driven live-instance reload would.
    pub fn set_live_instances(&mut self, live_instances: Vec<LiveInstance>) {
        self.live_instance_shadow = live_instances
            .into_iter()
            .map(|li| (li.instance_name.clone(), li))
            .collect();
        self.offline_times_stale = true;
    }

    /// Seed the instance-config shadow map.
    pub fn set_instance_configs(&mut self, instance_configs: Vec<InstanceConfig>) {
        self.instance_config_shadow = instance_configs
            .into_iter()
            .map(|ic| (ic.instance_name.clone(), ic))
            .collect();
    }

    /// Seed the cluster-config slot directly.
    pub fn set_cluster_config(&mut self, cluster_config: Option<ClusterConfig>) {
        self.cluster_config = cluster_config;
    }

    // ── Read API ───────────────────────────────────────────────────────

    /// The cluster name, preferring the fetched cluster config's name.
    pub fn cluster_name(&self) -> &str {
        self.cluster_config
            .as_ref()
            .map(|config| config.cluster_name.as_str())
            .unwrap_or(&self.cluster_name)
    }

    pub fn cluster_config(&self) -> Option<&ClusterConfig> {
        self.cluster_config.as_ref()
    }

    pub fn ideal_states(&self) -> Arc<HashMap<ResourceName, IdealState>> {
        Arc::clone(&self.ideal_states)
    }

    pub fn ideal_state(&self, resource: &str) -> Option<&IdealState> {
        self.ideal_states.get(resource)
    }

    pub fn ideal_state_rules(&self) -> &HashMap<String, HashMap<String, String>> {
        &self.ideal_state_rules
    }

    pub fn live_instances(&self) -> Arc<HashMap<InstanceName, LiveInstance>> {
        Arc::clone(&self.live_instances)
    }

    pub fn instance_configs(&self) -> Arc<HashMap<InstanceName, InstanceConfig>> {
        Arc::clone(&self.instance_configs)
    }

    pub fn resource_configs(&self) -> Arc<HashMap<ResourceName, ResourceConfig>> {
        Arc::clone(&self.resource_configs)
    }

    pub fn resource_config(&self, resource: &str) -> Option<&ResourceConfig> {
        self.resource_configs.get(resource)
    }

    /// Every configured instance name, live or not.
    pub fn all_instances(&self) -> HashSet<InstanceName> {
        self.instance_configs.keys().cloned().collect()
    }

    /// Configured instances that are not disabled.
    pub fn enabled_instances(&self) -> HashSet<InstanceName> {
        self.instance_configs
            .keys()
            .filter(|name| !self.disabled_instances.contains(*name))
            .cloned()
            .collect()
    }

    /// Live instances that are not disabled.
    pub fn enabled_live_instances(&self) -> HashSet<InstanceName> {
        self.live_instances
            .keys()
            .filter(|name| !self.disabled_instances.contains(*name))
            .cloned()
            .collect()
    }

    /// Configured instances whose config carries the given tag.
    pub fn instances_with_tag(&self, tag: &str) -> HashSet<InstanceName> {
        self.instance_configs
            .values()
            .filter(|config| config.contains_tag(tag))
            .map(|config| config.instance_name.clone())
            .collect()
    }

    /// Live, enabled instances whose config carries the given tag.
    pub fn enabled_live_instances_with_tag(&self, tag: &str) -> HashSet<InstanceName> {
        let tagged = self.instances_with_tag(tag);
        self.enabled_live_instances()
            .into_iter()
            .filter(|name| tagged.contains(name))
            .collect()
    }

    /// Instances disabled either globally or for this specific partition.
    pub fn disabled_instances_for_partition(
        &self,
        resource: &str,
        partition: &str,
    ) -> HashSet<InstanceName> {
        let mut disabled = self.disabled_instances.clone();
        if let Some(instances) = self
            .disabled_instances_for_partition
            .get(resource)
            .and_then(|by_partition| by_partition.get(partition))
        {
            disabled.extend(instances.iter().cloned());
        }
        disabled
    }

    /// Instances disabled cluster-wide or by their own config.
    pub fn disabled_instances(&self) -> &HashSet<InstanceName> {
        &self.disabled_instances
    }

    /// Last-offline timestamps for configured instances that are not live.
    pub fn instance_offline_times(&self) -> &HashMap<InstanceName, i64> {
        &self.instance_offline_times
    }

    /// Replica count for a resource: the live-instance count for the
    /// any-live-instance sentinel, `-1` when the ideal state is absent or
    /// the replicas field does not parse.
    pub fn replicas(&self, resource: &str) -> i32 {
        let Some(ideal_state) = self.ideal_states.get(resource) else {
            return REPLICAS_UNKNOWN;
        };
        let Some(replicas) = ideal_state.replicas.as_deref() else {
            error!(resource, "ideal state has no replica count");
            return REPLICAS_UNKNOWN;
        };
        if replicas == IdealState::ANY_LIVEINSTANCE {
            return self.live_instances.len() as i32;
        }
        match replicas.parse::<i32>() {
            Ok(count) => count,
            Err(_) => {
                error!(resource, replicas, "invalid replica count");
                REPLICAS_UNKNOWN
            }
        }
    }

    pub fn state_model_defs(&self) -> Arc<HashMap<String, StateModelDefinition>> {
        Arc::clone(&self.state_model_defs)
    }

    pub fn state_model_def(&self, model_ref: &str) -> Option<&StateModelDefinition> {
        self.state_model_defs.get(model_ref)
    }

    pub fn constraint(&self, constraint_type: ConstraintType) -> Option<&ClusterConstraints> {
        self.constraints.get(constraint_type.as_str())
    }

    pub fn is_maintenance_mode_enabled(&self) -> bool {
        self.maintenance_mode
    }

    // ── Sub-cache passthroughs ─────────────────────────────────────────

    /// The full current-state view, shared immutably.
    pub fn current_state_view(&self) -> Arc<CurrentStateView> {
        self.current_state_cache.view()
    }

    /// All current states reported by one instance, across sessions.
    /// Empty if the instance has none.
    pub fn current_states(
        &self,
        instance: &str,
    ) -> HashMap<String, HashMap<ResourceName, CurrentState>> {
        self.current_state_cache.current_states(instance)
    }

    /// Current states for one instance under one session. Empty if absent.
    pub fn current_state(
        &self,
        instance: &str,
        session: &str,
    ) -> HashMap<ResourceName, CurrentState> {
        self.current_state_cache.current_state(instance, session)
    }

    /// Pending messages for one instance. Empty if none.
    pub fn messages(&self, instance: &str) -> HashMap<String, Message> {
        self.message_cache.messages(instance)
    }

    /// Inject pre-known messages between refreshes.
    pub fn cache_messages(&mut self, messages: Vec<Message>) {
        self.message_cache.cache_messages(messages);
    }

    /// Replace the relay-message validation rule.
    pub fn set_relay_filter(&mut self, filter: RelayFilter) {
        self.message_cache.set_relay_filter(filter);
    }

    pub fn job_configs(&self) -> &HashMap<ResourceName, JobConfig> {
        self.task_data_cache.job_configs()
    }

    pub fn job_config(&self, resource: &str) -> Option<&JobConfig> {
        self.task_data_cache.job_config(resource)
    }

    pub fn workflow_configs(&self) -> &HashMap<ResourceName, WorkflowConfig> {
        self.task_data_cache.workflow_configs()
    }

    pub fn workflow_config(&self, resource: &str) -> Option<&WorkflowConfig> {
        self.task_data_cache.workflow_config(resource)
    }

    pub fn job_context(&self, resource: &str) -> Option<&JobContext> {
        self.task_data_cache.job_context(resource)
    }

    pub fn workflow_context(&self, resource: &str) -> Option<&WorkflowContext> {
        self.task_data_cache.workflow_context(resource)
    }

    pub fn contexts(&self) -> HashMap<ResourceName, TaskContextRecord> {
        self.task_data_cache.contexts()
    }

    /// Persist and cache an updated job context.
    pub fn update_job_context<S: MetaStore + ?Sized>(
        &mut self,
        store: &S,
        resource: &str,
        context: JobContext,
    ) -> CacheResult<()> {
        self.task_data_cache.update_job_context(store, resource, context)
    }

    /// Persist and cache an updated workflow context.
    pub fn update_workflow_context<S: MetaStore + ?Sized>(
        &mut self,
        store: &S,
        resource: &str,
        context: WorkflowContext,
    ) -> CacheResult<()> {
        self.task_data_cache
            .update_workflow_context(store, resource, context)
    }

    // ── Scratch state for pipeline stages ──────────────────────────────

    pub fn missing_top_states(&mut self) -> &mut HashMap<ResourceName, HashMap<PartitionName, i64>> {
        &mut self.missing_top_states
    }

    pub fn target_external_view(&self, resource: &str) -> Option<&ExternalView> {
        self.target_external_views.get(resource)
    }

    pub fn update_target_external_view(&mut self, resource: &str, view: ExternalView) {
        self.target_external_views.insert(resource.to_string(), view);
    }

    pub fn participant_active_task_count(&self, instance: &str) -> Option<i32> {
        self.participant_active_task_counts.get(instance).copied()
    }

    pub fn set_participant_active_task_count(&mut self, instance: &str, count: i32) {
        self.participant_active_task_counts
            .insert(instance.to_string(), count);
    }

    /// Zero the active-task counter for every live instance, ahead of the
    /// pipeline re-filling it.
    pub fn reset_active_task_counts(&mut self) {
        self.participant_active_task_counts = self
            .live_instances
            .keys()
            .map(|name| (name.clone(), 0))
            .collect();
    }

    /// Drop monitoring scratch collected by pipeline stages.
    pub fn clear_monitoring_records(&mut self) {
        self.missing_top_states.clear();
    }

    // ── Cross-run memo caches ──────────────────────────────────────────

    pub fn cached_resource_assignment(&self, resource: &str) -> Option<&ResourceAssignment> {
        self.resource_assignment_memo.get(resource)
    }

    pub fn cached_resource_assignments(&self) -> &HashMap<ResourceName, ResourceAssignment> {
        &self.resource_assignment_memo
    }

    pub fn cache_resource_assignment(&mut self, resource: &str, assignment: ResourceAssignment) {
        self.resource_assignment_memo
            .insert(resource.to_string(), assignment);
    }

    pub fn cached_ideal_mapping(&self, resource: &str) -> Option<&IdealMapping> {
        self.ideal_mapping_memo.get(resource)
    }

    pub fn cached_ideal_mappings(&self) -> &HashMap<ResourceName, IdealMapping> {
        &self.ideal_mapping_memo
    }

    pub fn cache_ideal_mapping(&mut self, resource: &str, mapping: IdealMapping) {
        self.ideal_mapping_memo.insert(resource.to_string(), mapping);
    }

    // ── Mode switches and externally owned resources ───────────────────

    /// Whether this cache serves the task pipeline (and so refreshes the
    /// task sub-cache).
    pub fn is_task_cache(&self) -> bool {
        self.task_cache
    }

    pub fn set_task_cache(&mut self, task_cache: bool) {
        self.task_cache = task_cache;
    }

    /// Externally owned runtime handle for async follow-up work; the cache
    /// only stores it.
    pub fn async_tasks_handle(&self) -> Option<&Handle> {
        self.async_tasks_handle.as_ref()
    }

    pub fn set_async_tasks_handle(&mut self, handle: Option<Handle>) {
        self.async_tasks_handle = handle;
    }
}

impl std::fmt::Debug for ClusterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCache")
            .field("cluster_name", &self.cluster_name)
            .field("live_instances", &self.live_instances)
            .field("ideal_states", &self.ideal_states)
            .field("instance_configs", &self.instance_configs)
            .field("resource_configs", &self.resource_configs)
            .field("state_model_defs", &self.state_model_defs)
            .field("cluster_config", &self.cluster_config)
            .field("disabled_instances", &self.disabled_instances)
            .field("maintenance_mode", &self.maintenance_mode)
            .field("task_data_cache", &self.task_data_cache)
            .field("message_cache", &self.message_cache)
            .field("current_state_cache", &self.current_state_cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardgrid_meta::InMemoryMetaStore;

    fn seed_instance(store: &InMemoryMetaStore, name: &str, session: &str, enabled: bool) {
        store
            .put(
                &PropertyKey::live_instance(name),
                &LiveInstance::new(name, session),
            )
            .unwrap();
        let mut config = InstanceConfig::new(name);
        config.enabled = enabled;
        store
            .put(&PropertyKey::instance_config(name), &config)
            .unwrap();
    }

    #[test]
    fn disabled_set_unions_config_and_cluster_lists() {
        let store = InMemoryMetaStore::new();
        seed_instance(&store, "n1", "s1", true);
        seed_instance(&store, "n2", "s2", false);
        seed_instance(&store, "n3", "s3", true);

        let mut cluster_config = ClusterConfig::new("test");
        cluster_config
            .disabled_instances
            .insert("n3".to_string(), "drained".to_string());
        store
            .put(&PropertyKey::ClusterConfig, &cluster_config)
            .unwrap();

        let mut cache = ClusterCache::new("test");
        cache.refresh(&store).unwrap();

        assert_eq!(
            cache.disabled_instances(),
            &HashSet::from(["n2".to_string(), "n3".to_string()])
        );
        assert_eq!(
            cache.enabled_live_instances(),
            HashSet::from(["n1".to_string()])
        );
    }

    #[test]
    fn per_partition_disables_layer_on_global_set() {
        let store = InMemoryMetaStore::new();
        seed_instance(&store, "n1", "s1", true);
        seed_instance(&store, "n2", "s2", false);

        let mut config = InstanceConfig::new("n1");
        config
            .disabled_partitions
            .insert("db".to_string(), vec!["db_0".to_string()]);
        store
            .put(&PropertyKey::instance_config("n1"), &config)
            .unwrap();

        let mut cache = ClusterCache::new("test");
        cache.refresh(&store).unwrap();

        let disabled = cache.disabled_instances_for_partition("db", "db_0");
        assert!(disabled.contains("n1"));
        assert!(disabled.contains("n2"));

        let other = cache.disabled_instances_for_partition("db", "db_1");
        assert!(!other.contains("n1"));
        assert!(other.contains("n2"));
    }

    #[test]
    fn replicas_parses_sentinel_and_numbers() {
        let store = InMemoryMetaStore::new();
        seed_instance(&store, "n1", "s1", true);
        seed_instance(&store, "n2", "s2", true);

        let mut numeric = IdealState::new("db");
        numeric.replicas = Some("3".to_string());
        store.put(&PropertyKey::ideal_state("db"), &numeric).unwrap();

        let mut any_live = IdealState::new("idx");
        any_live.replicas = Some(IdealState::ANY_LIVEINSTANCE.to_string());
        store.put(&PropertyKey::ideal_state("idx"), &any_live).unwrap();

        let mut bad = IdealState::new("bad");
        bad.replicas = Some("lots".to_string());
        store.put(&PropertyKey::ideal_state("bad"), &bad).unwrap();

        let mut cache = ClusterCache::new("test");
        cache.refresh(&store).unwrap();

        assert_eq!(cache.replicas("db"), 3);
        assert_eq!(cache.replicas("idx"), 2);
        assert_eq!(cache.replicas("bad"), -1);
        assert_eq!(cache.replicas("absent"), -1);
    }

    #[test]
    fn instances_with_tag_filters_configs() {
        let store = InMemoryMetaStore::new();
        seed_instance(&store, "n1", "s1", true);
        seed_instance(&store, "n2", "s2", true);

        let mut tagged = InstanceConfig::new("n1");
        tagged.tags.push("frontend".to_string());
        store
            .put(&PropertyKey::instance_config("n1"), &tagged)
            .unwrap();

        let mut cache = ClusterCache::new("test");
        cache.refresh(&store).unwrap();

        assert_eq!(
            cache.instances_with_tag("frontend"),
            HashSet::from(["n1".to_string()])
        );
        assert_eq!(
            cache.enabled_live_instances_with_tag("frontend"),
            HashSet::from(["n1".to_string()])
        );
        assert!(cache.instances_with_tag("backend").is_empty());
    }

    #[test]
    fn cluster_name_prefers_fetched_config() {
        let store = InMemoryMetaStore::new();
        let mut cache = ClusterCache::new("constructed");
        cache.refresh(&store).unwrap();
        assert_eq!(cache.cluster_name(), "constructed");

        store
            .put(&PropertyKey::ClusterConfig, &ClusterConfig::new("fetched"))
            .unwrap();
        cache.refresh(&store).unwrap();
        assert_eq!(cache.cluster_name(), "fetched");
    }

    #[test]
    fn maintenance_mode_follows_signal_presence() {
        let store = InMemoryMetaStore::new();
        let mut cache = ClusterCache::new("test");
        cache.refresh(&store).unwrap();
        assert!(!cache.is_maintenance_mode_enabled());

        store
            .put(
                &PropertyKey::Maintenance,
                &MaintenanceSignal {
                    reason: Some("upgrade".to_string()),
                    timestamp: 1_700_000_000_000,
                },
            )
            .unwrap();
        cache.refresh(&store).unwrap();
        assert!(cache.is_maintenance_mode_enabled());

        store.remove(&PropertyKey::Maintenance);
        cache.refresh(&store).unwrap();
        assert!(!cache.is_maintenance_mode_enabled());
    }

    #[test]
    fn reset_active_task_counts_covers_live_instances() {
        let store = InMemoryMetaStore::new();
        seed_instance(&store, "n1", "s1", true);

        let mut cache = ClusterCache::new("test");
        cache.refresh(&store).unwrap();

        cache.set_participant_active_task_count("n1", 7);
        assert_eq!(cache.participant_active_task_count("n1"), Some(7));

        cache.reset_active_task_counts();
        assert_eq!(cache.participant_active_task_count("n1"), Some(0));
        assert_eq!(cache.participant_active_task_count("n9"), None);
    }

    #[test]
    fn task_sub_cache_skipped_unless_enabled() {
        let store = InMemoryMetaStore::new();
        let mut config = ResourceConfig::new("job-1");
        config.task = Some(shardgrid_meta::TaskResourceConfig::Job(JobConfig {
            job_name: "job-1".to_string(),
            workflow_name: "wf".to_string(),
            command: "run".to_string(),
            max_attempts_per_task: 1,
        }));
        store
            .put(&PropertyKey::resource_config("job-1"), &config)
            .unwrap();

        let mut cache = ClusterCache::new("test");
        cache.refresh(&store).unwrap();
        assert!(cache.job_configs().is_empty());

        cache.set_task_cache(true);
        cache.require_full_refresh();
        cache.refresh(&store).unwrap();
        assert_eq!(cache.job_configs().len(), 1);
    }
}
