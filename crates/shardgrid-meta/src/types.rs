//! Domain record types for the cluster metadata tree.
//!
//! These are the typed shapes of the records the snapshot cache reads:
//! participant liveness and configuration, declarative resource placement,
//! reported current state, pending messages, and the task-subsystem configs
//! and contexts. All types are JSON-serializable for storage.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of a participant node.
pub type InstanceName = String;

/// Name of a logical resource.
pub type ResourceName = String;

/// Name of one partition of a resource.
pub type PartitionName = String;

/// Ephemeral session token of a participant's store connection.
pub type SessionId = String;

// ── Participants ───────────────────────────────────────────────────

/// Ephemeral record published by a participant while it is online.
///
/// Presence of this record means the instance is currently connected;
/// the session id changes on every reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveInstance {
    pub instance_name: InstanceName,
    pub session_id: SessionId,
}

impl LiveInstance {
    pub fn new(instance_name: &str, session_id: &str) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            session_id: session_id.to_string(),
        }
    }
}

/// Persistent per-instance configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub instance_name: InstanceName,
    /// Whether the instance may receive assignments at all.
    pub enabled: bool,
    /// Group tags used to scope resources to instance pools.
    pub tags: Vec<String>,
    /// Partitions explicitly disabled on this instance, per resource.
    pub disabled_partitions: HashMap<ResourceName, Vec<PartitionName>>,
}

impl InstanceConfig {
    pub fn new(instance_name: &str) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            enabled: true,
            tags: Vec::new(),
            disabled_partitions: HashMap::new(),
        }
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Offline/online transition history for a participant.
///
/// Written back by the cache when it observes an instance go offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantHistory {
    pub instance_name: InstanceName,
    /// Millis since epoch of the last offline transition, or [`Self::ONLINE`].
    pub last_offline_time: i64,
    /// Past offline timestamps, most recent last.
    pub offline_history: Vec<i64>,
}

impl ParticipantHistory {
    /// Sentinel meaning the instance is (or was last known) online.
    pub const ONLINE: i64 = -1;

    pub fn new(instance_name: &str) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            last_offline_time: Self::ONLINE,
            offline_history: Vec::new(),
        }
    }

    /// Record an offline transition at the current wall clock.
    pub fn report_offline(&mut self) {
        self.last_offline_time = epoch_millis();
        self.offline_history.push(self.last_offline_time);
    }
}

// ── Resources ──────────────────────────────────────────────────────

/// Declarative desired placement of a resource's partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdealState {
    pub resource_name: ResourceName,
    /// Reference to the state model governing this resource.
    pub state_model_def_ref: Option<String>,
    /// Replica count as a string; may be [`Self::ANY_LIVEINSTANCE`].
    pub replicas: Option<String>,
    /// Desired instance preference order per partition.
    pub preference_lists: HashMap<PartitionName, Vec<InstanceName>>,
}

impl IdealState {
    /// Replica sentinel: one replica on every live instance.
    pub const ANY_LIVEINSTANCE: &'static str = "ANY_LIVEINSTANCE";

    pub fn new(resource_name: &str) -> Self {
        Self {
            resource_name: resource_name.to_string(),
            state_model_def_ref: None,
            replicas: None,
            preference_lists: HashMap::new(),
        }
    }
}

/// Optional per-resource configuration.
///
/// Resources managed by the task subsystem carry a [`TaskResourceConfig`];
/// plain resources leave it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub resource_name: ResourceName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskResourceConfig>,
}

impl ResourceConfig {
    pub fn new(resource_name: &str) -> Self {
        Self {
            resource_name: resource_name.to_string(),
            task: None,
        }
    }

    pub fn job_config(&self) -> Option<&JobConfig> {
        match &self.task {
            Some(TaskResourceConfig::Job(job)) => Some(job),
            _ => None,
        }
    }

    pub fn workflow_config(&self) -> Option<&WorkflowConfig> {
        match &self.task {
            Some(TaskResourceConfig::Workflow(wf)) => Some(wf),
            _ => None,
        }
    }
}

/// Task-subsystem payload embedded in a resource config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskResourceConfig {
    Job(JobConfig),
    Workflow(WorkflowConfig),
}

/// Allowed states and transitions for a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateModelDefinition {
    pub id: String,
    pub initial_state: String,
    /// States in priority order, highest (top state) first.
    pub states: Vec<String>,
}

// ── Cluster-level records ──────────────────────────────────────────

/// Cluster-wide configuration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_name: String,
    /// Named rule sets applied to ideal states by the pipeline.
    pub ideal_state_rules: HashMap<String, HashMap<String, String>>,
    /// Instances disabled cluster-wide, keyed by instance name. The value
    /// records why/when the instance was disabled.
    pub disabled_instances: HashMap<InstanceName, String>,
}

impl ClusterConfig {
    pub fn new(cluster_name: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            ideal_state_rules: HashMap::new(),
            disabled_instances: HashMap::new(),
        }
    }
}

/// The kind of operation a constraint set applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintType {
    StateConstraint,
    MessageConstraint,
}

impl ConstraintType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateConstraint => "STATE_CONSTRAINT",
            Self::MessageConstraint => "MESSAGE_CONSTRAINT",
        }
    }
}

/// A set of named constraint items of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConstraints {
    pub constraint_type: ConstraintType,
    /// Constraint id → attribute map.
    pub items: HashMap<String, HashMap<String, String>>,
}

/// Presence of this record puts the cluster in maintenance mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceSignal {
    pub reason: Option<String>,
    /// Millis since epoch when maintenance was entered.
    pub timestamp: i64,
}

// ── Reported state and messages ────────────────────────────────────

/// A participant's reported state for the partitions of one resource,
/// scoped by the session that published it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentState {
    pub resource_name: ResourceName,
    pub session_id: SessionId,
    pub state_model_def_ref: Option<String>,
    /// Non-zero when the record body is split across bucket children; such
    /// records cannot be validated by a single stat compare.
    pub bucket_size: u32,
    pub partition_states: HashMap<PartitionName, String>,
}

impl CurrentState {
    pub fn new(resource_name: &str, session_id: &str) -> Self {
        Self {
            resource_name: resource_name.to_string(),
            session_id: session_id.to_string(),
            state_model_def_ref: None,
            bucket_size: 0,
            partition_states: HashMap::new(),
        }
    }
}

/// A pending state-transition message targeting one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub target_instance: InstanceName,
    pub resource_name: ResourceName,
    pub partition_name: PartitionName,
    pub from_state: String,
    pub to_state: String,
    /// Relay messages are forwarded between participants and must be
    /// revalidated against reported current state.
    pub is_relay: bool,
}

// ── Pipeline-produced records ──────────────────────────────────────

/// Externally visible placement, as published by the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalView {
    pub resource_name: ResourceName,
    pub state_map: HashMap<PartitionName, HashMap<InstanceName, String>>,
}

/// A computed partition → replica placement for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAssignment {
    pub resource_name: ResourceName,
    pub replica_map: HashMap<PartitionName, HashMap<InstanceName, String>>,
}

/// A computed preference-list record for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdealMapping {
    pub resource_name: ResourceName,
    pub preference_lists: HashMap<PartitionName, Vec<InstanceName>>,
}

// ── Task subsystem ─────────────────────────────────────────────────

/// Configuration of a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_name: String,
    pub workflow_name: String,
    pub command: String,
    pub max_attempts_per_task: u32,
}

/// Configuration of a workflow (a DAG of jobs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub workflow_name: String,
    pub jobs: Vec<String>,
    pub parallelism: u32,
}

/// Runtime progress of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub job_name: String,
    pub start_time: i64,
    pub finish_time: Option<i64>,
    pub partition_states: HashMap<PartitionName, String>,
}

/// Runtime progress of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub workflow_name: String,
    pub state: String,
    pub job_states: HashMap<String, String>,
    pub start_time: i64,
    pub finish_time: Option<i64>,
}

/// Union of job and workflow contexts, for the combined index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskContextRecord {
    Job(JobContext),
    Workflow(WorkflowContext),
}

/// Current wall clock in millis since epoch.
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
