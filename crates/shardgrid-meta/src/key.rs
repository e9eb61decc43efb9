//! Typed property keys for the metadata-store tree.
//!
//! Every record the cache reads or writes lives at a typed path. Keys carry
//! their parameters as named fields, so reconstructing (instance, session,
//! resource) from a key is total instead of index-based string slicing.
//! Two keys compare equal iff category and parameters are equal.

use std::fmt;

/// A typed path into the metadata-store tree.
///
/// Parent variants (`IdealStates`, `Messages`, ...) address a directory of
/// children; leaf variants address a single record. [`PropertyKey::child`]
/// derives the leaf key for a name returned by a parent listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    ClusterConfig,
    IdealStates,
    IdealState { resource: String },
    LiveInstances,
    LiveInstance { instance: String },
    InstanceConfigs,
    InstanceConfig { instance: String },
    ResourceConfigs,
    ResourceConfig { resource: String },
    StateModelDefs,
    StateModelDef { model: String },
    Constraints,
    Constraint { constraint_type: String },
    Maintenance,
    ParticipantHistory { instance: String },
    CurrentStates { instance: String, session: String },
    CurrentState { instance: String, session: String, resource: String },
    Messages { instance: String },
    Message { instance: String, id: String },
    TaskContext { resource: String },
}

impl PropertyKey {
    pub fn ideal_state(resource: &str) -> Self {
        Self::IdealState { resource: resource.to_string() }
    }

    pub fn live_instance(instance: &str) -> Self {
        Self::LiveInstance { instance: instance.to_string() }
    }

    pub fn instance_config(instance: &str) -> Self {
        Self::InstanceConfig { instance: instance.to_string() }
    }

    pub fn resource_config(resource: &str) -> Self {
        Self::ResourceConfig { resource: resource.to_string() }
    }

    pub fn state_model_def(model: &str) -> Self {
        Self::StateModelDef { model: model.to_string() }
    }

    pub fn constraint(constraint_type: &str) -> Self {
        Self::Constraint { constraint_type: constraint_type.to_string() }
    }

    pub fn participant_history(instance: &str) -> Self {
        Self::ParticipantHistory { instance: instance.to_string() }
    }

    pub fn current_states(instance: &str, session: &str) -> Self {
        Self::CurrentStates {
            instance: instance.to_string(),
            session: session.to_string(),
        }
    }

    pub fn current_state(instance: &str, session: &str, resource: &str) -> Self {
        Self::CurrentState {
            instance: instance.to_string(),
            session: session.to_string(),
            resource: resource.to_string(),
        }
    }

    pub fn messages(instance: &str) -> Self {
        Self::Messages { instance: instance.to_string() }
    }

    pub fn message(instance: &str, id: &str) -> Self {
        Self::Message {
            instance: instance.to_string(),
            id: id.to_string(),
        }
    }

    pub fn task_context(resource: &str) -> Self {
        Self::TaskContext { resource: resource.to_string() }
    }

    /// Derive the leaf key for a child name returned by listing this key.
    ///
    /// Returns `None` for leaf keys, which have no children.
    pub fn child(&self, name: &str) -> Option<PropertyKey> {
        match self {
            Self::IdealStates => Some(Self::ideal_state(name)),
            Self::LiveInstances => Some(Self::live_instance(name)),
            Self::InstanceConfigs => Some(Self::instance_config(name)),
            Self::ResourceConfigs => Some(Self::resource_config(name)),
            Self::StateModelDefs => Some(Self::state_model_def(name)),
            Self::Constraints => Some(Self::constraint(name)),
            Self::CurrentStates { instance, session } => {
                Some(Self::current_state(instance, session, name))
            }
            Self::Messages { instance } => Some(Self::message(instance, name)),
            _ => None,
        }
    }

    /// Whether this key addresses a directory of children.
    pub fn is_parent(&self) -> bool {
        matches!(
            self,
            Self::IdealStates
                | Self::LiveInstances
                | Self::InstanceConfigs
                | Self::ResourceConfigs
                | Self::StateModelDefs
                | Self::Constraints
                | Self::CurrentStates { .. }
                | Self::Messages { .. }
        )
    }

    /// Stable category tag, used for per-category accounting.
    pub fn category(&self) -> &'static str {
        match self {
            Self::ClusterConfig => "cluster_config",
            Self::IdealStates | Self::IdealState { .. } => "ideal_state",
            Self::LiveInstances | Self::LiveInstance { .. } => "live_instance",
            Self::InstanceConfigs | Self::InstanceConfig { .. } => "instance_config",
            Self::ResourceConfigs | Self::ResourceConfig { .. } => "resource_config",
            Self::StateModelDefs | Self::StateModelDef { .. } => "state_model_def",
            Self::Constraints | Self::Constraint { .. } => "constraint",
            Self::Maintenance => "maintenance",
            Self::ParticipantHistory { .. } => "participant_history",
            Self::CurrentStates { .. } | Self::CurrentState { .. } => "current_state",
            Self::Messages { .. } | Self::Message { .. } => "message",
            Self::TaskContext { .. } => "task_context",
        }
    }

    /// Render the cluster-relative tree path for this key.
    pub fn path(&self) -> String {
        match self {
            Self::ClusterConfig => "/CONFIGS/CLUSTER".to_string(),
            Self::IdealStates => "/IDEALSTATES".to_string(),
            Self::IdealState { resource } => format!("/IDEALSTATES/{resource}"),
            Self::LiveInstances => "/LIVEINSTANCES".to_string(),
            Self::LiveInstance { instance } => format!("/LIVEINSTANCES/{instance}"),
            Self::InstanceConfigs => "/CONFIGS/PARTICIPANT".to_string(),
            Self::InstanceConfig { instance } => format!("/CONFIGS/PARTICIPANT/{instance}"),
            Self::ResourceConfigs => "/CONFIGS/RESOURCE".to_string(),
            Self::ResourceConfig { resource } => format!("/CONFIGS/RESOURCE/{resource}"),
            Self::StateModelDefs => "/STATEMODELDEFS".to_string(),
            Self::StateModelDef { model } => format!("/STATEMODELDEFS/{model}"),
            Self::Constraints => "/CONFIGS/CONSTRAINT".to_string(),
            Self::Constraint { constraint_type } => {
                format!("/CONFIGS/CONSTRAINT/{constraint_type}")
            }
            Self::Maintenance => "/CONTROLLER/MAINTENANCE".to_string(),
            Self::ParticipantHistory { instance } => {
                format!("/INSTANCES/{instance}/HISTORY")
            }
            Self::CurrentStates { instance, session } => {
                format!("/INSTANCES/{instance}/CURRENTSTATES/{session}")
            }
            Self::CurrentState { instance, session, resource } => {
                format!("/INSTANCES/{instance}/CURRENTSTATES/{session}/{resource}")
            }
            Self::Messages { instance } => format!("/INSTANCES/{instance}/MESSAGES"),
            Self::Message { instance, id } => format!("/INSTANCES/{instance}/MESSAGES/{id}"),
            Self::TaskContext { resource } => {
                format!("/PROPERTYSTORE/TaskFramework/{resource}/Context")
            }
        }
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}
