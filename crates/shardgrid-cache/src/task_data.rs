//! Task-subsystem sub-cache: job/workflow configs and contexts.
//!
//! Configs are typed views over the resource-config map; contexts are
//! loaded from the store on demand and kept until their resource drops its
//! task config. Context updates write back to the store first and only
//! touch the in-memory copy once the write succeeded.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, error, info};

use shardgrid_meta::{
    JobConfig, JobContext, MetaStore, PropertyKey, ResourceConfig, ResourceName,
    TaskContextRecord, WorkflowConfig, WorkflowContext, get_typed, set_typed,
};

use crate::error::{CacheError, CacheResult};

/// Caches task-subsystem state derived from resource configs.
#[derive(Debug)]
pub struct TaskDataCache {
    cluster_name: String,
    job_configs: HashMap<ResourceName, JobConfig>,
    workflow_configs: HashMap<ResourceName, WorkflowConfig>,
    job_contexts: HashMap<ResourceName, JobContext>,
    workflow_contexts: HashMap<ResourceName, WorkflowContext>,
}

impl TaskDataCache {
    pub fn new(cluster_name: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            job_configs: HashMap::new(),
            workflow_configs: HashMap::new(),
            job_contexts: HashMap::new(),
            workflow_contexts: HashMap::new(),
        }
    }

    /// Rebuild config views from the resource-config map and fetch contexts
    /// for task resources that do not have one cached yet.
    pub fn refresh<S: MetaStore + ?Sized>(
        &mut self,
        store: &S,
        resource_configs: &HashMap<ResourceName, ResourceConfig>,
    ) -> CacheResult<()> {
        let started = Instant::now();

        self.job_configs = resource_configs
            .iter()
            .filter_map(|(name, config)| {
                config.job_config().map(|job| (name.clone(), job.clone()))
            })
            .collect();
        self.workflow_configs = resource_configs
            .iter()
            .filter_map(|(name, config)| {
                config
                    .workflow_config()
                    .map(|workflow| (name.clone(), workflow.clone()))
            })
            .collect();

        // Contexts may briefly outlive their configs, so stale entries are
        // only dropped once the resource has no task config at all.
        self.job_contexts
            .retain(|name, _| self.job_configs.contains_key(name));
        self.workflow_contexts
            .retain(|name, _| self.workflow_configs.contains_key(name));

        for name in self.job_configs.keys() {
            if self.job_contexts.contains_key(name) {
                continue;
            }
            let key = PropertyKey::task_context(name);
            if let Some(context) = get_typed::<_, JobContext>(store, &key)? {
                self.job_contexts.insert(name.clone(), context);
            }
        }
        for name in self.workflow_configs.keys() {
            if self.workflow_contexts.contains_key(name) {
                continue;
            }
            let key = PropertyKey::task_context(name);
            if let Some(context) = get_typed::<_, WorkflowContext>(store, &key)? {
                self.workflow_contexts.insert(name.clone(), context);
            }
        }

        info!(
            cluster = %self.cluster_name,
            jobs = self.job_configs.len(),
            workflows = self.workflow_configs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "refreshed task data"
        );
        Ok(())
    }

    pub fn job_configs(&self) -> &HashMap<ResourceName, JobConfig> {
        &self.job_configs
    }

    pub fn job_config(&self, resource: &str) -> Option<&JobConfig> {
        self.job_configs.get(resource)
    }

    pub fn workflow_configs(&self) -> &HashMap<ResourceName, WorkflowConfig> {
        &self.workflow_configs
    }

    pub fn workflow_config(&self, resource: &str) -> Option<&WorkflowConfig> {
        self.workflow_configs.get(resource)
    }

    pub fn job_context(&self, resource: &str) -> Option<&JobContext> {
        self.job_contexts.get(resource)
    }

    pub fn workflow_context(&self, resource: &str) -> Option<&WorkflowContext> {
        self.workflow_contexts.get(resource)
    }

    /// Union index over job and workflow contexts, keyed by resource name.
    pub fn contexts(&self) -> HashMap<ResourceName, TaskContextRecord> {
        let mut out = HashMap::with_capacity(self.job_contexts.len() + self.workflow_contexts.len());
        for (name, context) in &self.job_contexts {
            out.insert(name.clone(), TaskContextRecord::Job(context.clone()));
        }
        for (name, context) in &self.workflow_contexts {
            out.insert(name.clone(), TaskContextRecord::Workflow(context.clone()));
        }
        out
    }

    /// Persist a job context, then update the cached copy.
    ///
    /// On a failed write the cache keeps whatever context it had before.
    pub fn update_job_context<S: MetaStore + ?Sized>(
        &mut self,
        store: &S,
        resource: &str,
        context: JobContext,
    ) -> CacheResult<()> {
        let key = PropertyKey::task_context(resource);
        match set_typed(store, &key, &context) {
            Ok(true) => {
                self.job_contexts.insert(resource.to_string(), context);
                debug!(resource, "updated job context");
                Ok(())
            }
            Ok(false) => {
                error!(resource, "store rejected job context write");
                Err(CacheError::WriteBack { key: key.path() })
            }
            Err(e) => {
                error!(resource, error = %e, "failed to persist job context");
                Err(e.into())
            }
        }
    }

    /// Persist a workflow context, then update the cached copy.
    pub fn update_workflow_context<S: MetaStore + ?Sized>(
        &mut self,
        store: &S,
        resource: &str,
        context: WorkflowContext,
    ) -> CacheResult<()> {
        let key = PropertyKey::task_context(resource);
        match set_typed(store, &key, &context) {
            Ok(true) => {
                self.workflow_contexts.insert(resource.to_string(), context);
                debug!(resource, "updated workflow context");
                Ok(())
            }
            Ok(false) => {
                error!(resource, "store rejected workflow context write");
                Err(CacheError::WriteBack { key: key.path() })
            }
            Err(e) => {
                error!(resource, error = %e, "failed to persist workflow context");
                Err(e.into())
            }
        }
    }
}
