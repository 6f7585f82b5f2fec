use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::scheduler::{FailurePolicy, Scheduler, ThreadPool};
use crate::sink::Sink;
use crate::stage::{Stage, StageBuilder};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Owns the stages of one application, their pools and the configuration
/// they were resolved from
///
/// Stage names are unique per runtime. Dropping the runtime shuts every
/// stage down.
pub struct Runtime<E: Send + 'static> {
    config: RuntimeConfig,
    stages: RwLock<HashMap<String, Arc<Stage<E>>>>,
    scheduler: Scheduler<E>,
}

impl<E: Send + 'static> Runtime<E> {
    pub fn new(config: RuntimeConfig) -> Self {
        let policy = FailurePolicy::from_crash_flag(config.crash_on_exception());
        Self {
            config,
            stages: RwLock::new(HashMap::new()),
            scheduler: Scheduler::new(policy),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler<E> {
        &self.scheduler
    }

    /// Build a stage, initialize its handler and start serving it
    pub fn create_stage(&self, builder: StageBuilder<E>) -> Result<Arc<Stage<E>>> {
        let name = builder.name().to_string();
        let mut stages = self.stages.write();
        if stages.contains_key(&name) {
            return Err(RuntimeError::DuplicateStage(name));
        }

        let stage = Arc::new(builder.build(&self.config.resolve(&name)));
        stage.handler().init(&stage.context())?;
        if let Err(err) = self.scheduler.register(Arc::clone(&stage)) {
            stage.sink().close();
            if let Err(destroy_err) = stage.handler().destroy() {
                warn!(stage = %name, error = %destroy_err, "Handler teardown failed");
            }
            return Err(err);
        }
        stages.insert(name.clone(), Arc::clone(&stage));

        info!(
            stage = %name,
            threads = stage.pool_config().initial_threads,
            controlled = stage.controller().is_some(),
            single_threaded = stage.is_single_threaded(),
            "Stage created"
        );
        Ok(stage)
    }

    pub fn stage(&self, name: &str) -> Option<Arc<Stage<E>>> {
        self.stages.read().get(name).cloned()
    }

    /// Shortcut for `stage(name)?.sink()`
    pub fn sink(&self, name: &str) -> Result<Sink<E>> {
        self.stage(name)
            .map(|stage| stage.sink().clone())
            .ok_or_else(|| RuntimeError::UnknownStage(name.to_string()))
    }

    pub fn pool(&self, name: &str) -> Option<ThreadPool<E>> {
        self.scheduler.pool(name)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.read().keys().cloned().collect()
    }

    /// Close the stage's queue, stop its pool and tear its handler down
    pub fn destroy_stage(&self, name: &str) -> Result<()> {
        let stage = self
            .stages
            .write()
            .remove(name)
            .ok_or_else(|| RuntimeError::UnknownStage(name.to_string()))?;
        self.teardown(&stage);
        Ok(())
    }

    fn teardown(&self, stage: &Stage<E>) {
        stage.sink().close();
        self.scheduler.deregister(stage.name());
        if let Err(err) = stage.handler().destroy() {
            error!(stage = %stage.name(), error = %err, "Handler teardown failed");
        }
        info!(
            stage = %stage.name(),
            processed = stage.stats().total_processed(),
            "Stage destroyed"
        );
    }

    /// Destroy every stage
    pub fn shutdown(&self) {
        let stages: Vec<_> = self.stages.write().drain().map(|(_, stage)| stage).collect();
        if stages.is_empty() {
            return;
        }
        for stage in &stages {
            stage.sink().close();
        }
        for stage in &stages {
            self.teardown(stage);
        }
        info!(stages = stages.len(), "Runtime shut down");
    }
}

impl<E: Send + 'static> Default for Runtime<E> {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl<E: Send + 'static> Drop for Runtime<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<E: Send + 'static> std::fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("stages", &self.stage_names())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
