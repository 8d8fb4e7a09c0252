//! The orchestrator. Owns the metrics registry, builds one task per
//! configured stream, and drives the three-phase lifecycle: init connects
//! everything fail-fast, run fans the tasks out and waits for cancellation,
//! close joins them and reports how each one ended.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::SinkerMetrics;
use crate::pusher::Pusher;
use crate::task::{Task, TaskState};

pub struct Sinker {
    config: Config,
    metrics: Arc<SinkerMetrics>,
    cancel: CancellationToken,
    initialized: bool,
    tasks: Vec<Task>,
    pusher: Option<Pusher>,
    handles: Vec<(String, JoinHandle<TaskState>)>,
}

impl Sinker {
    pub fn new(config: Config, cancel: CancellationToken) -> Self {
        Sinker {
            config,
            metrics: Arc::new(SinkerMetrics::new()),
            cancel,
            initialized: false,
            tasks: Vec::new(),
            pusher: None,
            handles: Vec::new(),
        }
    }

    /// The registry every component reports into; the caller hands this to
    /// the metrics endpoint.
    pub fn metrics(&self) -> Arc<SinkerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Connects every task to its stream and its store. Fails fast: the first
    /// task that cannot connect aborts the whole startup.
    pub async fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Err(Error::Init("Sinker is already initialized".into()));
        }

        if self.config.statistics.enable {
            // The pusher gets its own token so it can outlive the tasks at
            // shutdown and push their closing counter values.
            self.pusher = Some(Pusher::new(
                &self.config.statistics,
                Arc::clone(&self.metrics),
                CancellationToken::new(),
            )?);
        }

        for task_config in &self.config.tasks {
            let mut task = Task::new(
                task_config.clone(),
                self.config.clickhouse.clone(),
                Arc::clone(&self.metrics),
                self.cancel.child_token(),
            );
            task.init().await?;
            self.tasks.push(task);
        }

        self.initialized = true;
        info!(tasks = self.tasks.len(), "Sinker initialized");
        Ok(())
    }

    /// Spawns every task and parks until cancellation. The tasks themselves
    /// observe the same token and drain on their own; `close` joins them.
    pub async fn run(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(Error::Task("Sinker started without init".into()));
        }

        if let Some(pusher) = self.pusher.as_mut() {
            pusher.run();
        }

        for task in self.tasks.drain(..) {
            let name = task.name().to_string();
            self.handles.push((name, tokio::spawn(task.run())));
        }
        info!(tasks = self.handles.len(), "Sinker running");

        self.cancel.cancelled().await;
        info!("Sinker shutting down");
        Ok(())
    }

    /// Joins every task, then stops the pusher so the final push carries the
    /// closing counters. Returns an error when any task ended badly, so the
    /// process can exit nonzero.
    pub async fn close(mut self) -> Result<()> {
        self.cancel.cancel();

        let mut failed = Vec::new();
        for (name, handle) in self.handles.drain(..) {
            match handle.await {
                Ok(TaskState::Stopped) => info!(task = name, "Task stopped cleanly"),
                Ok(state) => {
                    error!(task = name, ?state, "Task ended abnormally");
                    failed.push(name);
                }
                Err(err) => {
                    error!(task = name, %err, "Task panicked");
                    failed.push(name);
                }
            }
        }

        if let Some(pusher) = self.pusher.take() {
            pusher.stop().await;
        }

        if failed.is_empty() {
            info!("Sinker closed");
            Ok(())
        } else {
            Err(Error::Task(format!(
                "Tasks ended abnormally: {}",
                failed.join(", ")
            )))
        }
    }

    #[cfg(test)]
    pub(crate) fn with_tasks(
        config: Config,
        tasks: Vec<Task>,
        metrics: Arc<SinkerMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let pusher = if config.statistics.enable {
            Pusher::new(
                &config.statistics,
                Arc::clone(&metrics),
                CancellationToken::new(),
            )
            .ok()
        } else {
            None
        };
        Sinker {
            config,
            metrics,
            cancel,
            initialized: true,
            tasks,
            pusher,
            handles: Vec::new(),
        }
    }
}
