// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Leased job worker.
//!
//! Each pass claims at most one task per registered queue, runs it and acks.
//! A failed run goes back to pending with exponential backoff until
//! `max_attempts` claims were spent, then it is dead-lettered. Input and state
//! errors are not retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::JobHandler;
use super::backoff;
use crate::config::JobSettings;
use crate::context::RequestContext;
use crate::error::{Error, ErrorClass, Result};
use crate::metrics;
use crate::store::{Store, TaskEntry};
use crate::time::chrono_duration;

/// What happened to a claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Retried,
    Dead,
}

impl TaskOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Retried => "retried",
            Self::Dead => "dead",
        }
    }
}

/// Polls every registered queue until shut down.
pub struct JobWorker {
    store: Arc<dyn Store>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    settings: JobSettings,
    claim_timeout: Duration,
    shutdown: Arc<Notify>,
}

impl JobWorker {
    pub fn new(store: Arc<dyn Store>, settings: JobSettings, claim_timeout: Duration) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            settings,
            claim_timeout,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Register a handler for its queue, replacing any previous one.
    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.queue(), handler);
        self
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until the shutdown signal is received.
    pub async fn run(&self) {
        let mut queues: Vec<&str> = self.handlers.keys().copied().collect();
        queues.sort_unstable();
        info!(
            queues = ?queues,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Job worker started"
        );

        loop {
            let processed = match self.run_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "Job worker pass failed");
                    0
                }
            };

            // Drain busy queues without sleeping.
            if processed > 0 {
                tokio::select! {
                    biased;
                    _ = self.shutdown.notified() => break,
                    _ = tokio::task::yield_now() => continue,
                }
            }

            tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        info!("Job worker stopped");
    }

    /// Claim and run at most one task per queue. Returns the number processed.
    pub async fn run_once(&self) -> Result<usize> {
        let mut processed = 0;
        for (queue, handler) in &self.handlers {
            let Some(task) = self.claim(queue).await? else {
                continue;
            };
            self.process(handler.as_ref(), task).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn claim(&self, queue: &str) -> Result<Option<TaskEntry>> {
        let now = crate::time::now();
        let lease_until = now + chrono_duration(self.settings.visibility_timeout);
        match tokio::time::timeout(self.claim_timeout, self.store.claim_task(queue, now, lease_until))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(queue = %queue, "Task claim timed out");
                Ok(None)
            }
        }
    }

    /// Run a claimed task and record its outcome.
    pub async fn process(&self, handler: &dyn JobHandler, task: TaskEntry) -> Result<TaskOutcome> {
        let queue = task.queue_name.clone();

        // A lease that expired on the final attempt is not run again.
        if task.attempts > task.max_attempts {
            let message = task
                .last_error
                .clone()
                .unwrap_or_else(|| "lease expired after final attempt".to_string());
            self.bury(handler, &task, &message).await?;
            metrics::record_job(&queue, TaskOutcome::Dead.label());
            return Ok(TaskOutcome::Dead);
        }

        let ctx = RequestContext::system();
        debug!(task_id = %task.task_id, queue = %queue, attempt = task.attempts, "Running task");
        let outcome = match handler.run(&ctx, &task).await {
            Ok(()) => {
                self.store.complete_task(task.task_id, crate::time::now()).await?;
                debug!(task_id = %task.task_id, queue = %queue, "Task succeeded");
                TaskOutcome::Succeeded
            }
            Err(e) => {
                let message = e.to_string();
                if !retryable(&e) || task.attempts >= task.max_attempts {
                    self.bury(handler, &task, &message).await?;
                    TaskOutcome::Dead
                } else {
                    let attempts = u32::try_from(task.attempts).unwrap_or(u32::MAX);
                    let delay = backoff::delay(&self.settings.backoff, attempts);
                    let now = crate::time::now();
                    self.store
                        .release_task(task.task_id, &message, now + chrono_duration(delay), now)
                        .await?;
                    warn!(
                        task_id = %task.task_id,
                        queue = %queue,
                        attempt = task.attempts,
                        max_attempts = task.max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Task failed, will retry"
                    );
                    TaskOutcome::Retried
                }
            }
        };
        metrics::record_job(&queue, outcome.label());
        Ok(outcome)
    }

    async fn bury(&self, handler: &dyn JobHandler, task: &TaskEntry, message: &str) -> Result<()> {
        self.store
            .bury_task(task.task_id, message, crate::time::now())
            .await?;
        error!(
            task_id = %task.task_id,
            queue = %task.queue_name,
            attempts = task.attempts,
            error = %message,
            "Task moved to dead-letter queue"
        );
        if let Err(e) = handler.on_dead(task, message).await {
            warn!(task_id = %task.task_id, error = %e, "Dead-letter hook failed");
        }
        Ok(())
    }
}

fn retryable(error: &Error) -> bool {
    !matches!(error.class(), ErrorClass::Input | ErrorClass::State)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffSettings;
    use crate::jobs::queue::new_task;
    use crate::store::{SqliteStore, TaskState};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        terminal: bool,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        fn queue(&self) -> &'static str {
            "flaky"
        }

        async fn run(&self, _ctx: &RequestContext, _task: &TaskEntry) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.terminal {
                return Err(Error::InvalidRequest("bad payload".into()));
            }
            if call < self.failures {
                return Err(Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "io timeout")));
            }
            Ok(())
        }
    }

    fn settings() -> JobSettings {
        JobSettings {
            backoff: BackoffSettings {
                base: Duration::ZERO,
                max: Duration::ZERO,
                jitter: 0.0,
            },
            ..JobSettings::default()
        }
    }

    async fn worker(handler: Arc<Flaky>) -> (Arc<SqliteStore>, JobWorker) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let worker = JobWorker::new(store.clone(), settings(), Duration::from_secs(1)).register(handler);
        (store, worker)
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let handler = Arc::new(Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
            terminal: false,
        });
        let (store, worker) = worker(handler.clone()).await;
        let id = Uuid::new_v4();
        store
            .enqueue_task(&new_task("flaky", id, json!({}), 3, crate::time::now()))
            .await
            .unwrap();

        assert_eq!(worker.run_once().await.unwrap(), 1);
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.last_error.unwrap().contains("io timeout"));

        assert_eq!(worker.run_once().await.unwrap(), 1);
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.attempts, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let handler = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            terminal: false,
        });
        let (store, worker) = worker(handler.clone()).await;
        let id = Uuid::new_v4();
        store
            .enqueue_task(&new_task("flaky", id, json!({}), 2, crate::time::now()))
            .await
            .unwrap();

        worker.run_once().await.unwrap();
        worker.run_once().await.unwrap();
        assert_eq!(worker.run_once().await.unwrap(), 0);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Dead);
        assert_eq!(task.attempts, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_input_errors_are_not_retried() {
        let handler = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
            terminal: true,
        });
        let (store, worker) = worker(handler).await;
        let id = Uuid::new_v4();
        store
            .enqueue_task(&new_task("flaky", id, json!({}), 5, crate::time::now()))
            .await
            .unwrap();

        worker.run_once().await.unwrap();
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Dead);
        assert_eq!(task.attempts, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let handler = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
            terminal: false,
        });
        let (_store, worker) = worker(handler).await;
        let shutdown = worker.shutdown_handle();
        let handle = tokio::spawn(async move { worker.run().await });
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
