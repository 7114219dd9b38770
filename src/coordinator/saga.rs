//! Saga executor for multi-step provisioning workflows
//!
//! Forward actions run in order. The first failure stops the saga and runs
//! the compensations of the steps that already completed, newest first.
//! Compensation errors never replace the forward error: they are collected
//! as [`RollbackWarning`]s on the returned [`SagaFailure`].
//!
//! Forward actions and compensations are plain futures. Futures do nothing
//! until polled, so a compensation built up front only runs on rollback.

use crate::common::Error;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;

pub type Compensation<'a> = BoxFuture<'a, crate::Result<()>>;

/// A forward action with an optional undo
pub struct Step<'a, T = ()> {
    label: String,
    forward: BoxFuture<'a, crate::Result<T>>,
    compensation: Option<Compensation<'a>>,
}

impl<'a, T> Step<'a, T> {
    pub fn new<F>(label: impl Into<String>, forward: F) -> Self
    where
        F: Future<Output = crate::Result<T>> + Send + 'a,
    {
        Self {
            label: label.into(),
            forward: forward.boxed(),
            compensation: None,
        }
    }

    pub fn compensate_with<C>(mut self, compensation: C) -> Self
    where
        C: Future<Output = crate::Result<()>> + Send + 'a,
    {
        self.compensation = Some(compensation.boxed());
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// A compensation that failed during rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackWarning {
    pub step: String,
    pub error: String,
}

/// Outcome of a failed saga: the forward error plus rollback warnings
#[derive(Debug)]
pub struct SagaFailure {
    pub saga: String,
    pub step: String,
    pub error: Error,
    pub warnings: Vec<RollbackWarning>,
}

impl std::fmt::Display for SagaFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "saga {} failed at step '{}': {}",
            self.saga, self.step, self.error
        )?;
        if !self.warnings.is_empty() {
            write!(f, " ({} rollback warnings)", self.warnings.len())?;
        }
        Ok(())
    }
}

impl From<SagaFailure> for Error {
    fn from(failure: SagaFailure) -> Self {
        failure.error
    }
}

pub struct Saga<'a> {
    name: String,
    executed: Vec<(String, Option<Compensation<'a>>)>,
}

impl<'a> Saga<'a> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executed: Vec::new(),
        }
    }

    /// Run a whole list of steps
    pub async fn execute(
        name: impl Into<String>,
        steps: Vec<Step<'a, ()>>,
    ) -> std::result::Result<(), SagaFailure> {
        let mut saga = Saga::new(name);
        for step in steps {
            saga.step(step).await?;
        }
        saga.commit();
        Ok(())
    }

    /// Run one step; on failure roll back everything executed so far
    pub async fn step<T>(&mut self, step: Step<'a, T>) -> std::result::Result<T, SagaFailure> {
        let Step {
            label,
            forward,
            compensation,
        } = step;
        self.finish(label, forward.await, move |_| compensation).await
    }

    /// Run a forward action that needs no undo
    pub async fn run<T, F>(
        &mut self,
        label: impl Into<String>,
        forward: F,
    ) -> std::result::Result<T, SagaFailure>
    where
        F: Future<Output = crate::Result<T>>,
    {
        self.finish(label.into(), forward.await, |_| None).await
    }

    /// Run a forward action whose undo is known up front
    pub async fn run_undo<T, F, C>(
        &mut self,
        label: impl Into<String>,
        forward: F,
        compensation: C,
    ) -> std::result::Result<T, SagaFailure>
    where
        F: Future<Output = crate::Result<T>>,
        C: Future<Output = crate::Result<()>> + Send + 'a,
    {
        self.finish(label.into(), forward.await, move |_| Some(compensation.boxed()))
            .await
    }

    /// Run a forward action whose undo depends on its output
    pub async fn run_with<T, F, C>(
        &mut self,
        label: impl Into<String>,
        forward: F,
        compensate: C,
    ) -> std::result::Result<T, SagaFailure>
    where
        F: Future<Output = crate::Result<T>>,
        C: FnOnce(&T) -> Compensation<'a>,
    {
        self.finish(label.into(), forward.await, move |value| Some(compensate(value)))
            .await
    }

    /// Register the undo of an action that already completed outside the saga
    pub fn record<C>(&mut self, label: impl Into<String>, compensation: C)
    where
        C: Future<Output = crate::Result<()>> + Send + 'a,
    {
        self.executed.push((label.into(), Some(compensation.boxed())));
    }

    async fn finish<T, C>(
        &mut self,
        label: String,
        outcome: crate::Result<T>,
        compensation: C,
    ) -> std::result::Result<T, SagaFailure>
    where
        C: FnOnce(&T) -> Option<Compensation<'a>>,
    {
        match outcome {
            Ok(value) => {
                tracing::debug!("saga {}: '{}' done", self.name, label);
                let undo = compensation(&value);
                self.executed.push((label, undo));
                Ok(value)
            }
            Err(error) => Err(self.abort(label, error).await),
        }
    }

    /// Fail the saga on an error raised outside a step
    pub async fn abort(&mut self, step: impl Into<String>, error: Error) -> SagaFailure {
        let step = step.into();
        tracing::warn!(
            "saga {} failed at '{}': {}; rolling back {} step(s)",
            self.name,
            step,
            error,
            self.executed.len()
        );
        let warnings = self.rollback().await;
        SagaFailure {
            saga: self.name.clone(),
            step,
            error,
            warnings,
        }
    }

    async fn rollback(&mut self) -> Vec<RollbackWarning> {
        let mut warnings = Vec::new();
        while let Some((label, compensation)) = self.executed.pop() {
            let Some(compensation) = compensation else {
                continue;
            };
            if let Err(e) = compensation.await {
                tracing::warn!(
                    "saga {}: compensation for '{}' failed: {}",
                    self.name,
                    label,
                    e
                );
                warnings.push(RollbackWarning {
                    step: label,
                    error: e.to_string(),
                });
            }
        }
        warnings
    }

    /// Labels of the steps completed so far, in execution order
    pub fn executed_steps(&self) -> Vec<&str> {
        self.executed.iter().map(|(label, _)| label.as_str()).collect()
    }

    /// Finish successfully and drop the pending compensations
    pub fn commit(self) {
        tracing::debug!(
            "saga {} committed after {} step(s)",
            self.name,
            self.executed.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<String>>>;

    fn step(log: &Log, name: &'static str, fail: bool) -> Step<'static, ()> {
        let forward_log = log.clone();
        let undo_log = log.clone();
        Step::new(name, async move {
            forward_log.lock().push(format!("do {}", name));
            if fail {
                Err(Error::BackendUnavailable(format!("{} failed", name)))
            } else {
                Ok(())
            }
        })
        .compensate_with(async move {
            undo_log.lock().push(format!("undo {}", name));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let log: Log = Arc::default();
        let steps = vec![step(&log, "a", false), step(&log, "b", false)];
        Saga::execute("ok", steps).await.unwrap();
        assert_eq!(*log.lock(), vec!["do a", "do b"]);
    }

    #[tokio::test]
    async fn test_failure_compensates_in_reverse() {
        let log: Log = Arc::default();
        let steps = vec![
            step(&log, "a", false),
            step(&log, "b", false),
            step(&log, "c", true),
            step(&log, "d", false),
        ];
        let failure = Saga::execute("create", steps).await.unwrap_err();

        assert_eq!(failure.step, "c");
        assert!(matches!(failure.error, Error::BackendUnavailable(_)));
        assert!(failure.warnings.is_empty());
        assert_eq!(*log.lock(), vec!["do a", "do b", "do c", "undo b", "undo a"]);
    }

    #[tokio::test]
    async fn test_steps_without_compensation_are_skipped() {
        let log: Log = Arc::default();
        let plain_log = log.clone();
        let steps = vec![
            step(&log, "a", false),
            Step::new("plain", async move {
                plain_log.lock().push("do plain".into());
                Ok(())
            }),
            step(&log, "c", true),
        ];
        Saga::execute("mixed", steps).await.unwrap_err();
        assert_eq!(*log.lock(), vec!["do a", "do plain", "do c", "undo a"]);
    }

    #[tokio::test]
    async fn test_compensation_failure_becomes_warning() {
        let log: Log = Arc::default();
        let steps = vec![
            step(&log, "a", false),
            Step::new("b", async { Ok(()) })
                .compensate_with(async { Err(Error::NotFound("b".into())) }),
            step(&log, "c", true),
        ];
        let failure = Saga::execute("warn", steps).await.unwrap_err();

        // The original error survives; "a" is still compensated after "b" fails
        assert!(matches!(failure.error, Error::BackendUnavailable(_)));
        assert_eq!(failure.warnings.len(), 1);
        assert_eq!(failure.warnings[0].step, "b");
        assert_eq!(*log.lock(), vec!["do a", "do c", "undo a"]);
    }

    #[tokio::test]
    async fn test_run_with_uses_step_output() {
        let log: Log = Arc::default();
        let mut saga = Saga::new("ip");
        let undo_log = log.clone();
        let ip = saga
            .run_with("claim", async { Ok("10.0.0.5".to_string()) }, move |ip| {
                let ip = ip.clone();
                async move {
                    undo_log.lock().push(format!("release {}", ip));
                    Ok(())
                }
                .boxed()
            })
            .await
            .unwrap();
        assert_eq!(ip, "10.0.0.5");
        assert_eq!(saga.executed_steps(), vec!["claim"]);

        let failure = saga.abort("vfs", Error::BadRequest("bad netmask".into())).await;
        assert_eq!(failure.step, "vfs");
        assert_eq!(*log.lock(), vec!["release 10.0.0.5"]);
        assert!(failure.to_string().contains("bad netmask"));
    }
}
