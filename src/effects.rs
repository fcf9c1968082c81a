//! Persistence side effects run as spawned tasks.
//!
//! A spawned task keeps running if the socket that started it goes away, so
//! writes begun before a disconnect still land. Every failure (error or
//! panic) is reported to a sink task that logs it.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures_util::FutureExt;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::error;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct EffectFailure {
    pub label: &'static str,
    pub session_id: Option<Uuid>,
    pub reason: String,
}

#[derive(Clone)]
pub struct EffectRunner {
    failures: mpsc::UnboundedSender<EffectFailure>,
    failure_count: Arc<AtomicU64>,
}

impl EffectRunner {
    /// Starts the failure sink. Must be called inside a tokio runtime.
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<EffectFailure>();
        tokio::spawn(async move {
            while let Some(failure) = rx.recv().await {
                error!(
                    effect = failure.label,
                    session_id = ?failure.session_id,
                    reason = %failure.reason,
                    "side effect failed"
                );
            }
        });
        Self {
            failures: tx,
            failure_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total failures reported since start.
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::SeqCst)
    }

    fn report(&self, label: &'static str, session_id: Option<Uuid>, reason: String) {
        self.failure_count.fetch_add(1, Ordering::SeqCst);
        let _ = self.failures.send(EffectFailure {
            label,
            session_id,
            reason,
        });
    }

    pub fn spawn<T, F>(
        &self,
        label: &'static str,
        session_id: Option<Uuid>,
        effect: F,
    ) -> JoinHandle<Option<T>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let runner = self.clone();
        tokio::spawn(async move {
            match AssertUnwindSafe(effect).catch_unwind().await {
                Ok(Ok(value)) => Some(value),
                Ok(Err(err)) => {
                    runner.report(label, session_id, err.to_string());
                    None
                }
                Err(_) => {
                    runner.report(label, session_id, "effect panicked".to_string());
                    None
                }
            }
        })
    }

    /// Spawns `effect` and waits for it. `None` means it failed and the
    /// failure was already reported.
    pub async fn run<T, F>(
        &self,
        label: &'static str,
        session_id: Option<Uuid>,
        effect: F,
    ) -> Option<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        match self.spawn(label, session_id, effect).await {
            Ok(value) => value,
            Err(err) => {
                self.report(label, session_id, format!("effect task aborted: {err}"));
                None
            }
        }
    }
}
