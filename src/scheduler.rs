use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::trace;

use crate::traits::IdleScheduler;

/// Spawns deferred work on the tokio runtime after yielding once, letting whatever is already queued run first.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioIdleScheduler;

#[async_trait]
impl IdleScheduler for TokioIdleScheduler {
    async fn run_when_idle(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            trace!("running deferred task");
            task.await;
        });
    }
}

/// Runs deferred work inline. `run_when_idle` returns only after the task is done.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateScheduler;

#[async_trait]
impl IdleScheduler for ImmediateScheduler {
    async fn run_when_idle(&self, task: BoxFuture<'static, ()>) {
        task.await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn immediate_runs_before_returning() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        ImmediateScheduler
            .run_when_idle(async move { flag.store(true, Ordering::SeqCst) }.boxed())
            .await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tokio_scheduler_runs_eventually() {
        let (tx, rx) = oneshot::channel();
        TokioIdleScheduler
            .run_when_idle(
                async move {
                    let _ = tx.send(42);
                }
                .boxed(),
            )
            .await;
        assert_eq!(rx.await.ok(), Some(42));
    }
}
