//! Process supervisor for the ingest service.
//!
//! Long-running processes share one [`CancellationToken`]. The token fires on
//! SIGTERM/SIGINT or when any process fails. Processes that are still running
//! afterwards get a grace period to drain (outbox workers flush here), then
//! closers release shared resources.
//!
//! ```no_run
//! use railmeter_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Runner::new()
//!         .with_named_process("heartbeat", |ctx| async move {
//!             loop {
//!                 tokio::select! {
//!                     _ = ctx.cancelled() => break,
//!                     _ = tokio::time::sleep(Duration::from_secs(1)) => {
//!                         tracing::info!("still here");
//!                     }
//!                 }
//!             }
//!             Ok(())
//!         })
//!         .with_closer(|| async move { Ok(()) })
//!         .run()
//!         .await;
//! }
//! ```

use anyhow::anyhow;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

type BoxedFuture = Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>>;

pub type AppProcess = Box<dyn FnOnce(CancellationToken) -> BoxedFuture + Send>;

pub type Closer = Box<dyn FnOnce() -> BoxedFuture + Send>;

struct NamedProcess {
    name: String,
    process: AppProcess,
}

pub struct Runner {
    processes: Vec<NamedProcess>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    shutdown_grace: Duration,
    cancellation_token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Closers get 10 seconds, draining processes get 15.
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(15),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_app_process<F, Fut>(self, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        let name = format!("process-{}", self.processes.len());
        self.with_named_process(name, process)
    }

    /// Adds a process whose name is attached to its span and to any error it returns.
    pub fn with_named_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.processes.push(NamedProcess {
            name: name.into(),
            process: Box::new(|token| Box::pin(process(token))),
        });
        self
    }

    /// Closers run once every process has stopped, whatever the outcome.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// How long processes may keep running after cancellation before they are aborted
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Run to completion and exit the process: status 1 if any process failed.
    pub async fn run(self) {
        match self.run_until_stopped().await {
            Ok(()) => {
                tracing::info!("application exiting normally");
                std::process::exit(0);
            }
            Err(err) => {
                tracing::error!(error = %format!("{:#}", err), "application exiting with error");
                std::process::exit(1);
            }
        }
    }

    /// Run every process until cancellation or the first failure, drain, then close.
    ///
    /// Returns the first process error, if any.
    pub async fn run_until_stopped(self) -> Result<(), anyhow::Error> {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for NamedProcess { name, process } in self.processes {
            let process_token = token.clone();
            let span = tracing::info_span!("app_process", process = %name);
            join_set.spawn(
                async move {
                    let result = process(process_token).await;
                    (name, result)
                }
                .instrument(span),
            );
        }

        spawn_signal_listeners(token.clone());

        let mut first_error = None;
        while !token.is_cancelled() {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = join_set.join_next() => next,
            };
            let Some(joined) = next else { break };

            match joined {
                Ok((name, Ok(()))) => {
                    tracing::debug!(process = %name, "app process completed");
                }
                Ok((name, Err(err))) => {
                    tracing::error!(process = %name, error = %format!("{:#}", err), "app process failed");
                    first_error = Some(err.context(format!("process {} failed", name)));
                    token.cancel();
                }
                Err(err) => {
                    tracing::error!(error = %err, "app process panicked");
                    first_error = Some(anyhow!("app process panicked: {}", err));
                    token.cancel();
                }
            }
        }

        Self::drain_processes(&mut join_set, self.shutdown_grace).await;

        if !self.closers.is_empty() {
            tracing::info!(timeout = ?self.closer_timeout, "running closers");
            match tokio::time::timeout(self.closer_timeout, Self::run_closers(self.closers)).await
            {
                Ok(()) => tracing::info!("all closers completed"),
                Err(_) => tracing::error!(timeout = ?self.closer_timeout, "closers timed out"),
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn drain_processes(
        join_set: &mut JoinSet<(String, Result<(), anyhow::Error>)>,
        grace: Duration,
    ) {
        if join_set.is_empty() {
            return;
        }
        tracing::info!(remaining = join_set.len(), grace = ?grace, "waiting for processes to drain");

        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((name, Ok(()))) => tracing::debug!(process = %name, "process drained"),
                    Ok((name, Err(err))) => {
                        tracing::warn!(process = %name, error = %format!("{:#}", err), "process failed while draining")
                    }
                    Err(err) => tracing::error!(error = %err, "process panicked while draining"),
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(remaining = join_set.len(), "shutdown grace elapsed, aborting processes");
            join_set.shutdown().await;
        }
    }

    async fn run_closers(closers: Vec<Closer>) {
        let mut closer_set = JoinSet::new();
        for closer in closers {
            closer_set.spawn(closer());
        }

        while let Some(result) = closer_set.join_next().await {
            match result {
                Ok(Ok(())) => tracing::debug!("closer completed"),
                Ok(Err(err)) => tracing::error!(error = %format!("{:#}", err), "closer failed"),
                Err(err) => tracing::error!(error = %err, "closer panicked"),
            }
        }
    }
}

fn spawn_signal_listeners(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = ctrl_c_token.cancelled() => {}
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    tracing::info!("received interrupt, shutting down");
                    ctrl_c_token.cancel();
                }
                Err(err) => tracing::error!(error = %err, "failed to listen for interrupt"),
            },
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                return;
            }
        };
        tokio::select! {
            _ = token.cancelled() => {}
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                token.cancel();
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cancellation_runs_closers_and_returns_ok() {
        let closed = Arc::new(AtomicBool::new(false));
        let closed_flag = closed.clone();
        let token = CancellationToken::new();
        let cancel = token.clone();

        let runner = Runner::new()
            .with_named_process("idle", |ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .with_closer(move || async move {
                closed_flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .with_cancellation_token(token);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        runner.run_until_stopped().await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failing_process_cancels_siblings_and_returns_error() {
        let sibling_stopped = Arc::new(AtomicBool::new(false));
        let sibling_flag = sibling_stopped.clone();

        let result = Runner::new()
            .with_named_process("sibling", |ctx| async move {
                ctx.cancelled().await;
                sibling_flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .with_named_process("broken", |_ctx| async move {
                Err(anyhow!("dedup table capacity exhausted"))
            })
            .run_until_stopped()
            .await;

        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("process broken failed"));
        assert!(sibling_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_processes_may_finish_work_after_cancellation() {
        let flushed = Arc::new(AtomicBool::new(false));
        let flushed_flag = flushed.clone();
        let token = CancellationToken::new();
        token.cancel();

        Runner::new()
            .with_named_process("outbox", |ctx| async move {
                ctx.cancelled().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                flushed_flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .with_cancellation_token(token)
            .with_shutdown_grace(Duration::from_secs(2))
            .run_until_stopped()
            .await
            .unwrap();

        assert!(flushed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stuck_process_is_aborted_after_grace() {
        let token = CancellationToken::new();
        token.cancel();

        let started = tokio::time::Instant::now();
        Runner::new()
            .with_named_process("stuck", |_ctx| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .with_cancellation_token(token)
            .with_shutdown_grace(Duration::from_millis(50))
            .run_until_stopped()
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_closers_run_concurrently() {
        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        let (a, b) = (first.clone(), second.clone());

        let closers: Vec<Closer> = vec![
            Box::new(move || {
                Box::pin(async move {
                    a.store(true, Ordering::SeqCst);
                    Ok(())
                })
            }),
            Box::new(move || {
                Box::pin(async move {
                    b.store(true, Ordering::SeqCst);
                    Err(anyhow!("closing failed"))
                })
            }),
        ];
        Runner::run_closers(closers).await;

        assert!(first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
    }
}
