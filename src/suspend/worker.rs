//! Worker execution off the I/O path.
//!
//! A handler suspends, hands its [`DeferredResponse`] to [`dispatch`] (async
//! work) or [`dispatch_blocking`] (blocking work on the blocking pool) and
//! returns. A supervisor task resolves the handle with whatever the worker
//! produces:
//!
//! ```text
//! Ok(entity)         → resume(entity)
//! Err(error)         → resume_error(error)
//! worker panicked    → resume_error(WorkerError::Panicked)
//! worker aborted     → resume_error(WorkerError::Interrupted)
//! ```
//!
//! Losing the race against a timeout or cancel is logged and ignored.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinError, JoinHandle};

use crate::suspend::error::WorkerError;
use crate::suspend::handle::DeferredResponse;
use crate::suspend::outcome::Entity;

/// Cooperative interruption signal handed to every worker.
#[derive(Debug, Clone)]
pub struct Interrupt {
    rx: watch::Receiver<bool>,
}

impl Interrupt {
    pub fn is_interrupted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once [`WorkerHandle::interrupt`] is called. Never completes
    /// if the worker handle was dropped without interrupting.
    pub async fn interrupted(&mut self) {
        if self.rx.wait_for(|interrupted| *interrupted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Handle to a dispatched worker.
///
/// Dropping it detaches the worker; it keeps running and still resolves
/// its response.
#[derive(Debug)]
pub struct WorkerHandle {
    supervisor: JoinHandle<()>,
    worker: AbortHandle,
    interrupt: watch::Sender<bool>,
}

impl WorkerHandle {
    /// Ask the worker to stop. Workers observe this through [`Interrupt`].
    pub fn interrupt(&self) {
        self.interrupt.send_replace(true);
    }

    /// Abort the worker task. The response resolves with [`WorkerError::Interrupted`]
    /// unless something else already resolved it. Has no effect on blocking
    /// workers that already started.
    pub fn abort(&self) {
        self.worker.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    /// Wait until the supervisor has settled the response.
    pub async fn join(self) {
        if let Err(e) = self.supervisor.await {
            tracing::error!(error = %e, "Worker supervisor failed");
        }
    }
}

fn interrupt_pair() -> (watch::Sender<bool>, Interrupt) {
    let (tx, rx) = watch::channel(false);
    (tx, Interrupt { rx })
}

/// Run an async computation on its own task and resolve `response` with its result.
pub fn dispatch<F, Fut>(response: DeferredResponse, work: F) -> WorkerHandle
where
    F: FnOnce(Interrupt) -> Fut,
    Fut: Future<Output = Result<Entity, WorkerError>> + Send + 'static,
{
    let (interrupt, signal) = interrupt_pair();
    let task = tokio::spawn(work(signal));
    supervise(response, task, interrupt)
}

/// Run blocking code on the blocking pool and resolve `response` with its result.
pub fn dispatch_blocking<F>(response: DeferredResponse, work: F) -> WorkerHandle
where
    F: FnOnce(Interrupt) -> Result<Entity, WorkerError> + Send + 'static,
{
    let (interrupt, signal) = interrupt_pair();
    let task = tokio::task::spawn_blocking(move || work(signal));
    supervise(response, task, interrupt)
}

fn supervise(
    response: DeferredResponse,
    task: JoinHandle<Result<Entity, WorkerError>>,
    interrupt: watch::Sender<bool>,
) -> WorkerHandle {
    let worker = task.abort_handle();
    let supervisor = tokio::spawn(async move {
        let result = task.await.unwrap_or_else(|e| Err(join_error(e)));
        settle(&response, result);
    });
    WorkerHandle {
        supervisor,
        worker,
        interrupt,
    }
}

fn join_error(e: JoinError) -> WorkerError {
    if e.is_cancelled() {
        WorkerError::Interrupted
    } else {
        match e.try_into_panic() {
            Ok(payload) => WorkerError::from_panic(payload),
            Err(e) => WorkerError::failed(e.to_string()),
        }
    }
}

fn settle(response: &DeferredResponse, result: Result<Entity, WorkerError>) {
    let attempt = match result {
        Ok(entity) => response.resume(entity),
        Err(error) => {
            tracing::warn!(request_id = %response.id(), error = %error, "Worker failed");
            response.resume_error(error)
        }
    };
    if let Err(e) = attempt {
        tracing::debug!(request_id = %response.id(), error = %e, "Discarding late worker result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuspendConfig;
    use crate::suspend::context::ResolutionState;
    use crate::suspend::coordinator::Coordinator;
    use crate::suspend::outcome::Outcome;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::sleep;

    fn coordinator() -> Coordinator {
        Coordinator::start(&SuspendConfig {
            default_timeout_ms: 5_000,
        })
    }

    #[tokio::test]
    async fn successful_worker_resumes() {
        let coordinator = coordinator();
        let (tx, rx) = oneshot::channel();
        let response = coordinator.suspend(tx);

        dispatch(response, |_| async {
            sleep(Duration::from_millis(10)).await;
            Ok(Entity::ok("DONE-1"))
        });

        assert_eq!(rx.await.unwrap(), Outcome::Success(Entity::ok("DONE-1")));
    }

    #[tokio::test]
    async fn failing_worker_fails_request() {
        let coordinator = coordinator();
        let (tx, rx) = oneshot::channel();
        let response = coordinator.suspend(tx);

        dispatch(response, |_| async { Err(WorkerError::failed("database down")) });

        assert_eq!(
            rx.await.unwrap(),
            Outcome::Failure(WorkerError::Failed("database down".into()))
        );
    }

    #[tokio::test]
    async fn panicking_worker_fails_request() {
        let coordinator = coordinator();
        let (tx, rx) = oneshot::channel();
        let response = coordinator.suspend(tx);

        dispatch_blocking(response, |_| panic!("worker exploded"));

        assert_eq!(
            rx.await.unwrap(),
            Outcome::Failure(WorkerError::Panicked("worker exploded".into()))
        );
    }

    #[tokio::test]
    async fn aborted_worker_is_interrupted() {
        let coordinator = coordinator();
        let (tx, rx) = oneshot::channel();
        let response = coordinator.suspend(tx);

        let handle = dispatch(response, |_| async {
            sleep(Duration::from_secs(10)).await;
            Ok(Entity::ok("never"))
        });
        handle.abort();

        assert_eq!(rx.await.unwrap(), Outcome::Failure(WorkerError::Interrupted));
    }

    #[tokio::test]
    async fn cooperative_interrupt_still_resolves() {
        let coordinator = coordinator();
        let (tx, rx) = oneshot::channel();
        let response = coordinator.suspend(tx);

        let handle = dispatch(response, |mut interrupt| async move {
            tokio::select! {
                _ = sleep(Duration::from_secs(10)) => Ok(Entity::ok("DONE-7")),
                _ = interrupt.interrupted() => Ok(Entity::ok("INTERRUPTED-7")),
            }
        });
        handle.interrupt();

        assert_eq!(rx.await.unwrap(), Outcome::Success(Entity::ok("INTERRUPTED-7")));
    }

    #[tokio::test]
    async fn blocking_worker_sees_interrupt_flag() {
        let coordinator = coordinator();
        let (tx, rx) = oneshot::channel();
        let response = coordinator.suspend(tx);

        let handle = dispatch_blocking(response, |interrupt| {
            while !interrupt.is_interrupted() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(Entity::ok("INTERRUPTED"))
        });
        sleep(Duration::from_millis(20)).await;
        handle.interrupt();

        assert_eq!(rx.await.unwrap(), Outcome::Success(Entity::ok("INTERRUPTED")));
    }

    #[tokio::test]
    async fn late_worker_is_discarded_after_timeout() {
        let coordinator = coordinator();
        let (tx, rx) = oneshot::channel();
        let response = coordinator.suspend(tx);
        response.set_timeout(Duration::from_millis(20)).unwrap();

        let handle = dispatch(response.clone(), |_| async {
            sleep(Duration::from_millis(80)).await;
            Ok(Entity::ok("DONE"))
        });

        assert_eq!(rx.await.unwrap(), Outcome::default_timeout());
        handle.join().await;
        assert_eq!(response.state(), ResolutionState::TimedOut);
        assert_eq!(coordinator.stats().discarded, 1);
    }
}
