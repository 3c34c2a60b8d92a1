//! Cancellation scope for one sync run.
//!
//! Every subtask of a sync shares one child token. The first task to fail
//! cancels the token; siblings observe it at their next suspension point
//! and unwind. `wait` joins everything and returns the first failure.
use crate::SyncError;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct TaskScope {
    cancel: CancellationToken,
    tasks: JoinSet<Result<(), SyncError>>,
}

impl TaskScope {
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    /// The scope's token; hand a clone to every producer started under it.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Adopt a producer's error stream: the first error delivered on it
    /// fails the scope, a clean close contributes nothing. This keeps the
    /// (data stream, error stream) producer contract uniform without
    /// out-of-band signalling.
    pub fn forward_errors<E>(&mut self, mut errors: mpsc::Receiver<E>)
    where
        E: Into<SyncError> + Send + 'static,
    {
        self.tasks.spawn(async move {
            match errors.recv().await {
                Some(err) => Err(err.into()),
                None => Ok(()),
            }
        });
    }

    /// Join every task. The first failure cancels the token and is the
    /// scope's result; cancellation errors from unwinding siblings never
    /// mask it.
    pub async fn wait(mut self) -> Result<(), SyncError> {
        let mut first: Option<SyncError> = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_err) => {
                    if join_err.is_panic() {
                        std::panic::resume_unwind(join_err.into_panic());
                    }
                    Err(SyncError::Cancelled)
                }
            };
            if let Err(err) = result {
                self.cancel.cancel();
                match &first {
                    None => first = Some(err),
                    Some(SyncError::Cancelled) if !matches!(err, SyncError::Cancelled) => {
                        first = Some(err);
                    }
                    Some(_) => {}
                }
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
