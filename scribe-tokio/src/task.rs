//! A thin wrapper around [`tokio::task::JoinHandle`].

use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, Instrument};

/// A named [`JoinHandle`] wrapper that:
///
/// (1) propagates panics from the spawned task instead of catching them, and
/// (2) adds the `#[must_use]` lint so that every spawned task is either
///     joined or explicitly [`detach`]ed.
///
/// The task name shows up in logs when the task is spawned and when it
/// finishes abnormally, which makes hung-shutdown debugging tractable.
///
/// [`detach`]: NamedTask::detach
#[must_use]
pub struct NamedTask<T> {
    task: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T> NamedTask<T> {
    /// Spawns a named task which inherits the current tracing span.
    #[inline]
    pub fn spawn<F>(
        name: impl Into<Cow<'static, str>>,
        future: F,
    ) -> NamedTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        let name = name.into();
        debug!("Spawning task: {name}");
        let span = tracing::Span::current();
        NamedTask {
            task: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    /// Drop the handle, detaching the task so it continues running in the
    /// background. Once detached, the task's output (and any panic) can no
    /// longer be observed; use sparingly.
    #[inline]
    pub fn detach(self) {
        std::mem::drop(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls [`is_finished`] on the underlying [`JoinHandle`].
    ///
    /// [`is_finished`]: tokio::task::JoinHandle::is_finished
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    #[inline]
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl<T> Future for NamedTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        let result = match result {
            Ok(val) => Ok(val),
            Err(join_err) => match join_err.try_into_panic() {
                // Propagate the panic to whoever is polling the handle.
                Ok(panic_reason) => {
                    error!("Task '{name}' panicked!", name = self.name());
                    std::panic::resume_unwind(panic_reason)
                }
                Err(join_err) => Err(join_err),
            },
        };

        Poll::Ready(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn join_returns_task_output() {
        let task = NamedTask::<u32>::spawn("adder", async { 40 + 2 });
        assert_eq!(task.await.unwrap(), 42);
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn panics_propagate_to_joiner() {
        let task = NamedTask::<()>::spawn("bomb", async { panic!("boom") });
        let _ = task.await;
    }

    #[tokio::test]
    async fn aborted_task_yields_join_error() {
        let task = NamedTask::<()>::spawn("sleeper", async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        task.abort();
        let result = task.await;
        assert!(result.is_err());
    }
}
