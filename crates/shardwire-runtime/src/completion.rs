//! Completion handles for work posted to a shard.

use std::fmt;
use std::time::Duration;

use crate::error::{Result, ShardError};

/// The eventual result of a [`post_async`](crate::ReactorThread::post_async)
/// (or of a shard start).
///
/// Resolves with the work's return value, with `WorkPanicked` if the work
/// panicked, or with `Abandoned` if the shard stopped before running it.
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

pub(crate) type Resolver<T> = oneshot::Sender<Result<T>>;

impl<T> Completion<T> {
    pub(crate) fn channel() -> (Resolver<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub(crate) fn ready(result: Result<T>) -> Self {
        let (tx, completion) = Self::channel();
        // The receiver is alive, so the send cannot fail.
        let _ = tx.send(result);
        completion
    }

    /// Block until the result is available.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(ShardError::Abandoned))
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(oneshot::RecvTimeoutError::Timeout) => Err(ShardError::Timeout),
            Err(oneshot::RecvTimeoutError::Disconnected) => Err(ShardError::Abandoned),
        }
    }

    /// The result if it is already available.
    pub fn try_wait(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::TryRecvError::Empty) => None,
            Err(oneshot::TryRecvError::Disconnected) => Some(Err(ShardError::Abandoned)),
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ready_and_dropped() {
        assert_eq!(Completion::ready(Ok(5)).wait(), Ok(5));

        let (tx, completion) = Completion::<u32>::channel();
        drop(tx);
        assert_eq!(completion.wait(), Err(ShardError::Abandoned));
    }

    #[test]
    fn test_wait_timeout() {
        let (tx, completion) = Completion::<u32>::channel();
        assert_eq!(completion.try_wait(), None);
        assert_eq!(completion.wait_timeout(Duration::from_millis(10)), Err(ShardError::Timeout));
        drop(tx);

        let (tx, completion) = Completion::<u32>::channel();
        let h = thread::spawn(move || {
            let _ = tx.send(Ok(9));
        });
        assert_eq!(completion.wait_timeout(Duration::from_secs(5)), Ok(9));
        h.join().unwrap();
    }
}
