// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

/*!
Single-resolution completion handles.

One frame's eventual inference outcome travels through a
([`CompletionNotifier`], [`CompletionHandle`]) pair built on a bounded(1)
channel. The dispatching side resolves the notifier exactly once (enforced
by move semantics); the delivery queue waits on the handle without
busy-polling. A notifier dropped unresolved surfaces as
[`InferOutcome::Abandoned`] on the waiting side instead of a hang.
*/

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Terminal state of one frame's inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferOutcome {
    /// Inference ran (or was legitimately bypassed for EOS/dropped frames).
    Completed,
    /// The batch this frame belonged to failed; the message names why.
    Failed(String),
    /// The dispatching side went away without resolving; happens when a
    /// module closes with batches in flight.
    Abandoned,
}

/// Resolving half. Consumed by `resolve`, so a handle can never be
/// resolved twice.
pub struct CompletionNotifier {
    tx: Sender<InferOutcome>,
}

impl CompletionNotifier {
    pub fn resolve(self, outcome: InferOutcome) {
        // The handle may already have been dropped (delivery shut down);
        // nothing left to notify then.
        let _ = self.tx.send(outcome);
    }
}

/// Waiting half, observed by the delivery queue.
pub struct CompletionHandle {
    rx: Receiver<InferOutcome>,
}

impl CompletionHandle {
    /// Creates an unresolved pair.
    pub fn pair() -> (CompletionNotifier, CompletionHandle) {
        let (tx, rx) = bounded(1);
        (CompletionNotifier { tx }, CompletionHandle { rx })
    }

    /// A handle born resolved, for frames that bypass inference.
    pub fn resolved(outcome: InferOutcome) -> CompletionHandle {
        let (notifier, handle) = Self::pair();
        notifier.resolve(outcome);
        handle
    }

    /// Blocks until resolution. A disconnected notifier reads as
    /// [`InferOutcome::Abandoned`].
    pub fn wait(&self) -> InferOutcome {
        self.rx.recv().unwrap_or(InferOutcome::Abandoned)
    }

    /// Bounded wait; `None` means still unresolved.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<InferOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(InferOutcome::Abandoned),
        }
    }

    /// Non-blocking probe.
    pub fn try_wait(&self) -> Option<InferOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(crossbeam::channel::TryRecvError::Empty) => None,
            Err(crossbeam::channel::TryRecvError::Disconnected) => Some(InferOutcome::Abandoned),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn resolve_reaches_the_waiter() {
        let (notifier, handle) = CompletionHandle::pair();
        assert!(handle.try_wait().is_none());
        notifier.resolve(InferOutcome::Completed);
        assert_eq!(handle.wait(), InferOutcome::Completed);
    }

    #[test]
    fn pre_resolved_handles_do_not_block() {
        let handle = CompletionHandle::resolved(InferOutcome::Completed);
        assert_eq!(handle.try_wait(), Some(InferOutcome::Completed));
    }

    #[test]
    fn dropped_notifier_reads_as_abandoned() {
        let (notifier, handle) = CompletionHandle::pair();
        drop(notifier);
        assert_eq!(handle.wait(), InferOutcome::Abandoned);
    }

    #[test]
    fn wait_crosses_threads() {
        let (notifier, handle) = CompletionHandle::pair();
        let resolver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            notifier.resolve(InferOutcome::Failed("device lost".into()));
        });
        assert_eq!(
            handle.wait_timeout(Duration::from_secs(2)),
            Some(InferOutcome::Failed("device lost".into()))
        );
        resolver.join().unwrap();
    }
}
