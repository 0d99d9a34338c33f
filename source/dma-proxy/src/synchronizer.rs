//! The background completion task.
//!
//! A transfer start ends by handing a [`TransferContext`] (which owns the
//! engine's arbitration guard) to a freshly spawned completion task. The task
//! polls the receive channel until it reports idle-and-complete, releases the
//! arbitration lock, and completes the owning session's [`Completer`].
//!
//! After that the task does not exit. It idles until told to stop through its
//! [`SyncHandle`], so that exactly one handle is around for the owning
//! session to stop once it has picked up the result.
use alloc::sync::Arc;
use core::future::Future;

use maitake_sync::{mutex::OwnedMutexGuard, WaitCell};
use portable_atomic::{AtomicBool, Ordering};
use tracing::Instrument;

use crate::{
    buf::CoherentBuffer,
    channel::AxiDma,
    comms::completion::Completer,
    poll::{self, PollPolicy},
    regs::{Channel, RegisterWindow},
    session::SessionId,
    Error,
};

/// Everything the completion task owns while a transfer is in flight.
pub(crate) struct TransferContext<R: 'static> {
    /// The arbitration guard. Dropping it lets the next transfer start.
    pub(crate) hw: OwnedMutexGuard<AxiDma<R>>,
    pub(crate) done: Completer<Result<(), Error>>,
    /// Keeps the destination buffer pinned until the engine is done with it.
    pub(crate) buf: Arc<CoherentBuffer>,
    pub(crate) owner: SessionId,
    pub(crate) len: usize,
}

/// Controls a running completion task.
#[derive(Debug)]
pub(crate) struct SyncHandle {
    owner: SessionId,
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    stop: AtomicBool,
    exited: AtomicBool,
    /// Closed once `exited` is set.
    join: WaitCell,
}

/// Marks the task as exited however its future ends, including being dropped
/// by the executor.
struct ExitGuard(Arc<Shared>);

/// Builds the completion task for `ctx`, and the handle that stops it.
pub(crate) fn launch<R>(
    ctx: TransferContext<R>,
    policy: PollPolicy,
) -> (impl Future<Output = ()> + Send + 'static, SyncHandle)
where
    R: RegisterWindow + 'static,
{
    let shared = Arc::new(Shared {
        stop: AtomicBool::new(false),
        exited: AtomicBool::new(false),
        join: WaitCell::new(),
    });
    let handle = SyncHandle {
        owner: ctx.owner,
        shared: shared.clone(),
    };
    let span = tracing::debug_span!("synchronizer", session = %ctx.owner, len = ctx.len);
    (run(ctx, policy, ExitGuard(shared)).instrument(span), handle)
}

async fn run<R>(ctx: TransferContext<R>, policy: PollPolicy, exit: ExitGuard)
where
    R: RegisterWindow + 'static,
{
    let TransferContext {
        mut hw, done, buf, ..
    } = ctx;

    let mut budget = policy.budget();
    let mut error_seen = false;
    let outcome = loop {
        if exit.stop_requested() {
            break None;
        }

        let status = hw.status(Channel::S2mm);
        if status.is_complete() {
            tracing::trace!(polls = budget.polls(), "S2MM: idle");
            break Some(Ok(()));
        }

        if status.has_error() && !error_seen {
            error_seen = true;
            tracing::warn!(?status, "S2MM: engine reports an error");
        }

        if !budget.spend() {
            tracing::warn!(polls = budget.polls(), ?status, "S2MM: gave up waiting for idle");
            break Some(Err(Error::Unresponsive(Channel::S2mm)));
        }

        poll::yield_now().await;
    };

    match outcome {
        Some(result) => {
            if result.is_err() {
                hw.halt_logged();
            }
            // release the engine before waking the session, so that whoever
            // is queued for it can go ahead.
            drop(hw);
            drop(buf);
            match done.complete(result) {
                Ok(()) => tracing::debug!(?result, "transfer complete"),
                Err(error) => tracing::debug!(%error, "session went away before completion"),
            }
        }
        None => {
            tracing::warn!("stopped while the transfer was in flight, abandoning it");
            hw.halt_logged();
            drop(hw);
            // dropping the completer tells the session the transfer was
            // abandoned.
            drop(done);
            drop(buf);
        }
    }

    while !exit.stop_requested() {
        poll::yield_now().await;
    }
    tracing::trace!("stopped");
}

// === impl SyncHandle ===

impl SyncHandle {
    pub(crate) fn owner(&self) -> SessionId {
        self.owner
    }

    /// Asks the task to stop at its next poll.
    pub(crate) fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Waits for the task to stop. Only returns after [`stop`](Self::stop)
    /// has been called.
    pub(crate) async fn join(&self) {
        // `Closed` here just means the task is gone.
        let _ = self.shared.join.wait_for(|| self.has_exited()).await;
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.shared.exited.load(Ordering::Acquire)
    }
}

// === impl ExitGuard ===

impl ExitGuard {
    fn stop_requested(&self) -> bool {
        self.0.stop.load(Ordering::Acquire)
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.exited.store(true, Ordering::Release);
        self.0.join.close();
    }
}
