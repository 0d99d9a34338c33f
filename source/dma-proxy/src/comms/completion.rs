//! Transfer completion signals.
//!
//! Every session owns one [`CompletionCell`]. Starting a transfer arms the
//! cell, which hands out a single-use [`Completer`] to the completion task.
//! The task completes it once the receive channel finishes, and the session
//! picks the result up with [`CompletionCell::receive`].
//!
//! The cell is reusable: once a result has been received (or the completer
//! abandoned), it can be armed again for the next transfer.

use alloc::sync::Arc;
use core::{cell::UnsafeCell, fmt, mem::MaybeUninit};

use maitake_sync::{Closed, WaitCell};
use portable_atomic::{AtomicU8, Ordering};

/// Nothing is in flight.
const IDLE: u8 = 0;
/// A completer exists and has not sent yet.
const ARMED: u8 = 1;
/// The completer is writing its result.
const WRITING: u8 = 2;
/// A result is waiting to be received.
const READY: u8 = 3;
/// The cell is taking the result out.
const READING: u8 = 4;
/// The cell was dropped.
const CLOSED: u8 = 5;
/// The completer was dropped without sending a result.
const ABANDONED: u8 = 6;

/// The session side of a completion signal.
pub struct CompletionCell<T> {
    inner: Arc<Inner<T>>,
}

/// The single-use sending side of an armed [`CompletionCell`].
pub struct Completer<T> {
    /// Taken by [`Completer::complete`], so that dropping a completer that
    /// already sent cannot touch the cell's next arming.
    inner: Option<Arc<Inner<T>>>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompletionError {
    /// [`CompletionCell::arm`] was called while a completer was live.
    AlreadyArmed,
    /// [`CompletionCell::receive`] was called with nothing in flight.
    NotArmed,
    /// The completer was dropped without completing.
    Abandoned,
    /// The cell was dropped before the result arrived.
    Closed,
    /// The state word held a value that should be impossible.
    Internal,
}

struct Inner<T> {
    state: AtomicU8,
    cell: UnsafeCell<MaybeUninit<T>>,
    wait: WaitCell,
}

// === impl CompletionCell ===

impl<T> CompletionCell<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
        }
    }

    /// Arms the cell, returning the completer for the next result.
    ///
    /// A result that was completed but never received is discarded, as is a
    /// previous abandonment.
    pub fn arm(&self) -> Result<Completer<T>, CompletionError> {
        loop {
            let swap =
                self.inner
                    .state
                    .compare_exchange(IDLE, ARMED, Ordering::AcqRel, Ordering::Acquire);

            match swap {
                Ok(_) => {
                    return Ok(Completer {
                        inner: Some(self.inner.clone()),
                    })
                }
                Err(READY) => {
                    // Safety: READY means the completer finished writing.
                    if let Some(stale) = unsafe { self.inner.take_ready() } {
                        drop(stale);
                    }
                }
                Err(ABANDONED) => {
                    let _ = self.inner.state.compare_exchange(
                        ABANDONED,
                        IDLE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
                Err(ARMED | WRITING) => return Err(CompletionError::AlreadyArmed),
                Err(_) => return Err(CompletionError::Internal),
            }
        }
    }

    /// Returns `true` while a completer is live, or a result is waiting to
    /// be received.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(
            self.inner.state.load(Ordering::Acquire),
            ARMED | WRITING | READY | ABANDONED
        )
    }

    /// Waits for the armed completer to send its result.
    ///
    /// Returns [`CompletionError::NotArmed`] right away if the cell was never
    /// armed (or its result was already received).
    pub async fn receive(&self) -> Result<T, CompletionError> {
        loop {
            match self.inner.state.load(Ordering::Acquire) {
                READY => {
                    // Safety: READY means the completer finished writing.
                    if let Some(value) = unsafe { self.inner.take_ready() } {
                        return Ok(value);
                    }
                }
                ARMED | WRITING => {
                    // The cell can only be closed by dropping `self`, which
                    // cannot happen while it is borrowed here.
                    self.inner.wait.wait().await?;
                }
                ABANDONED => {
                    if self
                        .inner
                        .state
                        .compare_exchange(ABANDONED, IDLE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Err(CompletionError::Abandoned);
                    }
                }
                IDLE => return Err(CompletionError::NotArmed),
                _ => return Err(CompletionError::Internal),
            }
        }
    }
}

impl<T> Default for CompletionCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for CompletionCell<T> {
    fn drop(&mut self) {
        let old = self.inner.state.swap(CLOSED, Ordering::AcqRel);
        self.inner.wait.close();

        match old {
            // Nothing stored, or the completer will find the cell closed and
            // drop its own value.
            IDLE | ARMED | WRITING | ABANDONED => {}
            READY => {
                // Safety: READY means a value was written and nobody took it.
                unsafe { self.inner.drop_value() }
            }
            READING => debug_assert!(false, "dropped completion cell while reading?"),
            CLOSED => debug_assert!(false, "completion cell closed twice?"),
            _ => {}
        }
    }
}

impl<T> fmt::Debug for CompletionCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionCell")
            .field("state", &self.inner.state.load(Ordering::Relaxed))
            .finish()
    }
}

// === impl Completer ===

impl<T> Completer<T> {
    /// Sends `value` to the cell that armed this completer.
    pub fn complete(mut self, value: T) -> Result<(), CompletionError> {
        let inner = self.inner.take().ok_or(CompletionError::Internal)?;
        let swap =
            inner
                .state
                .compare_exchange(ARMED, WRITING, Ordering::AcqRel, Ordering::Acquire);

        match swap {
            Ok(_) => {}
            Err(CLOSED) => return Err(CompletionError::Closed),
            Err(_) => return Err(CompletionError::Internal),
        }

        // Safety: WRITING gives us exclusive access to the slot.
        unsafe { inner.cell.get().write(MaybeUninit::new(value)) };

        let swap =
            inner
                .state
                .compare_exchange(WRITING, READY, Ordering::AcqRel, Ordering::Acquire);

        match swap {
            Ok(_) => {}
            Err(CLOSED) => {
                // The cell went away mid-write, so the value is ours to drop.
                unsafe { inner.drop_value() };
                return Err(CompletionError::Closed);
            }
            Err(_) => return Err(CompletionError::Internal),
        }

        inner.wait.wake();
        Ok(())
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        if inner
            .state
            .compare_exchange(ARMED, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            inner.wait.wake();
        }
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field(
                "state",
                &self.inner.as_ref().map(|inner| inner.state.load(Ordering::Relaxed)),
            )
            .finish()
    }
}

// === impl CompletionError ===

impl From<Closed> for CompletionError {
    fn from(_: Closed) -> Self {
        CompletionError::Closed
    }
}

impl fmt::Display for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            CompletionError::AlreadyArmed => "completion already armed",
            CompletionError::NotArmed => "nothing in flight",
            CompletionError::Abandoned => "completion abandoned",
            CompletionError::Closed => "completion cell closed",
            CompletionError::Internal => "invalid completion state",
        };
        f.write_str(msg)
    }
}

// === impl Inner ===

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

// NOTE: no Drop impl; a stored value is dropped by whichever side owns it
// when the state changes.
impl<T> Inner<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            cell: UnsafeCell::new(MaybeUninit::uninit()),
            wait: WaitCell::new(),
        }
    }

    /// Moves a READY value out, leaving the cell IDLE.
    ///
    /// # Safety
    ///
    /// Only the cell side may call this.
    unsafe fn take_ready(&self) -> Option<T> {
        self.state
            .compare_exchange(READY, READING, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let value = self.cell.get().read().assume_init();
        self.state.store(IDLE, Ordering::Release);
        Some(value)
    }

    unsafe fn drop_value(&self) {
        let ptr: *mut T = self.cell.get().cast();
        core::ptr::drop_in_place(ptr);
    }
}
