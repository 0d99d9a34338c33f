//! Status polling.
//!
//! The engine is never interrupt driven: completion is detected by
//! re-reading a status register. A [`PollPolicy`] bounds how many reads are
//! attempted before giving up. Between reads the polling task yields to its
//! executor, so other tasks keep running on cooperative schedulers.
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use serde::{Deserialize, Serialize};

/// How long to keep polling a status register.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Maximum number of status reads. `None` polls forever.
    pub max_polls: Option<u64>,
}

/// Tracks reads against a [`PollPolicy`].
#[derive(Debug)]
pub(crate) struct PollBudget {
    max: Option<u64>,
    polls: u64,
}

#[must_use = "futures do nothing unless `.await`ed or polled"]
pub(crate) struct YieldNow {
    yielded: bool,
}

impl PollPolicy {
    /// Polls until the hardware answers, however long that takes.
    pub const UNBOUNDED: Self = Self { max_polls: None };

    #[must_use]
    pub const fn bounded(max_polls: u64) -> Self {
        Self {
            max_polls: Some(max_polls),
        }
    }

    pub(crate) fn budget(&self) -> PollBudget {
        PollBudget {
            max: self.max_polls,
            polls: 0,
        }
    }
}

impl PollBudget {
    /// Records one status read, returning `false` if the budget was already
    /// spent.
    pub(crate) fn spend(&mut self) -> bool {
        if let Some(max) = self.max {
            if self.polls >= max {
                return false;
            }
        }
        self.polls += 1;
        true
    }

    pub(crate) fn polls(&self) -> u64 {
        self.polls
    }
}

/// Yields once to the executor.
pub(crate) fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
