//! Sessions: one independent user of the engine.
//!
//! A [`Session`] owns at most one coherent buffer and one completion signal.
//! A transfer always goes from the session's buffer, through the engine, back
//! into the same buffer.
use alloc::sync::Arc;
use core::fmt;

use crate::{
    buf::{CoherentBuffer, Mapping},
    channel::AxiDma,
    command::Command,
    comms::completion::{CompletionCell, CompletionError},
    engine::Engine,
    poll::PollPolicy,
    regs::RegisterWindow,
    synchronizer::TransferContext,
    Error,
};


/// Identifies a session for as long as its engine is attached.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionId(pub(crate) usize);

pub struct Session<R: RegisterWindow + 'static> {
    id: SessionId,
    engine: Arc<Engine<R>>,
    buf: Option<Arc<CoherentBuffer>>,
    done: CompletionCell<Result<(), Error>>,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<R: RegisterWindow + 'static> Session<R> {
    pub(crate) fn new(id: SessionId, engine: Arc<Engine<R>>) -> Self {
        Self {
            id,
            engine,
            buf: None,
            done: CompletionCell::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Length of the session's buffer, if it has one.
    #[must_use]
    pub fn buffer_len(&self) -> Option<usize> {
        self.buf.as_ref().map(|buf| buf.len())
    }

    /// Returns `true` if a transfer was started and its result has not been
    /// picked up by [`wait_receive`](Self::wait_receive) yet.
    #[must_use]
    pub fn transfer_pending(&self) -> bool {
        self.done.is_pending()
    }

    /// Allocates the session's coherent buffer.
    ///
    /// `size` must be non-zero and strictly smaller than the engine's
    /// [`max_buffer_size`](crate::ProxySettings::max_buffer_size).
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub fn allocate_buffer(&mut self, size: usize) -> Result<(), Error> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-length buffer"));
        }
        if size >= self.engine.settings().max_buffer_size {
            return Err(Error::InvalidArgument("buffer too large"));
        }
        if self.buf.is_some() {
            return Err(Error::InvalidArgument("buffer already allocated"));
        }

        let buf = CoherentBuffer::allocate(self.engine.allocator(), size).map_err(|error| {
            tracing::warn!(%error, "coherent allocation failed");
            Error::from(error)
        })?;
        tracing::debug!(addr = %buf.bus_addr(), "buffer allocated");
        self.buf = Some(Arc::new(buf));
        Ok(())
    }

    /// Frees the session's buffer.
    ///
    /// If a transfer into the buffer is still running, the memory stays
    /// reserved until the transfer ends.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub fn free_buffer(&mut self) -> Result<(), Error> {
        let buf = self
            .buf
            .take()
            .ok_or(Error::FailedPrecondition("no buffer allocated"))?;
        tracing::debug!(addr = %buf.bus_addr(), in_flight = Arc::strong_count(&buf) > 1, "buffer freed");
        Ok(())
    }

    /// Maps the first `len` bytes of the buffer.
    pub fn map(&self, len: usize) -> Result<Mapping<'_>, Error> {
        let buf = self
            .buf
            .as_ref()
            .ok_or(Error::FailedPrecondition("no buffer allocated"))?;
        buf.map(len)
            .ok_or(Error::InvalidArgument("mapping longer than the buffer"))
    }

    /// Sends the first `len` bytes of the buffer through the engine, with the
    /// result landing back in the buffer.
    ///
    /// Waits for the arbitration lock and for the transmit side to finish.
    /// The receive side finishes in the background; pick up its result with
    /// [`wait_receive`](Self::wait_receive).
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub async fn start_transfer(&mut self, len: usize) -> Result<(), Error> {
        let buf = self
            .buf
            .clone()
            .ok_or(Error::InvalidArgument("no buffer allocated"))?;
        if len == 0 {
            return Err(Error::InvalidArgument("zero-length transfer"));
        }
        if len > buf.len() {
            return Err(Error::InvalidArgument("transfer longer than the buffer"));
        }
        let len32 =
            u32::try_from(len).map_err(|_| Error::InvalidArgument("transfer longer than the buffer"))?;
        if self.done.is_pending() {
            return Err(Error::FailedPrecondition("previous transfer not yet received"));
        }

        let mut hw = self.engine.acquire_hw().await;
        tracing::trace!("acquired engine");
        self.engine.check_attached()?;

        if let Err(error) = Self::transmit(&mut hw, &buf, len32, self.engine.settings().tx_poll).await {
            tracing::warn!(%error, "transmit failed, releasing engine");
            hw.halt_logged();
            return Err(error);
        }

        let done = self
            .done
            .arm()
            .map_err(|_| Error::FailedPrecondition("previous transfer not yet received"))?;
        let ctx = TransferContext {
            hw,
            done,
            buf,
            owner: self.id,
            len,
        };
        if let Err(error) = self.engine.launch_synchronizer(ctx).await {
            // the context was dropped along with the task, so the cell only
            // holds an abandonment. clear it.
            let _ = self.done.receive().await;
            return Err(error);
        }

        tracing::debug!("transfer started");
        Ok(())
    }

    /// Waits for the transfer started by
    /// [`start_transfer`](Self::start_transfer) to land in the buffer, then
    /// stops the completion task.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub async fn wait_receive(&mut self) -> Result<(), Error> {
        let result = match self.done.receive().await {
            Ok(result) => result,
            Err(CompletionError::NotArmed) => {
                return Err(Error::FailedPrecondition("no transfer in flight"));
            }
            Err(CompletionError::Abandoned) => {
                Err(Error::FailedPrecondition("transfer abandoned"))
            }
            Err(error) => {
                tracing::error!(%error, "completion signal failed");
                Err(Error::FailedPrecondition("completion signal failed"))
            }
        };

        self.engine.stop_synchronizer(self.id).await;
        tracing::debug!(?result, "receive finished");
        result
    }

    /// Closes the session, abandoning a transfer that is still running and
    /// freeing the buffer.
    pub async fn close(mut self) {
        tracing::debug!(session = %self.id, "closing session");
        self.engine.stop_synchronizer(self.id).await;
        self.buf = None;
    }

    /// Runs `cmd` against this session.
    pub async fn dispatch(&mut self, cmd: Command) -> Result<(), Error> {
        match cmd {
            Command::CreateBuffer(size) => self.allocate_buffer(size),
            Command::DestroyBuffer => self.free_buffer(),
            Command::StartTransfer(len) => self.start_transfer(len).await,
            Command::WaitForReceive => self.wait_receive().await,
        }
    }

    async fn transmit(
        hw: &mut AxiDma<R>,
        buf: &CoherentBuffer,
        len: u32,
        policy: PollPolicy,
    ) -> Result<(), Error> {
        let addr = buf.bus_addr();
        hw.setup_tx(addr)?;
        hw.setup_rx(addr, len)?;
        hw.start_tx(len);
        hw.sync_tx(policy).await
    }
}

impl<R: RegisterWindow + 'static> Drop for Session<R> {
    fn drop(&mut self) {
        self.engine.release_slot();
        tracing::info!(session = %self.id, "session closed");
    }
}

impl<R: RegisterWindow + 'static> fmt::Debug for Session<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("buf", &self.buf)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
