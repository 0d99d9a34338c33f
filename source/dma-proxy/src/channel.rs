//! The channel controller: register sequences that reset, halt, program and
//! start the engine's `MM2S` and `S2MM` channels.
//!
//! An [`AxiDma`] lives inside the engine's arbitration lock, so holding a
//! `&mut AxiDma` is the proof that no other sequence is running.
use crate::{
    buf::BusAddr,
    poll::{self, PollPolicy},
    regs::{Channel, DmaCr, DmaSr, RegisterWindow},
    Error,
};

/// Channel controller for one AXI DMA core.
#[derive(Debug)]
pub struct AxiDma<R> {
    regs: R,
}

impl<R: RegisterWindow> AxiDma<R> {
    #[must_use]
    pub fn new(regs: R) -> Self {
        Self { regs }
    }

    /// Resets both channels. Idempotent.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.check_mapped()?;
        self.write_control(Channel::Mm2s, DmaCr::reset());
        self.write_control(Channel::S2mm, DmaCr::reset());
        Ok(())
    }

    /// Halts both channels by clearing their control registers.
    pub fn halt(&mut self) -> Result<(), Error> {
        self.check_mapped()?;
        self.write_control(Channel::Mm2s, DmaCr::new());
        self.write_control(Channel::S2mm, DmaCr::new());
        Ok(())
    }

    /// Halts both channels on a failure path, where there is no caller left
    /// to hand an error to. Does nothing if the window is unmapped.
    pub(crate) fn halt_logged(&mut self) {
        if !self.is_mapped() {
            return;
        }
        if let Err(error) = self.halt() {
            tracing::error!(%error, "failed to halt the engine");
        }
    }

    /// Points the transmit channel at `src` and sets it running.
    ///
    /// Nothing moves until [`start_tx`](Self::start_tx) writes the length.
    pub fn setup_tx(&mut self, src: BusAddr) -> Result<(), Error> {
        self.check_mapped()?;
        if src.is_null() {
            return Err(Error::InvalidArgument("null transmit source address"));
        }

        let regs = Channel::MM2S;
        tracing::trace!(%src, "MM2S: set source address");
        self.regs.write(regs.address, src.as_u32());
        self.write_control(Channel::Mm2s, DmaCr::run_with_irqs());
        Ok(())
    }

    /// Writes the transmit length, which kicks off the transfer.
    pub fn start_tx(&mut self, len: u32) {
        tracing::trace!(len, "MM2S: write length");
        self.regs.write(Channel::MM2S.length, len);
    }

    /// Points the receive channel at `dest`, sets it running, and arms it for
    /// `len` bytes.
    pub fn setup_rx(&mut self, dest: BusAddr, len: u32) -> Result<(), Error> {
        self.check_mapped()?;
        if dest.is_null() {
            return Err(Error::InvalidArgument("null receive destination address"));
        }

        let regs = Channel::S2MM;
        tracing::trace!(%dest, len, "S2MM: set destination address");
        self.regs.write(regs.address, dest.as_u32());
        self.write_control(Channel::S2mm, DmaCr::run_with_irqs());
        self.regs.write(regs.length, len);
        Ok(())
    }

    /// Waits until the transmit channel is idle and has flagged completion.
    ///
    /// With [`PollPolicy::UNBOUNDED`] this never returns if the engine never
    /// finishes.
    pub async fn sync_tx(&mut self, policy: PollPolicy) -> Result<(), Error> {
        self.check_mapped()?;
        let mut budget = policy.budget();
        let mut error_seen = false;
        loop {
            let status = self.status(Channel::Mm2s);
            if status.is_complete() {
                tracing::trace!(polls = budget.polls(), "MM2S: idle");
                return Ok(());
            }

            if status.has_error() && !error_seen {
                error_seen = true;
                tracing::warn!(?status, "MM2S: engine reports an error");
            }

            if !budget.spend() {
                tracing::warn!(polls = budget.polls(), ?status, "MM2S: gave up waiting for idle");
                return Err(Error::Unresponsive(Channel::Mm2s));
            }

            poll::yield_now().await;
        }
    }

    /// Reads the status register of `channel`.
    #[must_use]
    pub fn status(&self, channel: Channel) -> DmaSr {
        DmaSr::from_bits(self.regs.read(channel.regs().status))
    }

    /// Returns `true` if the receive channel is idle and has flagged
    /// completion.
    #[must_use]
    pub fn rx_complete(&self) -> bool {
        self.status(Channel::S2mm).is_complete()
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.regs.is_mapped()
    }

    fn check_mapped(&self) -> Result<(), Error> {
        if self.regs.is_mapped() {
            Ok(())
        } else {
            Err(Error::InvalidArgument("engine registers are not mapped"))
        }
    }

    fn write_control(&self, channel: Channel, value: DmaCr) {
        tracing::trace!(%channel, control = ?value, "write DMACR");
        self.regs.write(channel.regs().control, value.bits());
    }
}
