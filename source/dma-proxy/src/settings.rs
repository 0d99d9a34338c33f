use serde::{Deserialize, Serialize};

use crate::{poll::PollPolicy, regs::REGISTER_SPAN, Error};

/// Maximum number of sessions open at once.
pub const MAX_INST: usize = 4;
/// Buffers must be strictly smaller than this many bytes.
pub const MAX_BUF_SZ: usize = 8192;
/// Physical base address of the engine's register window, for platforms
/// without device discovery.
pub const AXI_DMA_BASE_ADDR: usize = 0x4040_0000;
/// Size of the engine's register window.
pub const AXI_DMA_ADDR_SZ: usize = 0xFFFF;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub max_sessions: usize,
    pub max_buffer_size: usize,
    pub base_addr: usize,
    pub window_size: usize,
    /// How long a transfer start waits for the transmit channel.
    pub tx_poll: PollPolicy,
    /// How long the completion task waits for the receive channel.
    pub rx_poll: PollPolicy,
}

impl ProxySettings {
    pub const DEFAULT_MAX_SESSIONS: usize = MAX_INST;
    pub const DEFAULT_MAX_BUFFER_SIZE: usize = MAX_BUF_SZ;

    /// Checks that the settings describe a usable engine.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_sessions == 0 {
            return Err(Error::InvalidArgument("max_sessions must be non-zero"));
        }
        if self.max_buffer_size < 2 {
            return Err(Error::InvalidArgument("max_buffer_size leaves no usable size"));
        }
        if u32::try_from(self.max_buffer_size).is_err() {
            return Err(Error::InvalidArgument("max_buffer_size does not fit a length register"));
        }
        if self.window_size < REGISTER_SPAN {
            return Err(Error::InvalidArgument("window_size does not cover every register"));
        }
        if self.base_addr % 4 != 0 {
            return Err(Error::InvalidArgument("base_addr is not register aligned"));
        }
        Ok(())
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            max_sessions: Self::DEFAULT_MAX_SESSIONS,
            max_buffer_size: Self::DEFAULT_MAX_BUFFER_SIZE,
            base_addr: AXI_DMA_BASE_ADDR,
            window_size: AXI_DMA_ADDR_SZ,
            tx_poll: PollPolicy::UNBOUNDED,
            rx_poll: PollPolicy::UNBOUNDED,
        }
    }
}
