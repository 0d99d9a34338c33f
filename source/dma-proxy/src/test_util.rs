//! A simulated AXI DMA core in loopback, and a rig that attaches an engine to
//! it.
//!
//! The simulated core behaves like the reference design's inverting
//! loopback: whatever `MM2S` reads from memory comes back on `S2MM` with
//! every bit flipped.
use std::{
    ptr,
    sync::{Arc, Mutex, MutexGuard},
};

use futures::{executor::ThreadPool, task::Spawn};

use crate::{
    buf::{BusAddr, DmaAllocator, RegionAllocator},
    engine::Engine,
    regs::*,
    settings::ProxySettings,
};

/// Bus address of the simulated coherent memory.
pub(crate) const SIM_BUS: BusAddr = BusAddr::new(0x1000_0000);

const STATUS_DONE: u32 = (1 << 12) | (1 << 1);
/// `DMASR.DMA_INT_ERR`.
const STATUS_INT_ERR: u32 = 1 << 4;

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum SimEvent {
    Write { offset: usize, value: u32 },
    /// The receive channel was first seen idle and complete.
    RxComplete { dest: u32, len: usize },
}

pub(crate) struct SimDma {
    mem: *mut u8,
    mem_len: usize,
    state: Mutex<SimState>,
}

#[derive(Default)]
struct SimState {
    regs: [u32; 0x60 / 4],
    events: Vec<SimEvent>,
    /// Data emitted by `MM2S` that `S2MM` has not taken yet.
    stream: Option<Vec<u8>>,
    rx_armed: Option<(u32, usize)>,
    tx_done: bool,
    rx_done: Option<(u32, usize)>,
    rx_reported: bool,
    stall_tx: bool,
    hold_rx: bool,
    int_err: bool,
}

pub(crate) struct TestRig {
    pub(crate) sim: Arc<SimDma>,
    pub(crate) region: Arc<RegionAllocator>,
    pub(crate) allocator: Arc<dyn DmaAllocator>,
    pub(crate) pool: ThreadPool,
    pub(crate) engine: Arc<Engine<Arc<SimDma>>>,
}

// Safety: the memory is leaked, and only accessed under the state lock or
// through volatile accesses by the code under test.
unsafe impl Send for SimDma {}
unsafe impl Sync for SimDma {}

impl SimDma {
    pub(crate) fn new(mem_len: usize) -> Arc<Self> {
        let mem = Box::leak(vec![0u8; mem_len].into_boxed_slice()).as_mut_ptr();
        Arc::new(Self {
            mem,
            mem_len,
            state: Mutex::new(SimState::default()),
        })
    }

    /// A core with enough memory behind [`SIM_BUS`] for one default-sized
    /// buffer per default session.
    pub(crate) fn standalone() -> Arc<Self> {
        Self::new(ProxySettings::DEFAULT_MAX_SESSIONS * ProxySettings::DEFAULT_MAX_BUFFER_SIZE)
    }

    pub(crate) fn memory(&self) -> (*mut u8, BusAddr, usize) {
        (self.mem, SIM_BUS, self.mem_len)
    }

    pub(crate) fn events(&self) -> Vec<SimEvent> {
        self.state().events.clone()
    }

    pub(crate) fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Keeps `MM2S` from ever reporting completion.
    pub(crate) fn stall_tx(&self, stall: bool) {
        self.state().stall_tx = stall;
    }

    /// Delays `S2MM` reporting completion until released.
    pub(crate) fn hold_rx(&self, hold: bool) {
        self.state().hold_rx = hold;
    }

    /// Sets the internal error bit in both status registers.
    pub(crate) fn report_error(&self, error: bool) {
        self.state().int_err = error;
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn addr(&self, bus: u32, len: usize) -> *mut u8 {
        let offset = bus
            .checked_sub(SIM_BUS.as_u32())
            .expect("bus address below simulated memory") as usize;
        assert!(
            offset + len <= self.mem_len,
            "{len} bytes at {bus:#x} outside of simulated memory"
        );
        unsafe { self.mem.add(offset) }
    }

    fn transmit(&self, state: &mut SimState, len: usize) {
        if state.stall_tx {
            tracing::debug!("sim: MM2S stalled");
            return;
        }
        let src = self.addr(state.regs[MM2S_SA / 4], len);
        let data = (0..len)
            .map(|i| unsafe { !ptr::read_volatile(src.add(i)) })
            .collect();
        state.stream = Some(data);
        state.tx_done = true;
        self.deliver(state);
    }

    fn deliver(&self, state: &mut SimState) {
        let (Some(data), Some((dest, len))) = (state.stream.as_ref(), state.rx_armed) else {
            return;
        };
        let n = data.len().min(len);
        let dst = self.addr(dest, n);
        for (i, &byte) in data[..n].iter().enumerate() {
            unsafe { ptr::write_volatile(dst.add(i), byte) };
        }
        state.stream = None;
        state.rx_armed = None;
        state.rx_done = Some((dest, n));
    }
}

impl RegisterWindow for SimDma {
    fn read(&self, offset: usize) -> u32 {
        let mut state = self.state();
        let err = if state.int_err { STATUS_INT_ERR } else { 0 };
        match offset {
            MM2S_DMASR if state.tx_done => STATUS_DONE | err,
            MM2S_DMASR => err,
            S2MM_DMASR => err | match state.rx_done {
                Some((dest, len)) if !state.hold_rx => {
                    if !state.rx_reported {
                        state.rx_reported = true;
                        state.events.push(SimEvent::RxComplete { dest, len });
                    }
                    STATUS_DONE
                }
                _ => 0,
            },
            _ => state.regs[offset / 4],
        }
    }

    fn write(&self, offset: usize, value: u32) {
        let mut state = self.state();
        state.events.push(SimEvent::Write { offset, value });
        state.regs[offset / 4] = value;
        match offset {
            MM2S_DMACR => {
                state.tx_done = false;
                state.stream = None;
            }
            S2MM_DMACR => {
                state.rx_done = None;
                state.rx_armed = None;
                state.rx_reported = false;
            }
            S2MM_LENGTH => {
                state.rx_armed = Some((state.regs[S2MM_DA / 4], value as usize));
                self.deliver(&mut state);
            }
            MM2S_LENGTH => self.transmit(&mut state, value as usize),
            _ => {}
        }
    }
}

impl TestRig {
    pub(crate) fn new() -> Self {
        Self::with_settings(ProxySettings::default())
    }

    pub(crate) fn with_settings(settings: ProxySettings) -> Self {
        trace_init();
        let slot = (settings.max_buffer_size + 4095) & !4095;
        let sim = SimDma::new(settings.max_sessions * slot);
        let (virt, bus, len) = sim.memory();
        let region = Arc::new(unsafe {
            RegionAllocator::new(virt, bus, len, settings.max_buffer_size).unwrap()
        });
        let allocator: Arc<dyn DmaAllocator> = region.clone();
        let pool = ThreadPool::builder()
            .pool_size(2)
            .name_prefix("dma-proxy-test-")
            .create()
            .unwrap();
        let engine = Engine::attach(
            sim.clone(),
            allocator.clone(),
            Arc::new(pool.clone()),
            settings,
        )
        .unwrap();
        Self {
            sim,
            region,
            allocator,
            pool,
            engine,
        }
    }

    pub(crate) fn spawner(&self) -> Arc<dyn Spawn + Send + Sync> {
        Arc::new(self.pool.clone())
    }
}

pub(crate) fn trace_init() {
    use tracing_subscriber::{
        filter::{EnvFilter, LevelFilter},
        prelude::*,
    };
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    let filter = if env.is_empty() {
        builder.parse("dma_proxy=debug").unwrap()
    } else {
        builder.parse_lossy(env)
    };

    let _res = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_thread_names(true)
        .without_time()
        .finish()
        .try_init();
}
