//! The engine: one AXI DMA core, shared by every session.
//!
//! The [`AxiDma`] channel controller lives inside a [`Mutex`], the
//! arbitration lock. Every register sequence runs while holding that lock's
//! guard, and a transfer start hands the guard over to the completion task
//! rather than releasing it, so sequences never interleave.
use alloc::sync::Arc;
use core::fmt;

use futures::task::{Spawn, SpawnExt};
use maitake_sync::{mutex::OwnedMutexGuard, Mutex};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{
    buf::DmaAllocator,
    channel::AxiDma,
    regs::RegisterWindow,
    session::{Session, SessionId},
    settings::ProxySettings,
    synchronizer::{self, SyncHandle, TransferContext},
    Error,
};

pub struct Engine<R> {
    hw: Arc<Mutex<AxiDma<R>>>,
    /// The one completion task that may exist at a time.
    synchronizer: Mutex<Option<SyncHandle>>,
    allocator: Arc<dyn DmaAllocator>,
    spawner: Arc<dyn Spawn + Send + Sync>,
    settings: ProxySettings,
    open_sessions: AtomicUsize,
    next_id: AtomicUsize,
    detached: AtomicBool,
}

impl<R> Engine<R>
where
    R: RegisterWindow + 'static,
{
    /// Brings up the engine behind `regs`: resets both channels, then halts
    /// them.
    ///
    /// Fails with [`Error::InvalidArgument`] if `regs` is not mapped or the
    /// settings are unusable.
    pub fn attach(
        regs: R,
        allocator: Arc<dyn DmaAllocator>,
        spawner: Arc<dyn Spawn + Send + Sync>,
        settings: ProxySettings,
    ) -> Result<Arc<Self>, Error> {
        settings.validate()?;

        let mut dma = AxiDma::new(regs);
        dma.reset()?;
        dma.halt()?;

        tracing::info!(
            base = format_args!("{:#x}", settings.base_addr),
            max_sessions = settings.max_sessions,
            max_buffer_size = settings.max_buffer_size,
            "AXI DMA engine attached"
        );

        Ok(Arc::new(Self {
            hw: Arc::new(Mutex::new(dma)),
            synchronizer: Mutex::new(None),
            allocator,
            spawner,
            settings,
            open_sessions: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            detached: AtomicBool::new(false),
        }))
    }

    /// Opens a new session.
    ///
    /// Fails with [`Error::ResourceExhausted`] if
    /// [`max_sessions`](ProxySettings::max_sessions) are already open.
    pub fn open(self: &Arc<Self>) -> Result<Session<R>, Error> {
        self.check_attached()?;
        let max = self.settings.max_sessions;
        self.open_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < max).then_some(open + 1)
            })
            .map_err(|open| {
                tracing::debug!(open, max, "no free session slots");
                Error::ResourceExhausted
            })?;

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::info!(session = %id, "session opened");
        Ok(Session::new(id, self.clone()))
    }

    /// Stops any live completion task, then halts both channels.
    ///
    /// A transfer still in flight is abandoned: its session's
    /// [`wait_receive`](Session::wait_receive) fails. Afterwards the engine
    /// refuses new sessions and transfers with
    /// [`Error::FailedPrecondition`].
    pub async fn detach(&self) -> Result<(), Error> {
        // set before looking at the slot: a start that gets past its own check
        // sees the flag again when it goes to install its completion task.
        if self.detached.swap(true, Ordering::AcqRel) {
            return Err(Error::FailedPrecondition("engine already detached"));
        }

        let prev = self.synchronizer.lock().await.take();
        if let Some(prev) = prev {
            prev.stop();
            prev.join().await;
        }

        self.hw.lock().await.halt()?;
        tracing::info!("AXI DMA engine detached");
        Ok(())
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::Acquire)
    }

    /// Returns `true` while a register sequence or transfer holds the
    /// arbitration lock.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.hw.try_lock().is_none()
    }

    pub(crate) fn allocator(&self) -> &Arc<dyn DmaAllocator> {
        &self.allocator
    }

    /// Waits for the arbitration lock.
    pub(crate) async fn acquire_hw(&self) -> OwnedMutexGuard<AxiDma<R>> {
        self.hw.clone().lock_owned().await
    }

    pub(crate) fn check_attached(&self) -> Result<(), Error> {
        if self.is_detached() {
            Err(Error::FailedPrecondition("engine detached"))
        } else {
            Ok(())
        }
    }

    /// Hands `ctx` to a new completion task, first stopping the previous one.
    ///
    /// The previous task is always past its transfer at this point, since
    /// `ctx` holds the arbitration guard it would have needed.
    pub(crate) async fn launch_synchronizer(&self, ctx: TransferContext<R>) -> Result<(), Error> {
        let owner = ctx.owner;
        let mut slot = self.synchronizer.lock().await;
        if let Err(error) = self.check_attached() {
            tracing::warn!(session = %owner, "engine detached during transfer start, halting");
            let mut hw = ctx.hw;
            hw.halt_logged();
            return Err(error);
        }
        if let Some(prev) = slot.take() {
            tracing::trace!(prev = %prev.owner(), exited = prev.has_exited(), "stopping previous synchronizer");
            prev.stop();
            prev.join().await;
        }

        let (task, handle) = synchronizer::launch(ctx, self.settings.rx_poll);
        self.spawner.spawn(task).map_err(|error| {
            tracing::error!(session = %owner, %error, "failed to spawn synchronizer");
            Error::ResourceExhausted
        })?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stops and joins the completion task, if `owner` launched it.
    pub(crate) async fn stop_synchronizer(&self, owner: SessionId) {
        let mut slot = self.synchronizer.lock().await;
        if slot.as_ref().map(SyncHandle::owner) != Some(owner) {
            return;
        }

        if let Some(handle) = slot.take() {
            handle.stop();
            handle.join().await;
            tracing::trace!(session = %owner, "synchronizer stopped");
        }
    }

    pub(crate) fn release_slot(&self) {
        self.open_sessions.fetch_sub(1, Ordering::AcqRel);
    }

    /// The session whose completion task is currently installed.
    #[cfg(test)]
    pub(crate) fn synchronizer_owner(&self) -> Option<SessionId> {
        futures::executor::block_on(self.synchronizer.lock())
            .as_ref()
            .map(SyncHandle::owner)
    }
}

impl<R> fmt::Debug for Engine<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.settings)
            .field("open_sessions", &self.open_sessions.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        regs::{MmioWindow, MM2S_DMACR, S2MM_DMACR},
        test_util::{SimEvent, TestRig},
    };
    use futures::executor::block_on;

    #[test]
    fn attach_resets_then_halts() {
        let rig = TestRig::new();
        let writes: Vec<_> = rig
            .sim
            .events()
            .into_iter()
            .filter(|ev| matches!(ev, SimEvent::Write { .. }))
            .collect();
        assert_eq!(
            writes,
            vec![
                SimEvent::Write { offset: MM2S_DMACR, value: 0b100 },
                SimEvent::Write { offset: S2MM_DMACR, value: 0b100 },
                SimEvent::Write { offset: MM2S_DMACR, value: 0 },
                SimEvent::Write { offset: S2MM_DMACR, value: 0 },
            ]
        );
        assert!(!rig.engine.is_busy());
        assert_eq!(rig.engine.open_sessions(), 0);
    }

    #[test]
    fn attach_unmapped_fails() {
        let rig = TestRig::new();
        let res = Engine::attach(
            MmioWindow::unmapped(),
            rig.allocator.clone(),
            rig.spawner(),
            ProxySettings::default(),
        );
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn attach_invalid_settings_fails() {
        let rig = TestRig::new();
        let settings = ProxySettings {
            max_sessions: 0,
            ..Default::default()
        };
        let res = Engine::attach(rig.sim.clone(), rig.allocator.clone(), rig.spawner(), settings);
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn session_slots() {
        let rig = TestRig::new();
        let sessions = (0..4)
            .map(|_| rig.engine.open().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(rig.engine.open_sessions(), 4);
        assert_eq!(rig.engine.open().unwrap_err(), Error::ResourceExhausted);

        let mut ids = sessions.iter().map(|s| s.id()).collect::<Vec<_>>();
        ids.dedup();
        assert_eq!(ids.len(), 4);

        drop(sessions);
        assert_eq!(rig.engine.open_sessions(), 0);
        rig.engine.open().unwrap();
    }

    #[test]
    fn detached_engine_refuses_sessions() {
        let rig = TestRig::new();
        let session = rig.engine.open().unwrap();
        block_on(rig.engine.detach()).unwrap();
        assert!(rig.engine.is_detached());
        assert_eq!(
            rig.engine.open().unwrap_err(),
            Error::FailedPrecondition("engine detached")
        );
        assert_eq!(
            block_on(rig.engine.detach()),
            Err(Error::FailedPrecondition("engine already detached"))
        );
        drop(session);
        assert_eq!(rig.engine.open_sessions(), 0);
    }

    #[test]
    fn launching_replaces_the_idle_synchronizer() {
        let rig = TestRig::new();
        let mut a = rig.engine.open().unwrap();
        let mut b = rig.engine.open().unwrap();
        a.allocate_buffer(64).unwrap();
        b.allocate_buffer(64).unwrap();

        let running = || rig.engine.synchronizer_owner();

        block_on(a.start_transfer(64)).unwrap();
        assert_eq!(running(), Some(a.id()));

        // a's task finishes its transfer and idles; starting b stops it.
        block_on(b.start_transfer(64)).unwrap();
        assert_eq!(running(), Some(b.id()));

        block_on(a.wait_receive()).unwrap();
        assert_eq!(running(), Some(b.id()), "a must not stop b's task");

        block_on(b.wait_receive()).unwrap();
        assert_eq!(running(), None);
    }

    #[test]
    fn detach_halts() {
        let rig = TestRig::new();
        rig.sim.clear_events();
        block_on(rig.engine.detach()).unwrap();
        assert_eq!(
            rig.sim.events(),
            vec![
                SimEvent::Write { offset: MM2S_DMACR, value: 0 },
                SimEvent::Write { offset: S2MM_DMACR, value: 0 },
            ]
        );
    }
}
