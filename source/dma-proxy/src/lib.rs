//! # AXI DMA proxy
//!
//! This crate arbitrates access to a single memory-mapped AXI DMA engine
//! (a transmit `MM2S` channel and a receive `S2MM` channel) between several
//! independent callers. Each caller holds a [`Session`], which owns at most
//! one coherent DMA buffer.
//!
//! ## Attaching the engine
//!
//! The platform glue creates the [`Engine`] once the register window has been
//! mapped, by calling [`Engine::attach()`]. It hands the engine:
//!
//! * a [`RegisterWindow`] (usually a [`MmioWindow`]) through which all
//!   register traffic flows,
//! * a [`DmaAllocator`] that hands out coherent memory (for example a
//!   [`RegionAllocator`] over a reserved memory carve-out),
//! * a [`futures::task::Spawn`] implementation used to run the background
//!   completion task, and
//! * the [`ProxySettings`] to use.
//!
//! Attaching resets and then halts both channels.
//!
//! ## Transfers
//!
//! A transfer is driven by two commands:
//!
//! 1. [`Session::start_transfer()`] acquires the engine-wide arbitration lock,
//!    programs both channels, kicks off the transmit side and waits until the
//!    transmit channel reports idle. It then spawns the completion task and
//!    hands the lock *to that task*. The caller does not wait for the receive
//!    side.
//! 2. [`Session::wait_receive()`] waits for the completion task to observe
//!    the receive channel going idle, and then stops the task.
//!
//! Because the arbitration lock is only released by the completion task, no
//! two channel sequences ever interleave, even when many sessions start
//! transfers at once.
//!
//! ## Hazards
//!
//! The engine is polled, not interrupt driven. With the default
//! [`PollPolicy::UNBOUNDED`], an engine that never raises its idle bit hangs
//! the transmit wait (and therefore `start_transfer`), or wedges the
//! completion task forever. A bounded [`PollPolicy`] turns both cases into
//! [`Error::Unresponsive`].
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod buf;
pub mod channel;
pub mod command;
pub mod comms;
pub mod engine;
pub mod error;
pub mod poll;
pub mod regs;
pub mod session;
pub mod settings;
mod synchronizer;

#[cfg(test)]
pub(crate) mod test_util;

pub use self::{
    buf::{AllocError, BusAddr, CoherentRegion, DmaAllocator, Mapping, RegionAllocator},
    channel::AxiDma,
    command::Command,
    engine::Engine,
    error::Error,
    poll::PollPolicy,
    regs::{Channel, MmioWindow, RegisterWindow},
    session::{Session, SessionId},
    settings::ProxySettings,
};
