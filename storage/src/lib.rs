//! Block storage layer between the device drivers and the filesystem.
//!
//! Drivers register a [`StorageDevice`] with the [`Registry`] and consume
//! request records from its per-device FIFO command queue. All read and
//! write traffic goes through a lazy write-back cache of 32 KiB tracks (see
//! the `track_cache` crate); dirty tracks flow back to the driver from a
//! periodic per-device flusher thread and from the evictor that runs under
//! memory pressure. The registry also parses MBR partition tables and
//! publishes one device node per partition next to the whole-disk node.
//!
//! Kernel primitives (mutexes, semaphores, thread creation, frame
//! allocation) are supplied by the embedder through the [`Platform`] trait.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod command;
mod device;
mod error;
mod node;
pub mod param;
mod partition;
mod platform;
mod registry;


pub use self::{
    command::{Command, CommandKind},
    device::{DeviceFlags, DeviceParams, StorageDevice},
    error::StorageError,
    node::{DeviceNode, NodeHandle, NodeName},
    partition::MbrPartition,
    platform::Platform,
    registry::{DriveLetter, Registry},
};

/// A 32 KiB track buffer, owned by the cache tree or by an in-flight
/// command.
pub(crate) type TrackBuf<P> = track_cache::TrackBuf<<P as Platform>::Frames>;
