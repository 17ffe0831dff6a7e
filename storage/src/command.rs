use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use sync_api::{Mutex, Semaphore};

use crate::{TrackBuf, platform::Platform};

/// What a queued command asks the driver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CommandKind {
    /// Fill the command's track buffer from the device.
    ReadTrack,
    /// Write the command's track buffer out to the device.
    WriteTrack,
    /// Report the device size in bytes.
    GetSize,
    /// Eject the medium.
    Eject,
    /// No operation; wakes a blocked driver thread up.
    Signal,
}

/// One request record, consumed by the device driver.
///
/// The queue owns the record until the driver pops it; completing it
/// consumes the record, hands the track buffer back and wakes the waiter.
pub struct Command<P: Platform> {
    kind: CommandKind,
    pos: u64,
    buf: Option<TrackBuf<P>>,
    completion: Option<Arc<Completion<P>>>,
}

impl<P: Platform> Command<P> {
    pub(crate) fn read_track(pos: u64, buf: TrackBuf<P>, completion: Arc<Completion<P>>) -> Self {
        Self {
            kind: CommandKind::ReadTrack,
            pos,
            buf: Some(buf),
            completion: Some(completion),
        }
    }

    pub(crate) fn write_track(pos: u64, buf: TrackBuf<P>, completion: Arc<Completion<P>>) -> Self {
        Self {
            kind: CommandKind::WriteTrack,
            pos,
            buf: Some(buf),
            completion: Some(completion),
        }
    }

    pub(crate) fn get_size(completion: Arc<Completion<P>>) -> Self {
        Self {
            kind: CommandKind::GetSize,
            pos: 0,
            buf: None,
            completion: Some(completion),
        }
    }

    pub(crate) fn eject(completion: Arc<Completion<P>>) -> Self {
        Self {
            kind: CommandKind::Eject,
            pos: 0,
            buf: None,
            completion: Some(completion),
        }
    }

    pub(crate) fn signal() -> Self {
        Self {
            kind: CommandKind::Signal,
            pos: 0,
            buf: None,
            completion: None,
        }
    }

    /// The operation requested.
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Device byte offset of the track; track-aligned.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// The 32 KiB transfer buffer of a track command.
    pub fn data(&self) -> Option<&[u8]> {
        self.buf.as_deref()
    }

    /// Mutable access to the transfer buffer of a track read.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.buf.as_deref_mut()
    }

    /// Completes the command with the driver status; 0 means success.
    ///
    /// Hands the track buffer back and wakes the waiter, if any. Records
    /// without a completion channel (`Signal`) are simply dropped.
    pub fn complete(self, status: i32) {
        if let Some(completion) = self.completion {
            completion.status.store(status, Ordering::Release);
            if let Some(buf) = self.buf {
                *completion.buf.lock() = Some(buf);
            }
            completion.sem.post();
        }
    }

    /// Completes a `GetSize` command with the reported size in bytes.
    pub fn complete_with_size(self, size: u64) {
        if let Some(completion) = &self.completion {
            completion.size.store(size, Ordering::Release);
        }
        self.complete(0);
    }
}

/// Completion channel of one queued command.
pub(crate) struct Completion<P: Platform> {
    sem: P::Semaphore,
    status: AtomicI32,
    size: AtomicU64,
    buf: P::Mutex<Option<TrackBuf<P>>>,
}

impl<P: Platform> Completion<P> {
    pub(crate) fn new() -> Self {
        Self {
            sem: Semaphore::new(0),
            status: AtomicI32::new(0),
            size: AtomicU64::new(0),
            buf: Mutex::new(None),
        }
    }

    /// Blocks until the driver posts completion, then returns the status.
    pub(crate) fn wait(&self) -> i32 {
        self.sem.wait();
        self.status.load(Ordering::Acquire)
    }

    /// Size reported by a completed `GetSize` command.
    pub(crate) fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Takes back the track buffer returned by the driver.
    pub(crate) fn take_buf(&self) -> Option<TrackBuf<P>> {
        self.buf.lock().take()
    }
}
