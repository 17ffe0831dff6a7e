use alloc::{
    collections::VecDeque,
    sync::{Arc, Weak},
};
use core::ops::DerefMut;

use bitflags::bitflags;
use sync_api::{Mutex, SemWait, Semaphore};
use track_cache::{TrackCache, TrackIo, Tree};

use crate::{
    TrackBuf,
    command::{Command, Completion},
    error::StorageError,
    param::FLUSH_INTERVAL,
    platform::Platform,
    registry::DriveLetter,
};

bitflags! {
    /// Device flag bits. Driver-defined bits are carried through untouched;
    /// the storage layer owns only the hangup bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u32 {
        /// The driver reported the device gone; sticky.
        const HANGUP = 1 << 15;
    }
}

/// Parameters describing a device. Also the reply of the identity ioctl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceParams {
    /// Device flag bits.
    pub flags: DeviceFlags,
    /// Block size reported by the driver.
    pub block_size: usize,
    /// Total size in bytes; 0 means removable media whose size must be
    /// queried from the driver.
    pub total_size: u64,
}

/// Bit in the open mask marking the whole-disk node open.
pub(crate) const MASTER_OPEN: u64 = 1 << 63;

pub(crate) struct DeviceState<P: Platform> {
    pub(crate) flags: DeviceFlags,
    /// Bit `i` set while partition `i` is open; `MASTER_OPEN` while the
    /// whole-disk node is open.
    pub(crate) open_parts: u64,
    /// Number of published partition nodes.
    pub(crate) num_subs: usize,
    queue: VecDeque<Command<P>>,
}

/// One registered storage device: its command queue, its cache tree, flags
/// and open-partition accounting.
///
/// The device is reference-counted through `Arc`: the registry slot, each
/// published node, each open handle, the flusher thread and the driver all
/// hold one reference, so the device outlives whichever of them finishes
/// last.
pub struct StorageDevice<P: Platform> {
    letter: DriveLetter,
    block_size: usize,
    total_size: u64,
    state: P::Mutex<DeviceState<P>>,
    sem_commands: P::Semaphore,
    cache: TrackCache<QueueIo<P>, P::Mutex<Tree<P::Frames>>>,
    sem_flush: P::Semaphore,
}

impl<P: Platform> StorageDevice<P> {
    pub(crate) fn new(letter: DriveLetter, params: &DeviceParams) -> Arc<Self> {
        let dev = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            letter,
            block_size: params.block_size,
            total_size: params.total_size,
            state: Mutex::new(DeviceState {
                flags: params.flags,
                open_parts: 0,
                num_subs: 0,
                queue: VecDeque::new(),
            }),
            sem_commands: Semaphore::new(0),
            cache: TrackCache::new(QueueIo { dev: weak.clone() }),
            sem_flush: Semaphore::new(0),
        });

        let flusher = Arc::clone(&dev);
        P::spawn("sd-flush", move || flusher_main(&flusher));
        dev
    }

    /// Drive letter the device is registered under.
    pub fn letter(&self) -> DriveLetter {
        self.letter
    }

    /// Block size reported by the driver.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total size in bytes; 0 for removable media.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Current device flags.
    pub fn flags(&self) -> DeviceFlags {
        self.state.lock().flags
    }

    fn hung_up(&self) -> bool {
        self.state.lock().flags.contains(DeviceFlags::HANGUP)
    }

    /// Reads through the track cache.
    ///
    /// Returns the number of bytes read; a short count means an error
    /// interrupted the transfer and will surface on the next call.
    pub fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        if self.hung_up() {
            return Err(StorageError::NoDevice);
        }
        self.cache.read(pos, buf).map_err(StorageError::from)
    }

    /// Writes through the track cache; same partial-progress semantics as
    /// [`read`](Self::read).
    pub fn write(&self, pos: u64, buf: &[u8]) -> Result<usize, StorageError> {
        if self.hung_up() {
            return Err(StorageError::NoDevice);
        }
        self.cache.write(pos, buf).map_err(StorageError::from)
    }

    /// Writes every dirty cached track back to the device.
    pub fn flush(&self) {
        self.cache.flush();
    }

    pub(crate) fn evict_one(&self) -> bool {
        self.cache.evict_one()
    }

    /// Returns the device size, asking the driver when it is not known.
    pub fn device_size(&self) -> u64 {
        if self.total_size != 0 {
            return self.total_size;
        }
        let completion = Arc::new(Completion::new());
        self.push(Command::get_size(Arc::clone(&completion)));
        completion.wait();
        completion.size()
    }

    /// Appends a command to the queue and wakes the driver.
    pub(crate) fn push(&self, cmd: Command<P>) {
        log::trace!(
            "sd{}: queueing {} command at {:#x}",
            self.letter,
            cmd.kind(),
            cmd.pos()
        );
        self.state.lock().queue.push_back(cmd);
        self.sem_commands.post();
    }

    /// Blocks until a command is queued, then unlinks and returns it.
    ///
    /// This is the driver side of the queue; records come out in submission
    /// order. The queue keeps draining after hangup, until the driver drops
    /// its device reference.
    pub fn next_command(&self) -> Command<P> {
        self.sem_commands.wait();
        self.state
            .lock()
            .queue
            .pop_front()
            .expect("command semaphore posted with an empty queue")
    }

    /// Enqueues a no-op command so a blocked driver thread wakes up.
    pub fn signal(&self) {
        self.push(Command::signal());
    }

    pub(crate) fn lock_state(&self) -> impl DerefMut<Target = DeviceState<P>> + '_ {
        self.state.lock()
    }

    /// Tells the flusher thread to exit; posted once, at hangup.
    pub(crate) fn wake_flusher(&self) {
        self.sem_flush.post();
    }
}

/// Per-device flusher thread body. The thread holds one device reference,
/// so the device survives until it observes the exit signal.
fn flusher_main<P: Platform>(dev: &Arc<StorageDevice<P>>) {
    loop {
        match dev.sem_flush.wait_timeout(FLUSH_INTERVAL) {
            SemWait::TimedOut => {
                log::trace!("sd{}: periodic flush", dev.letter());
                dev.flush();
            }
            SemWait::Signaled => break,
        }
    }
    log::debug!("sd{}: flusher exiting", dev.letter());
}

/// Turns the cache's track I/O into queued driver commands.
pub(crate) struct QueueIo<P: Platform> {
    dev: Weak<StorageDevice<P>>,
}

impl<P: Platform> TrackIo<TrackBuf<P>> for QueueIo<P> {
    type Error = StorageError;

    fn read_track(&self, pos: u64, buf: TrackBuf<P>) -> Result<TrackBuf<P>, StorageError> {
        let Some(dev) = self.dev.upgrade() else {
            return Err(StorageError::NoDevice);
        };
        let completion = Arc::new(Completion::new());
        dev.push(Command::read_track(pos, buf, Arc::clone(&completion)));
        let status = completion.wait();
        let buf = completion
            .take_buf()
            .expect("driver completed a track command without returning the buffer");
        if status != 0 {
            return Err(StorageError::Io);
        }
        Ok(buf)
    }

    fn write_track(
        &self,
        pos: u64,
        buf: TrackBuf<P>,
    ) -> Result<TrackBuf<P>, (TrackBuf<P>, StorageError)> {
        let Some(dev) = self.dev.upgrade() else {
            return Err((buf, StorageError::NoDevice));
        };
        let completion = Arc::new(Completion::new());
        dev.push(Command::write_track(pos, buf, Arc::clone(&completion)));
        let status = completion.wait();
        let buf = completion
            .take_buf()
            .expect("driver completed a track command without returning the buffer");
        if status != 0 {
            return Err((buf, StorageError::Io));
        }
        Ok(buf)
    }
}
