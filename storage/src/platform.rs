use frame_alloc::RetrieveRunAllocator;
use track_cache::TRACK_SIZE;

/// Kernel services the storage layer builds on.
///
/// The storage layer itself is platform-neutral; the embedding kernel picks
/// the lock and semaphore implementations, the source of track frames and
/// the way kernel threads are created.
pub trait Platform: 'static {
    /// Mutex type used for the per-device and registry locks.
    type Mutex<T: Send>: sync_api::Mutex<Data = T> + Send + Sync;

    /// Semaphore type used for command completion, the command queue and
    /// the flusher timer.
    type Semaphore: sync_api::Semaphore + Send + Sync;

    /// Source of 32 KiB track frame runs.
    type Frames: RetrieveRunAllocator<TRACK_SIZE> + 'static;

    /// Spawns a detached kernel thread.
    fn spawn(name: &str, f: impl FnOnce() + Send + 'static);
}
