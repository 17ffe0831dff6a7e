//! Write-back cache of device tracks, keyed by byte offset.
//!
//! Cached tracks are stored in a radix tree with a 128-way fan-out: six
//! interior levels plus one leaf level whose entries own 32 KiB tracks, so
//! the full 2^64-byte device range is addressable. Every entry carries an
//! 8-bit saturating usage counter (bumped on each hit, consulted by the
//! evictor) and a dirty bit that is propagated up to the root on writes
//! (walked by the flusher).
//!
//! The tree mutex is held for the whole duration of every operation,
//! including the wait for a track read. I/O to a single device is therefore
//! serialized; I/O to different devices is independent.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use core::{array, mem};

use frame_alloc::{RetrieveRunAllocator, RunBox};
use sync_api::Mutex;

/// Size of one cached track in bytes: eight contiguous 4 KiB frames.
pub const TRACK_SIZE: usize = 0x8000;

/// Shift that converts a byte offset into a track number.
pub const TRACK_SHIFT: u32 = 15;

/// Fan-out of a single tree node.
const FAN_OUT: usize = 128;

/// Bits of the byte offset consumed per tree level.
const INDEX_BITS: u32 = 7;

/// Interior levels above the leaf level.
const INTERIOR_LEVELS: u32 = 6;

/// A track buffer: one owned run of contiguous frames.
pub type TrackBuf<A> = RunBox<A, TRACK_SIZE>;

/// Track-granular I/O to the underlying device.
pub trait TrackIo<B> {
    type Error;

    /// Fills `buf` with the track at track-aligned byte offset `pos`.
    ///
    /// On failure the buffer is consumed and its frames return to the
    /// allocator.
    fn read_track(&self, pos: u64, buf: B) -> Result<B, Self::Error>;

    /// Writes the track at track-aligned byte offset `pos` back to the
    /// device. The buffer is handed back in both cases so that a failed
    /// write-back stays cached.
    fn write_track(&self, pos: u64, buf: B) -> Result<B, (B, Self::Error)>;
}

/// Failure of a cache operation that made no progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CacheError<E> {
    /// No run of frames was available for a new track.
    #[error("no track frames available")]
    OutOfMemory,
    /// The driver reported a track I/O failure.
    #[error("track I/O failed")]
    Io(E),
}

/// The cache tree. Exposed only so that embedders can name the mutex type
/// that guards it.
pub struct Tree<A>
where
    A: RetrieveRunAllocator<TRACK_SIZE>,
{
    root: Node<A>,
}

struct Node<A>
where
    A: RetrieveRunAllocator<TRACK_SIZE>,
{
    slots: [Slot<A>; FAN_OUT],
}

enum Slot<A>
where
    A: RetrieveRunAllocator<TRACK_SIZE>,
{
    Empty,
    Interior(Entry<Box<Node<A>>>),
    Leaf(Entry<TrackBuf<A>>),
}

/// One tree entry: the owned child plus its usage counter and dirty bit.
struct Entry<T> {
    child: T,
    usage: u8,
    dirty: bool,
}

impl<T> Entry<T> {
    fn new(child: T, dirty: bool) -> Self {
        Self {
            child,
            usage: 1,
            dirty,
        }
    }

    /// Registers a hit: bumps the saturating usage counter and, on a write,
    /// marks the entry dirty.
    fn touch(&mut self, write: bool) {
        self.usage = self.usage.saturating_add(1);
        if write {
            self.dirty = true;
        }
    }
}

impl<A> Node<A>
where
    A: RetrieveRunAllocator<TRACK_SIZE>,
{
    fn empty() -> Self {
        Self {
            slots: array::from_fn(|_| Slot::Empty),
        }
    }
}

/// Outcome of one eviction descent.
enum Evict {
    /// A track was released.
    Freed,
    /// The subtree holds no entries.
    Nothing,
    /// A dirty victim could not be written back; nothing was released.
    Failed,
}

enum Xfer<'a> {
    FromCache(&'a mut [u8]),
    ToCache(&'a [u8]),
}

impl Xfer<'_> {
    fn len(&self) -> usize {
        match self {
            Xfer::FromCache(buf) => buf.len(),
            Xfer::ToCache(buf) => buf.len(),
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, Xfer::ToCache(_))
    }
}

/// A write-back cache of device tracks.
pub struct TrackCache<Dev, TreeMutex> {
    dev: Dev,
    tree: TreeMutex,
}

impl<Dev, TreeMutex, A> TrackCache<Dev, TreeMutex>
where
    Dev: TrackIo<TrackBuf<A>>,
    TreeMutex: Mutex<Data = Tree<A>>,
    A: RetrieveRunAllocator<TRACK_SIZE>,
{
    /// Creates an empty cache in front of `dev`.
    pub fn new(dev: Dev) -> Self {
        Self {
            dev,
            tree: TreeMutex::new(Tree { root: Node::empty() }),
        }
    }

    /// Reads `buf.len()` bytes starting at byte offset `pos`.
    ///
    /// Returns the number of bytes read; a short count means an error
    /// interrupted a partially completed transfer and will be reported again
    /// by the next call. An error is returned only when nothing was read.
    pub fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize, CacheError<Dev::Error>> {
        self.transfer(pos, Xfer::FromCache(buf))
    }

    /// Writes `buf` starting at byte offset `pos`, marking the touched
    /// tracks and their whole tree path dirty.
    ///
    /// Partial-progress semantics are the same as for [`read`](Self::read).
    pub fn write(&self, pos: u64, buf: &[u8]) -> Result<usize, CacheError<Dev::Error>> {
        self.transfer(pos, Xfer::ToCache(buf))
    }

    fn transfer(&self, mut pos: u64, mut xfer: Xfer<'_>) -> Result<usize, CacheError<Dev::Error>> {
        let mut tree = self.tree.lock();
        let total = xfer.len();
        let mut done = 0;
        while done < total {
            let in_track = (pos % TRACK_SIZE as u64) as usize;
            let chunk = usize::min(TRACK_SIZE - in_track, total - done);
            let track_pos = pos & !(TRACK_SIZE as u64 - 1);
            let track = match self.load_track(&mut tree.root, track_pos, xfer.is_write()) {
                Ok(track) => track,
                Err(err) if done == 0 => return Err(err),
                Err(_) => break,
            };
            match &mut xfer {
                Xfer::FromCache(buf) => {
                    buf[done..done + chunk].copy_from_slice(&track[in_track..in_track + chunk]);
                }
                Xfer::ToCache(buf) => {
                    track[in_track..in_track + chunk].copy_from_slice(&buf[done..done + chunk]);
                }
            }
            done += chunk;
            pos += chunk as u64;
        }
        Ok(done)
    }

    /// Walks down to the leaf slot for `pos`, creating zeroed interior nodes
    /// on demand and updating usage counters and dirty bits along the path.
    fn walk<'t>(root: &'t mut Node<A>, pos: u64, write: bool) -> &'t mut Slot<A> {
        let mut node = root;
        for level in 0..INTERIOR_LEVELS {
            let slot = &mut node.slots[Self::interior_index(pos, level)];
            if matches!(slot, Slot::Empty) {
                *slot = Slot::Interior(Entry::new(Box::new(Node::empty()), write));
            } else if let Slot::Interior(entry) = slot {
                entry.touch(write);
            }
            match slot {
                Slot::Interior(entry) => node = &mut entry.child,
                _ => unreachable!("track entry above the leaf level"),
            }
        }
        &mut node.slots[Self::leaf_index(pos)]
    }

    /// Returns the cached track at track-aligned `pos`, loading it from the
    /// device if absent.
    fn load_track<'t>(
        &self,
        root: &'t mut Node<A>,
        track_pos: u64,
        write: bool,
    ) -> Result<&'t mut TrackBuf<A>, CacheError<Dev::Error>> {
        let slot = Self::walk(root, track_pos, write);
        let hit = matches!(slot, Slot::Leaf(_));
        if !hit {
            let buf = TrackBuf::try_new_zeroed().ok_or(CacheError::OutOfMemory)?;
            let buf = self.dev.read_track(track_pos, buf).map_err(CacheError::Io)?;
            *slot = Slot::Leaf(Entry::new(buf, write));
        }
        match slot {
            Slot::Leaf(entry) => {
                if hit {
                    entry.touch(write);
                }
                Ok(&mut entry.child)
            }
            _ => unreachable!("interior entry at the leaf level"),
        }
    }

    fn interior_index(pos: u64, level: u32) -> usize {
        ((pos >> (TRACK_SHIFT + INDEX_BITS * (INTERIOR_LEVELS - level))) & 0x7F) as usize
    }

    fn leaf_index(pos: u64) -> usize {
        ((pos >> TRACK_SHIFT) & 0x7F) as usize
    }

    /// Writes every dirty track back to the device.
    ///
    /// A failed write-back leaves the dirty bit set, so the next flush
    /// retries it. An interior dirty bit is cleared only once its whole
    /// subtree has flushed clean.
    pub fn flush(&self) {
        let mut tree = self.tree.lock();
        self.flush_node(&mut tree.root, 0);
    }

    fn flush_node(&self, node: &mut Node<A>, path: u64) -> bool {
        let mut clean = true;
        for (i, slot) in node.slots.iter_mut().enumerate() {
            let child_path = (path << INDEX_BITS) | i as u64;
            if matches!(&*slot, Slot::Leaf(entry) if entry.dirty) {
                let Slot::Leaf(mut entry) = mem::replace(slot, Slot::Empty) else {
                    unreachable!()
                };
                match self.dev.write_track(child_path << TRACK_SHIFT, entry.child) {
                    Ok(buf) => {
                        entry.child = buf;
                        entry.dirty = false;
                    }
                    Err((buf, _err)) => {
                        entry.child = buf;
                        clean = false;
                    }
                }
                *slot = Slot::Leaf(entry);
            } else if let Slot::Interior(entry) = slot {
                if entry.dirty {
                    if self.flush_node(&mut entry.child, child_path) {
                        entry.dirty = false;
                    } else {
                        clean = false;
                    }
                }
            }
        }
        clean
    }

    /// Releases the least-used cached track, writing it back first when
    /// dirty. Empty interior nodes found on the way down are freed.
    ///
    /// Returns `true` when one track (its eight frames) was released.
    pub fn evict_one(&self) -> bool {
        let mut tree = self.tree.lock();
        matches!(self.evict_node(&mut tree.root, 0), Evict::Freed)
    }

    fn evict_node(&self, node: &mut Node<A>, path: u64) -> Evict {
        loop {
            let mut lowest: Option<(usize, u8)> = None;
            for (i, slot) in node.slots.iter().enumerate() {
                let usage = match slot {
                    Slot::Empty => continue,
                    Slot::Interior(entry) => entry.usage,
                    Slot::Leaf(entry) => entry.usage,
                };
                if lowest.is_none_or(|(_, low)| usage < low) {
                    lowest = Some((i, usage));
                }
            }
            let Some((idx, _)) = lowest else {
                return Evict::Nothing;
            };

            let child_path = (path << INDEX_BITS) | idx as u64;
            let slot = &mut node.slots[idx];
            if matches!(&*slot, Slot::Leaf(_)) {
                let Slot::Leaf(entry) = mem::replace(slot, Slot::Empty) else {
                    unreachable!()
                };
                if !entry.dirty {
                    return Evict::Freed;
                }
                match self.dev.write_track(child_path << TRACK_SHIFT, entry.child) {
                    Ok(_buf) => return Evict::Freed,
                    Err((buf, _err)) => {
                        *slot = Slot::Leaf(Entry {
                            child: buf,
                            usage: entry.usage,
                            dirty: true,
                        });
                        return Evict::Failed;
                    }
                }
            } else {
                let Slot::Interior(entry) = slot else {
                    unreachable!()
                };
                match self.evict_node(&mut entry.child, child_path) {
                    Evict::Freed => return Evict::Freed,
                    Evict::Failed => return Evict::Failed,
                    // The subtree is empty: free the node and retry at this
                    // level.
                    Evict::Nothing => *slot = Slot::Empty,
                }
            }
        }
    }
}
