use alloc::{collections::BTreeMap, sync::Arc};
use core::{
    array,
    fmt::{self, Write as _},
    sync::atomic::{AtomicU32, Ordering},
};

use sync_api::Mutex;

use crate::{
    device::{DeviceFlags, DeviceParams, StorageDevice},
    error::StorageError,
    node::{DeviceNode, NodeHandle, NodeName},
    param::MAX_DRIVES,
    platform::Platform,
};

/// A drive letter, `a` through `z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveLetter(u8);

impl DriveLetter {
    fn from_index(index: usize) -> Self {
        Self(b'a' + index as u8)
    }

    fn index(self) -> usize {
        usize::from(self.0 - b'a')
    }

    /// The letter as a character.
    pub fn as_char(self) -> char {
        char::from(self.0)
    }
}

impl fmt::Display for DriveLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// The process-wide device registry: the drive-letter bitmap, the
/// letter-indexed device table and the published device nodes.
pub struct Registry<P: Platform> {
    letters: AtomicU32,
    devices: P::Mutex<[Option<Arc<StorageDevice<P>>>; MAX_DRIVES]>,
    nodes: P::Mutex<BTreeMap<NodeName, Arc<DeviceNode<P>>>>,
}

impl<P: Platform> Default for Registry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> Registry<P> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            letters: AtomicU32::new(0),
            devices: Mutex::new(array::from_fn(|_| None)),
            nodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Test-and-sets the lowest free letter. A freed letter is immediately
    /// reusable.
    fn alloc_letter(&self) -> Option<DriveLetter> {
        loop {
            let current = self.letters.load(Ordering::Acquire);
            let free = !current & ((1 << MAX_DRIVES) - 1);
            if free == 0 {
                return None;
            }
            let index = free.trailing_zeros();
            if self
                .letters
                .compare_exchange(
                    current,
                    current | 1 << index,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(DriveLetter::from_index(index as usize));
            }
        }
    }

    fn free_letter(&self, letter: DriveLetter) {
        self.letters
            .fetch_and(!(1 << letter.index()), Ordering::AcqRel);
    }

    /// Registers a new device: allocates a drive letter, starts its flusher
    /// thread and publishes the `sd<letter>` master node.
    ///
    /// The returned reference is the driver's; the driver keeps it until
    /// after hangup, once its queue has drained.
    pub fn register(&self, params: &DeviceParams) -> Result<Arc<StorageDevice<P>>, StorageError> {
        let letter = self.alloc_letter().ok_or(StorageError::NoFreeLetter)?;
        let dev = StorageDevice::new(letter, params);

        self.publish(DeviceNode::master(Arc::clone(&dev)));
        self.devices.lock()[letter.index()] = Some(Arc::clone(&dev));

        log::info!("sd{letter}: registered, {} bytes", params.total_size);
        Ok(dev)
    }

    /// Looks up a node by its devfs name.
    pub fn lookup(&self, name: &str) -> Option<Arc<DeviceNode<P>>> {
        self.nodes.lock().get(name).cloned()
    }

    /// Opens a node by name, enforcing the master/partition exclusion.
    pub fn open(&self, name: &str) -> Result<NodeHandle<'_, P>, StorageError> {
        let node = self.lookup(name).ok_or(StorageError::NoDevice)?;
        NodeHandle::open(self, node)
    }

    pub(crate) fn publish(&self, node: Arc<DeviceNode<P>>) {
        let previous = self.nodes.lock().insert(node.node_name(), node);
        debug_assert!(previous.is_none(), "device node name collision");
    }

    pub(crate) fn remove_partition_nodes(&self, letter: DriveLetter, count: usize) {
        let mut nodes = self.nodes.lock();
        for index in 0..count {
            let mut name = NodeName::new();
            write!(name, "sd{letter}{index}").unwrap();
            nodes.remove(&name);
        }
    }

    /// Flushes every registered device.
    pub fn sync(&self) {
        let devices = self.devices.lock();
        for dev in devices.iter().flatten() {
            dev.flush();
        }
    }

    /// Releases one cached track from the first device able to give one up.
    ///
    /// Called by the memory reclaimer under pressure; returns whether a
    /// track's frames were freed.
    pub fn free_memory(&self) -> bool {
        let devices = self.devices.lock();
        devices.iter().flatten().any(|dev| dev.evict_one())
    }

    /// Takes a device out of service after the driver reported it gone.
    ///
    /// Every node is unpublished, the letter is recycled and the flusher is
    /// told to exit. The command queue keeps draining until the driver
    /// drops its reference; all later I/O fails with `NoDevice`.
    pub fn hangup(&self, dev: &Arc<StorageDevice<P>>) {
        let letter = dev.letter();
        let num_subs = {
            let mut state = dev.lock_state();
            state.flags |= DeviceFlags::HANGUP;
            core::mem::replace(&mut state.num_subs, 0)
        };

        {
            let mut nodes = self.nodes.lock();
            let mut name = NodeName::new();
            write!(name, "sd{letter}").unwrap();
            nodes.remove(&name);
            for index in 0..num_subs {
                let mut name = NodeName::new();
                write!(name, "sd{letter}{index}").unwrap();
                nodes.remove(&name);
            }
        }

        // The table slot must be clear before the letter can be handed out
        // again.
        self.devices.lock()[letter.index()] = None;
        self.free_letter(letter);

        dev.wake_flusher();
        log::info!("sd{letter}: hangup");
    }
}
