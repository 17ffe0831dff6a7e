use alloc::sync::Arc;
use core::fmt::Write as _;

use arrayvec::ArrayString;

use crate::{
    command::{Command, Completion},
    device::{DeviceFlags, DeviceParams, MASTER_OPEN, StorageDevice},
    error::StorageError,
    partition,
    platform::Platform,
    registry::Registry,
};

/// Devfs name of a device node: `sd<letter>` or `sd<letter><index>`.
pub type NodeName = ArrayString<8>;

/// A published device node: the whole disk or one partition of it.
pub struct DeviceNode<P: Platform> {
    dev: Arc<StorageDevice<P>>,
    /// Base byte offset into the device.
    base: u64,
    /// Node-visible size in bytes; 0 means the whole device.
    size: u64,
    /// MBR slot index; `None` for the master node.
    part_index: Option<usize>,
    name: NodeName,
}

impl<P: Platform> DeviceNode<P> {
    pub(crate) fn master(dev: Arc<StorageDevice<P>>) -> Arc<Self> {
        let mut name = NodeName::new();
        write!(name, "sd{}", dev.letter()).unwrap();
        let size = dev.total_size();
        Arc::new(Self {
            dev,
            base: 0,
            size,
            part_index: None,
            name,
        })
    }

    pub(crate) fn partition(
        dev: Arc<StorageDevice<P>>,
        sub_index: usize,
        slot: usize,
        base: u64,
        size: u64,
    ) -> Arc<Self> {
        let mut name = NodeName::new();
        write!(name, "sd{}{}", dev.letter(), sub_index).unwrap();
        Arc::new(Self {
            dev,
            base,
            size,
            part_index: Some(slot),
            name,
        })
    }

    /// Devfs name of this node.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn node_name(&self) -> NodeName {
        self.name
    }

    /// The backing device.
    pub fn device(&self) -> &Arc<StorageDevice<P>> {
        &self.dev
    }

    /// Node size: the partition size, the device size, or — for removable
    /// media — the size queried from the driver.
    pub fn size(&self) -> u64 {
        if self.size != 0 {
            self.size
        } else {
            self.dev.device_size()
        }
    }

    /// Flushes the backing device's dirty tracks.
    pub fn flush(&self) {
        self.dev.flush();
    }

    fn open_mask(&self) -> u64 {
        match self.part_index {
            None => MASTER_OPEN,
            Some(slot) => 1 << slot,
        }
    }

    /// Claims this node's slot in the device's open mask.
    ///
    /// Opening the master excludes every partition and vice versa; each
    /// partition also excludes itself.
    fn try_open(&self) -> Result<(), StorageError> {
        let mut state = self.dev.lock_state();
        if state.flags.contains(DeviceFlags::HANGUP) {
            return Err(StorageError::NoDevice);
        }
        match self.part_index {
            None => {
                if state.open_parts != 0 {
                    return Err(StorageError::Busy);
                }
                state.open_parts = MASTER_OPEN;
            }
            Some(slot) => {
                let mask = 1_u64 << slot;
                if state.open_parts & (MASTER_OPEN | mask) != 0 {
                    return Err(StorageError::Busy);
                }
                state.open_parts |= mask;
            }
        }
        Ok(())
    }
}

/// An open handle to a device node.
///
/// Dropping the handle closes it: the device is flushed, the open-mask slot
/// is released, and closing the master re-reads the partition table.
pub struct NodeHandle<'r, P: Platform> {
    registry: &'r Registry<P>,
    node: Arc<DeviceNode<P>>,
}

impl<'r, P: Platform> NodeHandle<'r, P> {
    pub(crate) fn open(
        registry: &'r Registry<P>,
        node: Arc<DeviceNode<P>>,
    ) -> Result<Self, StorageError> {
        node.try_open()?;
        Ok(Self { registry, node })
    }

    /// The node this handle was opened from.
    pub fn node(&self) -> &Arc<DeviceNode<P>> {
        &self.node
    }

    /// Reads at `offset` within the handle, clamped to the node size.
    ///
    /// A short count means an error interrupted the transfer; reading at or
    /// past the end returns 0.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let Some(len) = self.clamp(buf.len(), offset) else {
            return Ok(0);
        };
        self.node.dev.read(self.node.base + offset, &mut buf[..len])
    }

    /// Writes at `offset` within the handle, clamped to the node size.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, StorageError> {
        let Some(len) = self.clamp(buf.len(), offset) else {
            return Ok(0);
        };
        self.node.dev.write(self.node.base + offset, &buf[..len])
    }

    fn clamp(&self, len: usize, offset: u64) -> Option<usize> {
        if self.node.size == 0 {
            return Some(len);
        }
        if offset >= self.node.size {
            return None;
        }
        Some(u64::min(len as u64, self.node.size - offset) as usize)
    }

    /// Flushes the backing device.
    pub fn flush(&self) {
        self.node.flush();
    }

    /// Handle-visible size in bytes.
    pub fn size(&self) -> u64 {
        self.node.size()
    }

    /// The `SDI_IDENTITY` ioctl: device flags, block size and the
    /// handle-visible size.
    pub fn identity(&self) -> DeviceParams {
        DeviceParams {
            flags: self.node.dev.flags(),
            block_size: self.node.dev.block_size(),
            total_size: self.node.size,
        }
    }

    /// The `SDI_EJECT` ioctl. Only removable media (driver-reported size)
    /// can be ejected; the command is queued and waited for.
    pub fn eject(&self) -> Result<(), StorageError> {
        if self.node.dev.total_size() != 0 {
            return Err(StorageError::NotRemovable);
        }
        let completion = Arc::new(Completion::new());
        self.node.dev.push(Command::eject(Arc::clone(&completion)));
        let _ = completion.wait();
        Ok(())
    }
}

impl<P: Platform> Drop for NodeHandle<'_, P> {
    fn drop(&mut self) {
        self.node.flush();

        let mut state = self.node.dev.lock_state();
        state.open_parts &= !self.node.open_mask();
        drop(state);

        // Closing the master is the only point at which no partition can be
        // open, so the partition table is re-read here.
        if self.node.part_index.is_none() {
            partition::reload(self.registry, &self.node.dev);
        }
    }
}
