use alloc::sync::Arc;
use core::mem;

use dataview::{Pod, PodMethods as _};

use crate::{
    device::StorageDevice,
    error::StorageError,
    node::DeviceNode,
    param::{MBR_SIGNATURE, MBR_SIGNATURE_OFFSET, MBR_TABLE_OFFSET, SECTOR_SIZE},
    platform::Platform,
    registry::Registry,
};

/// One 16-byte entry of the MBR partition table.
#[derive(Clone, Copy, Pod)]
#[repr(C)]
pub struct MbrPartition {
    pub boot_indicator: u8,
    pub chs_first: [u8; 3],
    /// Partition type; 0 marks the entry empty.
    pub system_id: u8,
    pub chs_last: [u8; 3],
    /// First sector, little-endian.
    pub lba_start: u32,
    /// Sector count, little-endian.
    pub num_sectors: u32,
}

impl MbrPartition {
    /// Byte offset of the partition on the device.
    pub fn byte_offset(&self) -> u64 {
        u64::from(u32::from_le(self.lba_start)) * SECTOR_SIZE
    }

    /// Partition size in bytes.
    pub fn byte_len(&self) -> u64 {
        u64::from(u32::from_le(self.num_sectors)) * SECTOR_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.system_id == 0
    }
}

/// Re-reads the MBR and republishes the partition nodes.
///
/// Runs when the master handle closes; no sub-device can be open at that
/// point, so nothing observes the node turnover. A missing table, a bad
/// signature or a read failure leaves the device with only its master node.
pub(crate) fn reload<P: Platform>(registry: &Registry<P>, dev: &Arc<StorageDevice<P>>) {
    let num_subs = {
        let mut state = dev.lock_state();
        mem::replace(&mut state.num_subs, 0)
    };
    registry.remove_partition_nodes(dev.letter(), num_subs);

    match read_table(dev) {
        Ok(Some(table)) => {
            let mut published = 0;
            for (slot, part) in table.iter().enumerate() {
                if part.is_empty() {
                    continue;
                }
                log::debug!(
                    "sd{}: partition {} at {:#x}, {} bytes",
                    dev.letter(),
                    published,
                    part.byte_offset(),
                    part.byte_len()
                );
                registry.publish(DeviceNode::partition(
                    Arc::clone(dev),
                    published,
                    slot,
                    part.byte_offset(),
                    part.byte_len(),
                ));
                published += 1;
            }
            dev.lock_state().num_subs = published;
        }
        Ok(None) => log::debug!("sd{}: no MBR signature", dev.letter()),
        Err(err) => log::debug!("sd{}: partition scan failed: {err}", dev.letter()),
    }
}

/// Reads the partition table; `None` when the boot signature is missing.
fn read_table<P: Platform>(
    dev: &StorageDevice<P>,
) -> Result<Option<[MbrPartition; 4]>, StorageError> {
    let mut table = <[MbrPartition; 4]>::zeroed();
    dev.read(MBR_TABLE_OFFSET, table.as_bytes_mut())?;

    let mut sig = [0_u8; 2];
    dev.read(MBR_SIGNATURE_OFFSET, &mut sig)?;
    if u16::from_le_bytes(sig) != MBR_SIGNATURE {
        return Ok(None);
    }
    Ok(Some(table))
}
