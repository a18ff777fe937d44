//! Read-disturb mitigation for MLC devices.
//!
//! Grounded on `FTL_Read_Disturbance` (declared in `flash.h`, defined in
//! `flash.c`). Each physical block tracks a read counter; once it reaches
//! `max_read_counter`, the block's data is migrated to a less-read spare
//! before the counter can corrupt it further.

use crate::block_table::BlockTable;
use crate::config::FtlConfig;
use crate::error::{FtlError, Result};
use crate::lld::LldPort;
use crate::replace::replace_one_block;

/// Record a read against `logical`'s current physical block, returning
/// whether it has now crossed `max_read_counter` and needs migration.
pub fn note_read(table: &mut BlockTable, config: &FtlConfig, logical: u32) -> bool {
    if !table.has_read_counters() {
        return false;
    }
    let next = table.read_counter(logical).saturating_add(1);
    table.set_read_counter(logical, next);
    next >= config.max_read_counter
}

/// Migrate `logical`'s data to the spare block with the lowest read
/// counter, copying the full block through `scratch` (must be at least
/// `pages_per_block * page_data_size` bytes).
pub fn migrate<L: LldPort>(
    table: &mut BlockTable,
    config: &FtlConfig,
    logical: u32,
    pages_per_block: u16,
    page_data_size: u16,
    scratch: &mut [u8],
    lld: &mut L,
) -> Result<()> {
    let spare_count = table.iter().filter(|(_, s)| s.is_spare()).count();
    if (spare_count as u16) < config.num_free_blocks_gate {
        return Err(FtlError::NoSpace);
    }

    let target = table
        .iter()
        .filter(|(l, s)| s.is_spare() && *l != logical)
        .min_by_key(|(l, _)| table.read_counter(*l))
        .map(|(l, _)| l)
        .ok_or(FtlError::NoSpace)?;

    let old_phys = table.state(logical).phys();
    let new_phys = table.state(target).phys();

    let bytes = pages_per_block as usize * page_data_size as usize;
    let buf = &mut scratch[..bytes];
    lld.read_page_main(old_phys, 0, pages_per_block, buf)
        .map_err(|_| FtlError::Io(format!("read-disturb migration source read failed at {old_phys}")))?;

    lld.write_page_main(new_phys, 0, pages_per_block, buf)
        .map_err(|_| FtlError::Io(format!("read-disturb migration write failed at {new_phys}")))?;

    replace_one_block(table, logical, target);
    table.set_read_counter(logical, 0);
    log::debug!("read_disturb: migrated logical {logical} from phys {old_phys} to {new_phys}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_table::BlockState;
    use crate::sim::MemoryLld;

    #[test]
    fn note_read_ignores_slc_devices() {
        let mut table = BlockTable::new_identity(2, 0, false);
        assert!(!note_read(&mut table, &FtlConfig::default(), 0));
    }

    #[test]
    fn note_read_flags_threshold_crossing() {
        let mut table = BlockTable::new_identity(2, 0, true);
        let cfg = crate::config::FtlConfigBuilder::new()
            .with_max_read_counter(3)
            .build(1)
            .unwrap();
        assert!(!note_read(&mut table, &cfg, 0));
        assert!(!note_read(&mut table, &cfg, 0));
        assert!(note_read(&mut table, &cfg, 0));
    }

    #[test]
    fn migrate_moves_data_to_least_read_spare() {
        let mut table = BlockTable::new_identity(4, 0, true);
        table.set_state(0, BlockState::Data(0));
        table.set_state(1, BlockState::Spare(1));
        table.set_read_counter(1, 5);
        table.set_state(2, BlockState::Spare(2));
        table.set_read_counter(2, 1);
        table.set_state(3, BlockState::Spare(3));
        table.set_read_counter(3, 9);

        let cfg = crate::config::FtlConfigBuilder::new()
            .with_num_free_blocks_gate(1)
            .build(4)
            .unwrap();
        let mut lld = MemoryLld::new_default(8);
        let page_data_size = lld.device_info().page_data_size;
        let mut scratch = vec![0u8; page_data_size as usize];
        migrate(&mut table, &cfg, 0, 1, page_data_size, &mut scratch, &mut lld).unwrap();

        assert_eq!(table.state(0).phys(), 2);
        assert!(table.state(2).is_discard() || table.state(2).phys() == 0);
    }
}
