//! Garbage collection: erasing superseded data blocks and retired
//! block-table blocks back to `Spare`.
//!
//! Grounded on `FTL_Garbage_Collection`/`FTL_BT_Garbage_Collection`. The
//! original guards re-entrancy with module-scope `GC_Called`/
//! `BT_GC_Called` globals; here that's a `Cell<bool>` field on [`crate::Ftl`]
//! (see `lib.rs`), so this module only implements the scan-and-erase logic
//! and leaves the guard to the caller.

use crate::block_table::{BlockState, BlockTable};
use crate::error::Result;
use crate::lld::LldPort;

/// Budget reserved, in `cmd-dma` mode, for the worst-case command expansion
/// of one BT-GC iteration (erase + rewrite of one BT image's worth of
/// pages). Carried forward from the original driver's batch-size
/// accounting (`FTLCommandCount + 28 < 256`) without re-derivation, since
/// the original's per-command cost model isn't recoverable from source
/// alone.
#[cfg(feature = "cmd-dma")]
pub const CMD_DMA_GC_RESERVE: u16 = 28;

/// Erase every `Discard` block that is not also a registered block-table
/// block (those are owned by [`bt_garbage_collection`]), turning it back
/// into `Spare`. Returns the number of blocks erased.
pub fn garbage_collection<L: LldPort>(
    table: &mut BlockTable,
    bt_physical_blocks: &[u32],
    lld: &mut L,
) -> Result<u32> {
    let mut erased = 0u32;
    let logicals: Vec<u32> = table
        .iter()
        .filter(|(_, s)| s.is_discard())
        .map(|(l, _)| l)
        .collect();

    for logical in logicals {
        let phys = table.state(logical).phys();
        if bt_physical_blocks.contains(&phys) {
            continue;
        }
        match lld.erase_block(phys) {
            Ok(()) => {
                table.set_state(logical, BlockState::Spare(phys));
                table.set_wear(logical, table.wear(logical).saturating_add(1));
                table.set_read_counter(logical, 0);
                erased += 1;
                log::debug!("gc: erased logical {logical} (phys {phys}) back to spare");
            }
            Err(e) => {
                log::warn!("gc: erase of phys {phys} failed, marking bad: {e}");
                table.set_state(logical, BlockState::Bad(phys));
            }
        }
    }
    Ok(erased)
}

/// Erase any block-table registry entry whose logical slot is currently
/// `Discard` (its BT image has been superseded by a newer generation),
/// starting the scan from `start_index` in `registry` and wrapping once.
/// Returns the updated registry with erased entries removed, plus the
/// index to resume from next time.
pub fn bt_garbage_collection<L: LldPort>(
    table: &mut BlockTable,
    bt_slot: u32,
    registry: &mut Vec<u32>,
    start_index: usize,
    lld: &mut L,
) -> Result<u32> {
    if registry.is_empty() {
        return Ok(0);
    }
    let mut erased = 0u32;
    let n = registry.len();
    let mut to_remove = Vec::new();

    for step in 0..n {
        let idx = (start_index + step) % n;
        let phys = registry[idx];
        let state = table.state(bt_slot);
        if state.phys() == phys {
            // This is the live BT block; never erase it.
            continue;
        }
        if let Some(logical) = table.logical_for_phys(phys) {
            if table.state(logical).is_discard() {
                match lld.erase_block(phys) {
                    Ok(()) => {
                        table.set_state(logical, BlockState::Spare(phys));
                        erased += 1;
                        to_remove.push(idx);
                        log::debug!("bt_gc: retired bt block phys {phys}");
                    }
                    Err(e) => {
                        log::warn!("bt_gc: erase of bt block phys {phys} failed: {e}");
                        table.set_state(logical, BlockState::Bad(phys));
                        to_remove.push(idx);
                    }
                }
            }
        }
    }

    to_remove.sort_unstable_by(|a, b| b.cmp(a));
    for idx in to_remove {
        registry.remove(idx);
    }
    Ok(erased)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryLld;

    fn lld_for(blocks: u32) -> MemoryLld {
        MemoryLld::new_default(blocks)
    }

    #[test]
    fn garbage_collection_reclaims_discard_blocks() {
        let mut table = BlockTable::new_identity(4, 0, false);
        table.set_state(0, BlockState::Discard(0));
        let mut lld = lld_for(8);
        let erased = garbage_collection(&mut table, &[], &mut lld).unwrap();
        assert_eq!(erased, 1);
        assert!(table.state(0).is_spare());
    }

    #[test]
    fn garbage_collection_skips_bt_blocks() {
        let mut table = BlockTable::new_identity(4, 0, false);
        table.set_state(0, BlockState::Discard(0));
        let mut lld = lld_for(8);
        let erased = garbage_collection(&mut table, &[0], &mut lld).unwrap();
        assert_eq!(erased, 0);
        assert!(table.state(0).is_discard());
    }

    #[test]
    fn bt_garbage_collection_retires_superseded_entries() {
        let mut table = BlockTable::new_identity(4, 0, false);
        table.set_state(1, BlockState::Discard(1));
        let mut registry = vec![0u32, 1u32];
        let mut lld = lld_for(8);
        let erased =
            bt_garbage_collection(&mut table, 0, &mut registry, 0, &mut lld).unwrap();
        assert_eq!(erased, 1);
        assert_eq!(registry, vec![0]);
    }
}
