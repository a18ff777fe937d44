//! Block replacement and wear leveling.
//!
//! Grounded on `FTL_Replace_OneBlock`, `FTL_Replace_LWBlock`,
//! `FTL_Replace_MWBlock`, `FTL_Static_Wear_Leveling`, and
//! `FTL_Adjust_Relative_Erase_Count` in the original driver.

use crate::block_table::{BlockState, BlockTable};
use crate::config::FtlConfig;
use crate::error::{FtlError, Result};

/// Whether the caller should run garbage collection before retrying a
/// replacement, returned by [`replace_lw_block`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcHint {
    Pass,
    Fail,
}

/// Exchange `target`'s mapping with `spare`'s: `target` becomes `Data` at
/// the spare's physical block, and `spare`'s old physical block becomes
/// `Discard` (if `target` held live data) or keeps its prior state.
pub fn replace_one_block(table: &mut BlockTable, target: u32, spare: u32) {
    let spare_phys = table.state(spare).phys();
    let target_state = table.state(target);
    let target_phys = target_state.phys();

    table.set_state(target, BlockState::Data(spare_phys));
    table.set_wear(target, table.wear(spare));
    table.set_read_counter(target, 0);

    let new_spare_state = if target_state.is_data() {
        BlockState::Discard(target_phys)
    } else {
        target_state
    };
    table.set_state(spare, new_spare_state);
}

/// Replace `target`'s mapping with the least-worn spare block available.
/// If `target` is already `Spare`, simply promotes it (no copy needed).
pub fn replace_lw_block(
    table: &mut BlockTable,
    config: &FtlConfig,
    target: u32,
) -> Result<(u32, GcHint)> {
    if table.state(target).is_spare() {
        let phys = table.state(target).phys();
        table.set_state(target, BlockState::Data(phys));
        return Ok((phys, GcHint::Fail));
    }

    let mut discard_count = 0u32;
    let mut spare_count = 0u32;
    let mut least_worn: Option<(u32, u8)> = None;
    for (logical, state) in table.iter() {
        match state {
            BlockState::Discard(_) => discard_count += 1,
            BlockState::Spare(_) => {
                spare_count += 1;
                let wear = table.wear(logical);
                if least_worn.map(|(_, w)| wear < w).unwrap_or(true) {
                    least_worn = Some((logical, wear));
                }
            }
            _ => {}
        }
    }

    let gc_hint = if discard_count as u16 >= config.num_free_blocks_gate
        || spare_count as u16 <= config.num_free_blocks_gate
    {
        GcHint::Pass
    } else {
        GcHint::Fail
    };

    let (spare_logical, _) = least_worn.ok_or(FtlError::NoSpace)?;
    replace_one_block(table, target, spare_logical);
    Ok((table.state(target).phys(), gc_hint))
}

/// Return the physical block of the most-worn spare, without mutating the
/// table. Used by static wear leveling to pick a migration destination.
pub fn replace_mw_block(table: &BlockTable) -> Result<u32> {
    let mut spares: Vec<(u32, u8)> = table
        .iter()
        .filter(|(_, s)| s.is_spare())
        .map(|(l, _)| (l, table.wear(l)))
        .collect();
    if spares.len() < 3 {
        return Err(FtlError::NoSpace);
    }
    spares.sort_by_key(|(_, w)| *w);
    let (most_worn_logical, _) = *spares.last().expect("checked len >= 3");
    Ok(table.state(most_worn_logical).phys())
}

/// One pass of static wear leveling: while the spread between the
/// least-worn data block and the most-worn spare exceeds
/// `config.wear_leveling_gate`, swap them (the caller is responsible for
/// copying the physical page contents across before calling this — this
/// function only updates the table). Returns the swapped `(data_logical,
/// spare_logical)` pairs, in order, capped at `wear_leveling_block_num`.
pub fn static_wear_leveling_plan(
    table: &BlockTable,
    config: &FtlConfig,
) -> Vec<(u32, u32)> {
    let mut swapped_data = std::collections::HashSet::new();
    let mut swapped_spare = std::collections::HashSet::new();
    let mut plan = Vec::new();

    loop {
        if plan.len() >= config.wear_leveling_block_num as usize {
            break;
        }
        let least_worn_data = table
            .iter()
            .filter(|(l, s)| s.is_data() && !swapped_data.contains(l))
            .min_by_key(|(l, _)| table.wear(*l));
        let most_worn_spare = table
            .iter()
            .filter(|(l, s)| s.is_spare() && !swapped_spare.contains(l))
            .max_by_key(|(l, _)| table.wear(*l));

        match (least_worn_data, most_worn_spare) {
            (Some((dl, _)), Some((sl, _))) => {
                let spread = table.wear(sl).saturating_sub(table.wear(dl));
                if spread <= config.wear_leveling_gate {
                    break;
                }
                swapped_data.insert(dl);
                swapped_spare.insert(sl);
                plan.push((dl, sl));
            }
            _ => break,
        }
    }
    plan
}

/// Apply one planned swap from [`static_wear_leveling_plan`]: the data
/// block's content has already been copied to the spare's physical block
/// by the caller; this updates the table to reflect that the spare is now
/// live data and the old data block is discarded.
pub fn apply_wear_leveling_swap(table: &mut BlockTable, data_logical: u32, spare_logical: u32) {
    replace_one_block(table, data_logical, spare_logical);
}

/// Whether any non-bad wear counter has reached the normalize threshold
/// (`0xFE`).
pub fn needs_relative_erase_count_adjust(table: &BlockTable) -> bool {
    table
        .iter()
        .any(|(l, s)| !s.is_bad() && table.wear(l) >= 0xFE)
}

/// Outcome of [`adjust_relative_erase_count`]: whether every counter was
/// simply shifted down, or the device is worn unevenly enough that static
/// wear leveling should run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdjustOutcome {
    Normalized,
    NeedsStaticWearLeveling,
}

/// Subtract the minimum non-bad wear counter from every non-bad counter, or
/// report that static wear leveling is needed first (when the minimum is
/// already zero, subtracting would do nothing useful). `maxed_logical` is
/// the slot whose erase just pushed it to the normalize threshold; in the
/// min-zero case the original driver decrements that counter before handing
/// off to static wear leveling, so a saturating counter doesn't stay pinned
/// at `0xFF` across calls while cold blocks sit at wear 0.
pub fn adjust_relative_erase_count(table: &mut BlockTable, maxed_logical: u32) -> AdjustOutcome {
    let min = table
        .iter()
        .filter(|(_, s)| !s.is_bad())
        .map(|(l, _)| table.wear(l))
        .min()
        .unwrap_or(0);

    if min == 0 {
        table.set_wear(maxed_logical, table.wear(maxed_logical).saturating_sub(1));
        return AdjustOutcome::NeedsStaticWearLeveling;
    }

    let logicals: Vec<u32> = table
        .iter()
        .filter(|(_, s)| !s.is_bad())
        .map(|(l, _)| l)
        .collect();
    for logical in logicals {
        table.set_wear(logical, table.wear(logical) - min);
    }
    AdjustOutcome::Normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FtlConfig {
        FtlConfig::default()
    }

    #[test]
    fn replace_one_block_promotes_spare_and_discards_old() {
        let mut table = BlockTable::new_identity(4, 0, false);
        table.set_state(0, BlockState::Data(0));
        table.set_state(1, BlockState::Spare(1));
        replace_one_block(&mut table, 0, 1);
        assert_eq!(table.state(0), BlockState::Data(1));
        assert_eq!(table.state(1), BlockState::Discard(0));
    }

    #[test]
    fn replace_lw_block_picks_lowest_wear_spare() {
        let mut table = BlockTable::new_identity(4, 0, false);
        table.set_state(0, BlockState::Data(0));
        table.set_state(1, BlockState::Spare(1));
        table.set_state(2, BlockState::Spare(2));
        table.set_wear(1, 5);
        table.set_wear(2, 1);
        let (phys, _) = replace_lw_block(&mut table, &cfg(), 0).unwrap();
        assert_eq!(phys, 2);
    }

    #[test]
    fn replace_lw_block_errors_with_no_spares() {
        let mut table = BlockTable::new_identity(2, 0, false);
        table.set_state(0, BlockState::Data(0));
        table.set_state(1, BlockState::Data(1));
        assert!(matches!(
            replace_lw_block(&mut table, &cfg(), 0),
            Err(FtlError::NoSpace)
        ));
    }

    #[test]
    fn replace_mw_block_requires_at_least_three_spares() {
        let mut table = BlockTable::new_identity(2, 0, false);
        assert!(matches!(replace_mw_block(&table), Err(FtlError::NoSpace)));
    }

    #[test]
    fn adjust_relative_erase_count_shifts_down() {
        let mut table = BlockTable::new_identity(3, 0, false);
        table.set_wear(0, 10);
        table.set_wear(1, 20);
        table.set_wear(2, 5);
        let outcome = adjust_relative_erase_count(&mut table, 1);
        assert_eq!(outcome, AdjustOutcome::Normalized);
        assert_eq!(table.wear(0), 5);
        assert_eq!(table.wear(1), 15);
        assert_eq!(table.wear(2), 0);
    }

    #[test]
    fn adjust_relative_erase_count_flags_static_wear_leveling_at_zero_min() {
        let mut table = BlockTable::new_identity(2, 0, false);
        table.set_wear(0, 0);
        table.set_wear(1, 200);
        assert_eq!(
            adjust_relative_erase_count(&mut table, 1),
            AdjustOutcome::NeedsStaticWearLeveling
        );
    }

    #[test]
    fn adjust_relative_erase_count_decrements_maxed_counter_at_zero_min() {
        // A hot block (logical 1) just saturated at 0xFF while a cold block
        // (logical 0) sits at wear 0; the maxed counter must come down so it
        // doesn't stay pinned at 0xFF forever.
        let mut table = BlockTable::new_identity(2, 0, false);
        table.set_wear(0, 0);
        table.set_wear(1, 0xFF);
        let outcome = adjust_relative_erase_count(&mut table, 1);
        assert_eq!(outcome, AdjustOutcome::NeedsStaticWearLeveling);
        assert_eq!(table.wear(1), 0xFE);
    }

    #[test]
    fn static_wear_leveling_plan_respects_gate_and_cap() {
        let mut table = BlockTable::new_identity(4, 0, false);
        table.set_state(0, BlockState::Data(0));
        table.set_wear(0, 0);
        table.set_state(1, BlockState::Spare(1));
        table.set_wear(1, 100);
        table.set_state(2, BlockState::Data(2));
        table.set_wear(2, 50);
        table.set_state(3, BlockState::Spare(3));
        table.set_wear(3, 50);

        let plan = static_wear_leveling_plan(&table, &cfg());
        assert_eq!(plan, vec![(0, 1)]);
    }
}
