//! In-memory logical-block table.
//!
//! The original driver packed status flags into the high bits of a 32-bit
//! physical-block-number field (`DISCARD_BLOCK`/`SPARE_BLOCK`/`BAD_BLOCK`
//! masks over `MAX_BLOCKNODE_VALUE`). Here the state is a tagged enum so
//! invalid combinations (e.g. "bad and discard") are unrepresentable.

/// The state of one logical block's mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// Mapped and live: `phys` holds the block's current data.
    Data(u32),
    /// Erased and available to be mapped to any logical block.
    Spare(u32),
    /// Formerly mapped; `phys` is stale and awaits erase by garbage
    /// collection before it can become `Spare` again.
    Discard(u32),
    /// Permanently unusable. Sticky: once set, a slot never leaves this
    /// state for the same physical block.
    Bad(u32),
}

impl BlockState {
    /// The physical block number this entry currently names.
    pub fn phys(&self) -> u32 {
        match *self {
            BlockState::Data(p)
            | BlockState::Spare(p)
            | BlockState::Discard(p)
            | BlockState::Bad(p) => p,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, BlockState::Data(_))
    }

    pub fn is_spare(&self) -> bool {
        matches!(self, BlockState::Spare(_))
    }

    pub fn is_discard(&self) -> bool {
        matches!(self, BlockState::Discard(_))
    }

    pub fn is_bad(&self) -> bool {
        matches!(self, BlockState::Bad(_))
    }
}

/// The in-memory logical-block table: one [`BlockState`] plus wear and
/// (MLC-only) read counters per logical block.
#[derive(Clone, Debug)]
pub struct BlockTable {
    entries: Vec<BlockState>,
    wear: Vec<u8>,
    read_counters: Option<Vec<u16>>,
}

impl BlockTable {
    /// Build a table for `data_block_num` logical blocks, all initially
    /// `Spare`, mapped one-to-one onto the physical blocks starting at
    /// `spectra_start_block`. `mlc` controls whether read counters are
    /// tracked.
    pub fn new_identity(data_block_num: u32, spectra_start_block: u32, mlc: bool) -> Self {
        let entries = (0..data_block_num)
            .map(|i| BlockState::Spare(spectra_start_block + i))
            .collect();
        Self {
            entries,
            wear: vec![0; data_block_num as usize],
            read_counters: mlc.then(|| vec![0u16; data_block_num as usize]),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, logical: u32) -> BlockState {
        self.entries[logical as usize]
    }

    pub fn set_state(&mut self, logical: u32, state: BlockState) {
        self.entries[logical as usize] = state;
    }

    pub fn wear(&self, logical: u32) -> u8 {
        self.wear[logical as usize]
    }

    pub fn set_wear(&mut self, logical: u32, wear: u8) {
        self.wear[logical as usize] = wear;
    }

    pub fn read_counter(&self, logical: u32) -> u16 {
        self.read_counters
            .as_ref()
            .map(|rc| rc[logical as usize])
            .unwrap_or(0)
    }

    pub fn set_read_counter(&mut self, logical: u32, value: u16) {
        if let Some(rc) = self.read_counters.as_mut() {
            rc[logical as usize] = value;
        }
    }

    pub fn has_read_counters(&self) -> bool {
        self.read_counters.is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, BlockState)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, s)| (i as u32, *s))
    }

    /// Find the logical slot currently mapping to `phys`, if any.
    pub fn logical_for_phys(&self, phys: u32) -> Option<u32> {
        self.entries
            .iter()
            .position(|s| s.phys() == phys)
            .map(|i| i as u32)
    }

    /// Verify that no physical block is named by more than one logical
    /// slot.
    pub fn check_no_duplicate_mappings(&self) -> bool {
        let mut seen = std::collections::HashSet::with_capacity(self.entries.len());
        self.entries.iter().all(|s| seen.insert(s.phys()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_table_has_no_duplicates() {
        let bt = BlockTable::new_identity(16, 100, true);
        assert_eq!(bt.len(), 16);
        assert!(bt.check_no_duplicate_mappings());
        assert!(bt.has_read_counters());
    }

    #[test]
    fn slc_table_has_no_read_counters() {
        let bt = BlockTable::new_identity(4, 0, false);
        assert!(!bt.has_read_counters());
        assert_eq!(bt.read_counter(0), 0);
    }

    #[test]
    fn logical_for_phys_round_trips() {
        let bt = BlockTable::new_identity(8, 50, false);
        for logical in 0..8 {
            let phys = bt.state(logical).phys();
            assert_eq!(bt.logical_for_phys(phys), Some(logical));
        }
    }

    #[test]
    fn duplicate_mapping_detected() {
        let mut bt = BlockTable::new_identity(4, 0, false);
        bt.set_state(1, BlockState::Data(bt.state(0).phys()));
        assert!(!bt.check_no_duplicate_mappings());
    }
}
