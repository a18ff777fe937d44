use crate::error::{FtlError, Result};

/// Frozen, validated tunables for an [`crate::Ftl`] instance.
///
/// Build one with [`FtlConfigBuilder`]; defaults mirror the values shipped by
/// the original Spectra NAND driver's `spectraswconfig.h`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FtlConfig {
    pub(crate) cache_block_number: u8,
    pub(crate) pages_per_cache_block: u16,
    pub(crate) first_bt_id: u8,
    pub(crate) last_bt_id: u8,
    pub(crate) btsig_offset: usize,
    pub(crate) btsig_bytes: usize,
    pub(crate) btsig_delta: u8,
    pub(crate) wear_leveling_gate: u8,
    pub(crate) wear_leveling_block_num: u8,
    pub(crate) num_free_blocks_gate: u16,
    pub(crate) max_read_counter: u16,
    pub(crate) retry_times: u8,
    pub(crate) large_blocknum: bool,
    pub(crate) auto_format_flash: bool,
    pub(crate) readback_verify: bool,
}

impl Default for FtlConfig {
    fn default() -> Self {
        FtlConfigBuilder::new().build_unchecked()
    }
}

/// Builder for [`FtlConfig`], validating tunables against the device
/// geometry before handing a frozen config to [`crate::Ftl::new`].
///
/// Mirrors the accumulate-then-`build()` shape used elsewhere in this
/// codebase's sibling crates for simulated-device configuration.
#[derive(Clone, Copy, Debug)]
pub struct FtlConfigBuilder {
    cache_block_number: u8,
    pages_per_cache_block: u16,
    first_bt_id: u8,
    last_bt_id: u8,
    btsig_offset: usize,
    btsig_bytes: usize,
    btsig_delta: u8,
    wear_leveling_gate: u8,
    wear_leveling_block_num: u8,
    num_free_blocks_gate: u16,
    max_read_counter: u16,
    retry_times: u8,
    large_blocknum: bool,
    auto_format_flash: bool,
    readback_verify: bool,
}

impl FtlConfigBuilder {
    /// Start a builder pre-populated with the Spectra driver's defaults.
    pub fn new() -> Self {
        Self {
            cache_block_number: 2,
            pages_per_cache_block: 0,
            first_bt_id: 1,
            last_bt_id: 254,
            btsig_offset: 0,
            btsig_bytes: 5,
            btsig_delta: 3,
            wear_leveling_gate: 0x10,
            wear_leveling_block_num: 10,
            num_free_blocks_gate: 30,
            max_read_counter: 0x2710,
            retry_times: 3,
            large_blocknum: true,
            auto_format_flash: false,
            readback_verify: false,
        }
    }

    /// Number of cache items held in RAM.
    pub fn with_cache_block_number(mut self, n: u8) -> Self {
        self.cache_block_number = n;
        self
    }

    /// Window size, in pages, covered by each cache item. `0` means "whole
    /// block".
    pub fn with_pages_per_cache_block(mut self, n: u16) -> Self {
        self.pages_per_cache_block = n;
        self
    }

    /// Range of block-table generation tags, inclusive on both ends.
    pub fn with_bt_id_range(mut self, first: u8, last: u8) -> Self {
        self.first_bt_id = first;
        self.last_bt_id = last;
        self
    }

    /// Layout of the block-table signature within the spare area.
    pub fn with_signature_layout(mut self, offset: usize, bytes: usize, delta: u8) -> Self {
        self.btsig_offset = offset;
        self.btsig_bytes = bytes;
        self.btsig_delta = delta;
        self
    }

    /// Wear spread (in erase cycles) above which static wear leveling acts,
    /// and the number of block swaps performed per pass.
    pub fn with_wear_leveling(mut self, gate: u8, block_num: u8) -> Self {
        self.wear_leveling_gate = gate;
        self.wear_leveling_block_num = block_num;
        self
    }

    /// Minimum spare-block population maintained by garbage collection.
    pub fn with_num_free_blocks_gate(mut self, n: u16) -> Self {
        self.num_free_blocks_gate = n;
        self
    }

    /// Read count (MLC devices only) at which a block is migrated to
    /// mitigate read disturb.
    pub fn with_max_read_counter(mut self, n: u16) -> Self {
        self.max_read_counter = n;
        self
    }

    /// Retry budget around write-with-erase sequences.
    pub fn with_retry_times(mut self, n: u8) -> Self {
        self.retry_times = n;
        self
    }

    /// Whether block-table entries pack a 24-bit physical pointer (`true`)
    /// or a legacy 16-bit one (`false`). `false` steals its top two bits for
    /// flags, so it requires the device to have no more than `0x3FFF`
    /// logical blocks.
    pub fn with_large_blocknum(mut self, enabled: bool) -> Self {
        self.large_blocknum = enabled;
        self
    }

    /// Whether a corrupt/unreadable block table triggers an automatic
    /// full format instead of returning [`FtlError::Corrupt`].
    pub fn with_auto_format_flash(mut self, enabled: bool) -> Self {
        self.auto_format_flash = enabled;
        self
    }

    /// Whether every write is immediately read back and compared.
    pub fn with_readback_verify(mut self, enabled: bool) -> Self {
        self.readback_verify = enabled;
        self
    }

    fn build_unchecked(self) -> FtlConfig {
        FtlConfig {
            cache_block_number: self.cache_block_number,
            pages_per_cache_block: self.pages_per_cache_block,
            first_bt_id: self.first_bt_id,
            last_bt_id: self.last_bt_id,
            btsig_offset: self.btsig_offset,
            btsig_bytes: self.btsig_bytes,
            btsig_delta: self.btsig_delta,
            wear_leveling_gate: self.wear_leveling_gate,
            wear_leveling_block_num: self.wear_leveling_block_num,
            num_free_blocks_gate: self.num_free_blocks_gate,
            max_read_counter: self.max_read_counter,
            retry_times: self.retry_times,
            large_blocknum: self.large_blocknum,
            auto_format_flash: self.auto_format_flash,
            readback_verify: self.readback_verify,
        }
    }

    /// Validate the accumulated tunables against device geometry and freeze
    /// them into an [`FtlConfig`].
    pub fn build(self, spectra_end_block: u32) -> Result<FtlConfig> {
        if self.cache_block_number == 0 {
            return Err(FtlError::InvalidConfig("cache_block_number must be nonzero"));
        }
        if self.last_bt_id <= self.first_bt_id + 3 {
            return Err(FtlError::InvalidConfig(
                "last_bt_id must exceed first_bt_id by more than 3",
            ));
        }
        let tag_period = (self.last_bt_id - self.first_bt_id) as u32 + 1;
        if self.btsig_bytes as u32 * self.btsig_delta as u32 >= tag_period {
            return Err(FtlError::InvalidConfig(
                "signature span must be smaller than the tag period",
            ));
        }
        if !self.large_blocknum && spectra_end_block > crate::persistence::PHYS_MASK16 {
            return Err(FtlError::InvalidConfig(
                "large_blocknum must be enabled when spectra_end_block exceeds the 14-bit \
                 physical pointer range the legacy 16-bit entry leaves after its two flag bits",
            ));
        }
        Ok(self.build_unchecked())
    }
}

impl Default for FtlConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spectraswconfig() {
        let cfg = FtlConfig::default();
        assert_eq!(cfg.cache_block_number, 2);
        assert_eq!(cfg.wear_leveling_gate, 0x10);
        assert_eq!(cfg.wear_leveling_block_num, 10);
        assert_eq!(cfg.num_free_blocks_gate, 30);
        assert!(cfg.large_blocknum);
        assert!(!cfg.auto_format_flash);
    }

    #[test]
    fn rejects_small_blocknum_over_14_bit_range() {
        let err = FtlConfigBuilder::new()
            .with_large_blocknum(false)
            .build(0x4000)
            .unwrap_err();
        assert!(matches!(err, FtlError::InvalidConfig(_)));
    }

    #[test]
    fn accepts_small_blocknum_within_14_bit_range() {
        let cfg = FtlConfigBuilder::new()
            .with_large_blocknum(false)
            .build(0x3FFF)
            .unwrap();
        assert!(!cfg.large_blocknum);
    }

    #[test]
    fn rejects_degenerate_bt_id_range() {
        let err = FtlConfigBuilder::new()
            .with_bt_id_range(1, 3)
            .build(1000)
            .unwrap_err();
        assert!(matches!(err, FtlError::InvalidConfig(_)));
    }
}
