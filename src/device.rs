/// Geometry and capability information for the underlying NAND device.
///
/// Discovered once from the [`crate::lld::LldPort`] at [`crate::Ftl::flash_init`]
/// time and treated as immutable for the life of the `Ftl`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// First physical block number usable by the FTL (inclusive).
    pub spectra_start_block: u32,
    /// Last physical block number usable by the FTL (inclusive).
    pub spectra_end_block: u32,
    /// Total number of physical blocks on the device.
    pub total_blocks: u32,
    /// Pages per block.
    pub pages_per_block: u16,
    /// Bytes of user data per page, excluding spare area.
    pub page_data_size: u16,
    /// Bytes of spare (out-of-band) area per page.
    pub page_spare_size: u16,
    /// ECC bytes consumed per sector within the spare area.
    pub ecc_bytes_per_sector: u16,
    /// Bytes to skip at the start of the spare area before usable spare
    /// bytes begin (controller-reserved).
    pub spare_skip_bytes: u16,
    /// Whether the device is multi-level-cell (requires read-disturb
    /// counters); single-level-cell devices skip that bookkeeping.
    pub mlc: bool,
}

impl DeviceInfo {
    /// Number of logical blocks addressable by the FTL (the blocks between
    /// `spectra_start_block` and `spectra_end_block`, inclusive).
    pub fn data_block_num(&self) -> u32 {
        self.spectra_end_block - self.spectra_start_block + 1
    }

    /// Bytes of user data per block.
    pub fn block_data_size(&self) -> u32 {
        self.pages_per_block as u32 * self.page_data_size as u32
    }

    /// `true` if `phys` falls within the FTL-managed logical region.
    pub fn in_range(&self, phys: u32) -> bool {
        (self.spectra_start_block..=self.spectra_end_block).contains(&phys)
    }
}
