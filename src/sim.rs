//! In-memory [`LldPort`] implementation with deterministic fault injection,
//! for tests and for experimenting with the FTL without real hardware.
//!
//! Builder plus transaction-log shape one layer down from byte-addressable
//! AND-masking NOR semantics: NAND page-program/block-erase semantics
//! instead (a page can be programmed once after an erase; erasing resets a
//! block to all-`0xFF`; factory-bad blocks never accept an erase or
//! program).

use crate::device::DeviceInfo;
use crate::error::{FtlError, Result};
use crate::lld::{CommandOutcome, LldMode, LldPort};
use rand::Rng as _;
use rand::SeedableRng;

/// Logging granularity for [`MemoryLld`]'s transaction log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LldTransactionLogLevel {
    None,
    Minimal,
    Full,
}

/// One recorded operation against a [`MemoryLld`], captured at the
/// granularity requested by [`LldTransactionLogLevel`].
#[derive(Clone, Debug)]
pub enum LldTransaction {
    Read {
        phys_blk: u32,
        page: u16,
        data: Option<Vec<u8>>,
    },
    Write {
        phys_blk: u32,
        page: u16,
        data: Option<Vec<u8>>,
    },
    Erase {
        phys_blk: u32,
    },
}

/// Builder for [`MemoryLld`].
pub struct MemoryLldBuilder {
    total_blocks: u32,
    pages_per_block: u16,
    page_data_size: u16,
    page_spare_size: u16,
    mlc: bool,
    rng_seed: Option<u64>,
    erase_failure_every_x: u32,
    program_failure_every_x: u32,
    factory_bad_blocks: Vec<u32>,
    log_level: LldTransactionLogLevel,
}

impl MemoryLldBuilder {
    pub fn new(total_blocks: u32, pages_per_block: u16, page_data_size: u16, page_spare_size: u16) -> Self {
        Self {
            total_blocks,
            pages_per_block,
            page_data_size,
            page_spare_size,
            mlc: false,
            rng_seed: None,
            erase_failure_every_x: u32::MAX,
            program_failure_every_x: u32::MAX,
            factory_bad_blocks: Vec::new(),
            log_level: LldTransactionLogLevel::None,
        }
    }

    pub fn with_mlc(mut self, mlc: bool) -> Self {
        self.mlc = mlc;
        self
    }

    /// Seed the deterministic RNG used to place injected failures.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Inject one erase failure every `x` erases of a given block past its
    /// first erase.
    pub fn with_erase_failure_rate(mut self, x: u32) -> Self {
        self.erase_failure_every_x = x;
        self
    }

    /// Inject one program failure every `x` programs of a given page.
    pub fn with_program_failure_rate(mut self, x: u32) -> Self {
        self.program_failure_every_x = x;
        self
    }

    pub fn with_factory_bad_blocks(mut self, blocks: &[u32]) -> Self {
        self.factory_bad_blocks = blocks.to_vec();
        self
    }

    pub fn with_logging(mut self, level: LldTransactionLogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn build(self) -> MemoryLld {
        let block_bytes = self.pages_per_block as usize * self.page_data_size as usize;
        let total_bytes = block_bytes * self.total_blocks as usize;
        let spare_bytes = self.pages_per_block as usize * self.page_spare_size as usize * self.total_blocks as usize;
        MemoryLld {
            device: DeviceInfo {
                spectra_start_block: 0,
                spectra_end_block: self.total_blocks - 1,
                total_blocks: self.total_blocks,
                pages_per_block: self.pages_per_block,
                page_data_size: self.page_data_size,
                page_spare_size: self.page_spare_size,
                ecc_bytes_per_sector: 0,
                spare_skip_bytes: 0,
                mlc: self.mlc,
            },
            data: vec![0xFFu8; total_bytes],
            spare: vec![0xFFu8; spare_bytes],
            programmed: vec![false; self.pages_per_block as usize * self.total_blocks as usize],
            erase_counts: vec![0u32; self.total_blocks as usize],
            factory_bad: self.factory_bad_blocks.into_iter().collect(),
            rng: match self.rng_seed {
                Some(seed) => rand::rngs::SmallRng::seed_from_u64(seed),
                None => rand::rngs::SmallRng::seed_from_u64(0),
            },
            erase_failure_every_x: self.erase_failure_every_x,
            program_failure_every_x: self.program_failure_every_x,
            log_level: self.log_level,
            transactions: Vec::new(),
        }
    }
}

/// In-memory NAND device with page-program-once-per-erase semantics and
/// deterministic, seedable fault injection.
pub struct MemoryLld {
    device: DeviceInfo,
    data: Vec<u8>,
    spare: Vec<u8>,
    /// Whether each (block, page) has been programmed since its last erase;
    /// programming an already-programmed page is a misuse the real
    /// hardware wouldn't accept either, so it's treated as a program
    /// failure rather than silently corrupting data.
    programmed: Vec<bool>,
    erase_counts: Vec<u32>,
    factory_bad: std::collections::HashSet<u32>,
    rng: rand::rngs::SmallRng,
    erase_failure_every_x: u32,
    program_failure_every_x: u32,
    log_level: LldTransactionLogLevel,
    transactions: Vec<LldTransaction>,
}

impl MemoryLld {
    /// A small default device useful for unit tests: `total_blocks` blocks,
    /// 8 pages per block, 16 data bytes and 8 spare bytes per page, SLC.
    /// 8 pages leaves room for a block-table image (a handful of pages for
    /// the logical-block counts these tests use) plus its IPF sentinel page
    /// within a single block.
    pub fn new_default(total_blocks: u32) -> Self {
        MemoryLldBuilder::new(total_blocks, 8, 16, 8).build()
    }

    fn page_index(&self, phys_blk: u32, page: u16) -> usize {
        phys_blk as usize * self.device.pages_per_block as usize + page as usize
    }

    fn data_offset(&self, phys_blk: u32, page: u16) -> usize {
        self.page_index(phys_blk, page) * self.device.page_data_size as usize
    }

    fn spare_offset(&self, phys_blk: u32, page: u16) -> usize {
        self.page_index(phys_blk, page) * self.device.page_spare_size as usize
    }

    pub fn transactions(&self) -> &[LldTransaction] {
        &self.transactions
    }

    pub fn erase_count(&self, phys_blk: u32) -> u32 {
        self.erase_counts[phys_blk as usize]
    }

    fn check_not_bad(&self, phys_blk: u32) -> Result<()> {
        if self.factory_bad.contains(&phys_blk) {
            return Err(FtlError::Io(format!("phys block {phys_blk} is factory bad")));
        }
        Ok(())
    }

    fn maybe_program_failure(&mut self, phys_blk: u32, page: u16) -> bool {
        if self.program_failure_every_x == u32::MAX {
            return false;
        }
        let idx = self.page_index(phys_blk, page);
        let programs = self.erase_counts[phys_blk as usize].max(1);
        self.rng.random_range(0..self.program_failure_every_x.max(1)) == 0 && programs > 0 && idx % 7 == 0
    }

    fn maybe_erase_failure(&mut self) -> bool {
        if self.erase_failure_every_x == u32::MAX {
            return false;
        }
        self.rng.random_range(0..self.erase_failure_every_x.max(1)) == 0
    }

    fn log_read(&mut self, phys_blk: u32, page: u16, data: &[u8]) {
        let data = match self.log_level {
            LldTransactionLogLevel::Full => Some(data.to_vec()),
            _ => None,
        };
        if self.log_level != LldTransactionLogLevel::None {
            self.transactions.push(LldTransaction::Read { phys_blk, page, data });
        }
    }

    fn log_write(&mut self, phys_blk: u32, page: u16, data: &[u8]) {
        let data = match self.log_level {
            LldTransactionLogLevel::Full => Some(data.to_vec()),
            _ => None,
        };
        if self.log_level != LldTransactionLogLevel::None {
            self.transactions.push(LldTransaction::Write { phys_blk, page, data });
        }
    }
}

impl LldPort for MemoryLld {
    fn device_info(&self) -> DeviceInfo {
        self.device
    }

    fn mode(&self) -> LldMode {
        LldMode::Polled
    }

    fn read_page_main(&mut self, phys_blk: u32, page: u16, count: u16, buf: &mut [u8]) -> Result<()> {
        self.check_not_bad(phys_blk)?;
        let page_bytes = self.device.page_data_size as usize;
        for i in 0..count {
            let off = self.data_offset(phys_blk, page + i);
            let dst = &mut buf[i as usize * page_bytes..(i as usize + 1) * page_bytes];
            dst.copy_from_slice(&self.data[off..off + page_bytes]);
        }
        self.log_read(phys_blk, page, buf);
        Ok(())
    }

    fn read_page_main_spare(
        &mut self,
        phys_blk: u32,
        page: u16,
        buf: &mut [u8],
        spare: &mut [u8],
    ) -> Result<()> {
        self.check_not_bad(phys_blk)?;
        let off = self.data_offset(phys_blk, page);
        let bytes = self.device.page_data_size as usize;
        buf.copy_from_slice(&self.data[off..off + bytes]);
        let soff = self.spare_offset(phys_blk, page);
        let sbytes = self.device.page_spare_size as usize;
        spare.copy_from_slice(&self.spare[soff..soff + sbytes]);
        self.log_read(phys_blk, page, buf);
        Ok(())
    }

    fn read_page_spare(&mut self, phys_blk: u32, page: u16, spare: &mut [u8]) -> Result<()> {
        self.check_not_bad(phys_blk)?;
        let soff = self.spare_offset(phys_blk, page);
        let sbytes = self.device.page_spare_size as usize;
        spare.copy_from_slice(&self.spare[soff..soff + sbytes]);
        Ok(())
    }

    fn write_page_main(&mut self, phys_blk: u32, page: u16, count: u16, buf: &[u8]) -> Result<()> {
        self.check_not_bad(phys_blk)?;
        let page_bytes = self.device.page_data_size as usize;
        for i in 0..count {
            let p = page + i;
            if self.maybe_program_failure(phys_blk, p) {
                return Err(FtlError::Io(format!(
                    "injected program failure at block {phys_blk} page {p}"
                )));
            }
            let pidx = self.page_index(phys_blk, p);
            if self.programmed[pidx] {
                return Err(FtlError::Io(format!(
                    "page {p} of block {phys_blk} already programmed since last erase"
                )));
            }
            let off = self.data_offset(phys_blk, p);
            let src = &buf[i as usize * page_bytes..(i as usize + 1) * page_bytes];
            self.data[off..off + page_bytes].copy_from_slice(src);
            self.programmed[pidx] = true;
        }
        self.log_write(phys_blk, page, buf);
        Ok(())
    }

    fn write_page_main_spare(
        &mut self,
        phys_blk: u32,
        page: u16,
        buf: &[u8],
        spare: &[u8],
    ) -> Result<()> {
        self.write_page_main(phys_blk, page, 1, buf)?;
        let soff = self.spare_offset(phys_blk, page);
        let sbytes = self.device.page_spare_size as usize;
        self.spare[soff..soff + sbytes].copy_from_slice(spare);
        Ok(())
    }

    fn write_page_spare(&mut self, phys_blk: u32, page: u16, spare: &[u8]) -> Result<()> {
        self.check_not_bad(phys_blk)?;
        let soff = self.spare_offset(phys_blk, page);
        let sbytes = self.device.page_spare_size as usize;
        self.spare[soff..soff + sbytes].copy_from_slice(spare);
        Ok(())
    }

    fn erase_block(&mut self, phys_blk: u32) -> Result<()> {
        self.check_not_bad(phys_blk)?;
        if self.maybe_erase_failure() {
            return Err(FtlError::Io(format!("injected erase failure at block {phys_blk}")));
        }
        let pages = self.device.pages_per_block as usize;
        let page_bytes = self.device.page_data_size as usize;
        let block_off = phys_blk as usize * pages * page_bytes;
        self.data[block_off..block_off + pages * page_bytes].fill(0xFF);

        let spare_pages = self.device.pages_per_block as usize;
        let spare_bytes = self.device.page_spare_size as usize;
        let spare_off = phys_blk as usize * spare_pages * spare_bytes;
        self.spare[spare_off..spare_off + spare_pages * spare_bytes].fill(0xFF);

        for p in 0..pages {
            self.programmed[phys_blk as usize * pages + p] = false;
        }
        self.erase_counts[phys_blk as usize] += 1;
        self.transactions.push(LldTransaction::Erase { phys_blk });
        Ok(())
    }

    fn is_factory_bad_block(&self, phys_blk: u32) -> bool {
        self.factory_bad.contains(&phys_blk)
    }

    fn execute_cmds(&mut self, _n: u16) -> Result<()> {
        Ok(())
    }

    fn event_status(&mut self) -> Result<Vec<CommandOutcome>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_device_reads_erased_pattern() {
        let mut lld = MemoryLld::new_default(4);
        let mut buf = vec![0u8; 16];
        lld.read_page_main(0, 0, 1, &mut buf).unwrap();
        assert_eq!(buf, vec![0xFF; 16]);
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut lld = MemoryLld::new_default(4);
        let data = vec![0xAB; 16];
        lld.write_page_main(0, 0, 1, &data).unwrap();
        let mut buf = vec![0u8; 16];
        lld.read_page_main(0, 0, 1, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn erase_resets_to_erased_pattern_and_clears_programmed_flag() {
        let mut lld = MemoryLld::new_default(4);
        lld.write_page_main(0, 0, 1, &vec![0x11; 16]).unwrap();
        lld.erase_block(0).unwrap();
        let mut buf = vec![0u8; 16];
        lld.read_page_main(0, 0, 1, &mut buf).unwrap();
        assert_eq!(buf, vec![0xFF; 16]);
        // After erase the page can be programmed again.
        lld.write_page_main(0, 0, 1, &vec![0x22; 16]).unwrap();
    }

    #[test]
    fn double_program_without_erase_fails() {
        let mut lld = MemoryLld::new_default(4);
        lld.write_page_main(0, 0, 1, &vec![0x11; 16]).unwrap();
        assert!(lld.write_page_main(0, 0, 1, &vec![0x22; 16]).is_err());
    }

    #[test]
    fn factory_bad_block_rejects_all_access() {
        let mut lld = MemoryLldBuilder::new(4, 4, 16, 8)
            .with_factory_bad_blocks(&[2])
            .build();
        assert!(lld.is_factory_bad_block(2));
        assert!(lld.erase_block(2).is_err());
        let mut buf = vec![0u8; 16];
        assert!(lld.read_page_main(2, 0, 1, &mut buf).is_err());
    }

    #[test]
    fn deterministic_erase_failures_are_reproducible() {
        let build = || {
            MemoryLldBuilder::new(4, 4, 16, 8)
                .with_rng_seed(42)
                .with_erase_failure_rate(2)
                .build()
        };
        let mut a = build();
        let mut b = build();
        let results_a: Vec<bool> = (0..10).map(|_| a.erase_block(0).is_ok()).collect();
        let results_b: Vec<bool> = (0..10).map(|_| b.erase_block(0).is_ok()).collect();
        assert_eq!(results_a, results_b);
    }
}
