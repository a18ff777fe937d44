//! A flash translation layer for raw NAND: logical-to-physical block
//! mapping, a write-back cache, wear leveling, garbage collection and
//! read-disturb mitigation, layered over a low-level-driver trait boundary.
//!
//! `Ftl<L>` is generic over [`lld::LldPort`], the only point where this
//! crate touches real (or simulated) flash. Everything else — the block
//! table, the cache, replacement, garbage collection, read-disturb
//! migration, and the on-flash persistence format — is pure logic over that
//! trait, independently testable against [`sim::MemoryLld`].
//!
//! Typical use:
//! - Implement [`lld::LldPort`] for your NAND driver (or use [`sim::MemoryLld`]
//!   while developing against simulated flash).
//! - Build an [`config::FtlConfig`] with [`config::FtlConfigBuilder`].
//! - Construct an [`Ftl`] with [`Ftl::new`] and call [`Ftl::flash_init`] to
//!   mount (or format, if `auto_format_flash` is set and nothing mountable
//!   is found).
//! - Read and write through [`Ftl::page_read`]/[`Ftl::page_write`]; call
//!   [`Ftl::flush_cache`] to force dirty pages and the block table to flash.

use core::cell::Cell;

pub mod arena;
pub mod block_table;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod gc;
pub mod lld;
pub mod persistence;
pub mod read_disturb;
pub mod replace;
#[cfg(feature = "sim")]
pub mod sim;
#[cfg(feature = "cmd-dma")]
pub mod shadow_log;

use arena::Arena;
use block_table::{BlockState, BlockTable};
use cache::Cache;
use config::{FtlConfig, FtlConfigBuilder};
use device::DeviceInfo;
use error::{FtlError, Result};
use lld::LldPort;
use persistence::BtStatus;
use replace::{AdjustOutcome, GcHint};

#[cfg(feature = "cmd-dma")]
use lld::EventStatus;
#[cfg(feature = "cmd-dma")]
use shadow_log::ShadowLog;

/// The logical slot that always holds the live block table. Mirrors the
/// original driver's convention of reserving block 0 of the logical region
/// for `BLOCK_TABLE_INDEX`.
pub const BLOCK_TABLE_INDEX: u32 = 0;

/// A flash translation layer over a low-level NAND driver `L`.
///
/// Owns the in-memory block table, wear/read counters, cache, and the
/// scratch arena; every public method takes `&mut self`, so at most one
/// operation is in flight at a time.
pub struct Ftl<L: LldPort> {
    device: DeviceInfo,
    config: FtlConfig,
    lld: L,
    table: BlockTable,
    cache: Cache,
    arena: Arena,

    bt_pages: u16,
    bt_tag: u8,
    bt_offset: u16,
    bt_has_image: bool,
    bt_status: BtStatus,
    bt_registry: Vec<u32>,
    bt_gc_cursor: usize,

    gc_in_progress: Cell<bool>,
    bt_gc_in_progress: Cell<bool>,

    #[cfg(feature = "cmd-dma")]
    cmd_seq: u32,
    #[cfg(feature = "cmd-dma")]
    shadow: Option<ShadowLog>,
}

impl<L: LldPort> Ftl<L> {
    /// `mem_config` + `init`: read device geometry from the LLD, validate
    /// `config_builder` against it, and carve the scratch arena and cache.
    /// Does not touch flash; call [`Ftl::flash_init`] next to mount or
    /// format.
    pub fn new(mut lld: L, config_builder: FtlConfigBuilder) -> Result<Self> {
        let device = lld.device_info();
        let config = config_builder.build(device.spectra_end_block)?;
        let data_block_num = device.data_block_num();

        let window_pages = if config.pages_per_cache_block == 0 {
            device.pages_per_block
        } else {
            config.pages_per_cache_block
        };
        let cache = Cache::new(config.cache_block_number, window_pages, device.page_data_size);
        let arena = Arena::new(device.pages_per_block, device.page_data_size, device.page_spare_size);
        let bt_pages = persistence::bt_pages_for(data_block_num, device.mlc, &config, device.page_data_size);

        log::debug!(
            "ftl: init device_blocks={} pages_per_block={} bt_pages={bt_pages}",
            data_block_num,
            device.pages_per_block
        );

        Ok(Self {
            device,
            config,
            lld,
            table: BlockTable::new_identity(data_block_num, device.spectra_start_block, device.mlc),
            cache,
            arena,
            bt_pages,
            bt_tag: config.first_bt_id,
            bt_offset: 0,
            bt_has_image: false,
            bt_status: BtStatus::InProgress,
            bt_registry: Vec::new(),
            bt_gc_cursor: 0,
            gc_in_progress: Cell::new(false),
            bt_gc_in_progress: Cell::new(false),
            #[cfg(feature = "cmd-dma")]
            cmd_seq: 0,
            #[cfg(feature = "cmd-dma")]
            shadow: None,
        })
    }

    /// Device geometry discovered at construction.
    pub fn identify_device(&self) -> DeviceInfo {
        self.device
    }

    /// Mount the on-flash block table, or format a fresh one if nothing
    /// valid is found and `auto_format_flash` is enabled.
    pub fn flash_init(&mut self) -> Result<()> {
        self.mount()
    }

    /// Flush dirty cache state and the block table before shutdown.
    pub fn flash_release(&mut self) -> Result<()> {
        self.flush_cache()
    }

    /// Format the device. If `valid_bt_flag`, try mounting the existing
    /// table first and only format if that fails.
    pub fn flash_format(&mut self, valid_bt_flag: bool) -> Result<()> {
        if valid_bt_flag && self.mount().is_ok() {
            return Ok(());
        }
        self.full_format()
    }

    /// Read the page containing logical byte address `addr`.
    pub fn page_read(&mut self, addr: u64) -> Result<Vec<u8>> {
        let (logical_block, page_in_block, _) = self.decode_addr(addr);
        let window_pages = self.window_pages();
        let window_index = page_in_block as u32 / window_pages as u32;
        let key = self.cache_key(logical_block, window_index);

        let idx = match self.cache.find(key) {
            Some(i) => {
                self.cache.touch(i);
                i
            }
            None => self.cache_miss_read(key, logical_block, window_index)?,
        };

        let window_start_page = window_index as u16 * window_pages;
        let page_off = (page_in_block - window_start_page) as usize * self.device.page_data_size as usize;
        let page_len = self.device.page_data_size as usize;
        Ok(self.cache.items()[idx].content[page_off..page_off + page_len].to_vec())
    }

    /// Write one page's worth of bytes at logical byte address `addr`. The
    /// cached window is marked dirty; it reaches flash on eviction or
    /// [`Ftl::flush_cache`].
    pub fn page_write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        assert_eq!(
            data.len(),
            self.device.page_data_size as usize,
            "page_write: data length must equal page_data_size"
        );
        let (logical_block, page_in_block, _) = self.decode_addr(addr);
        let window_pages = self.window_pages();
        let window_index = page_in_block as u32 / window_pages as u32;
        let key = self.cache_key(logical_block, window_index);

        let idx = match self.cache.find(key) {
            Some(i) => i,
            None => self.cache_miss_write(key, logical_block, window_index)?,
        };

        let window_start_page = window_index as u16 * window_pages;
        let page_off = (page_in_block - window_start_page) as usize * self.device.page_data_size as usize;
        self.cache.write_into(idx, page_off, data);
        self.cache.mark_dirty(idx);
        self.cache.touch(idx);
        Ok(())
    }

    /// Read one page directly from flash, bypassing the cache, incrementing
    /// the read-disturb counter on MLC devices (`cache_read_all` contract:
    /// returns `0xFF`-filled bytes for a non-DATA logical slot).
    pub fn read_immediate(&mut self, addr: u64) -> Result<Vec<u8>> {
        let (logical_block, page_in_block, _) = self.decode_addr(addr);
        let state = self.table.state(logical_block);
        if !state.is_data() {
            return Ok(vec![0xFFu8; self.device.page_data_size as usize]);
        }
        let phys = state.phys();
        let mut buf = vec![0u8; self.device.page_data_size as usize];
        self.lld
            .read_page_main(phys, page_in_block, 1, &mut buf)
            .map_err(|_| FtlError::Io(format!("read_immediate failed at phys {phys} page {page_in_block}")))?;

        if read_disturb::note_read(&mut self.table, &self.config, logical_block) {
            self.maybe_migrate(logical_block)?;
        }
        Ok(buf)
    }

    /// Erase the physical block currently mapped to the logical block
    /// containing `addr`. Bumps the wear counter on success and resets the
    /// MLC read counter; marks the block BAD on failure.
    pub fn block_erase(&mut self, addr: u64) -> Result<()> {
        let (logical_block, _, _) = self.decode_addr(addr);
        let phys = self.table.state(logical_block).phys();
        self.erase_and_bump_wear(logical_block, phys)
    }

    /// Whether the logical block containing `addr` is currently BAD.
    pub fn is_bad_block(&self, addr: u64) -> bool {
        let (logical_block, _, _) = self.decode_addr(addr);
        self.table.state(logical_block).is_bad()
    }

    /// Write back every dirty cache item, then persist the block table.
    pub fn flush_cache(&mut self) -> Result<()> {
        for idx in self.cache.dirty_indices() {
            self.write_back_item(idx)?;
        }
        self.persist_block_table(false)
    }

    /// Run data-block garbage collection (and, first, block-table GC).
    /// Re-entrant calls return `Ok(0)` without acting.
    pub fn garbage_collection(&mut self) -> Result<u32> {
        if self.gc_in_progress.get() {
            return Ok(0);
        }
        self.gc_in_progress.set(true);
        let result = self.run_garbage_collection();
        self.gc_in_progress.set(false);
        result
    }

    /// Run block-table garbage collection alone. Re-entrant calls return
    /// `Ok(0)` without acting.
    pub fn bt_garbage_collection(&mut self) -> Result<u32> {
        if self.bt_gc_in_progress.get() {
            return Ok(0);
        }
        self.bt_gc_in_progress.set(true);
        let result = self.run_bt_gc();
        self.bt_gc_in_progress.set(false);
        result
    }

    /// Run one pass of static wear leveling: swap the least-worn data block
    /// with the most-worn spare, up to `wear_leveling_block_num` times.
    pub fn wear_leveling(&mut self) -> Result<()> {
        let plan = replace::static_wear_leveling_plan(&self.table, &self.config);
        if plan.is_empty() {
            return Ok(());
        }
        let pages_per_block = self.device.pages_per_block;
        let page_data_size = self.device.page_data_size;

        for (data_logical, spare_logical) in &plan {
            self.begin_command();
            let old_phys = self.table.state(*data_logical).phys();
            let new_phys = self.table.state(*spare_logical).phys();
            self.record_ipf()?;

            let buf = &mut self.arena.block_scratch[..pages_per_block as usize * page_data_size as usize];
            self.lld
                .read_page_main(old_phys, 0, pages_per_block, buf)
                .map_err(|_| FtlError::Io(format!("wear leveling source read failed at {old_phys}")))?;
            self.lld
                .write_page_main(new_phys, 0, pages_per_block, buf)
                .map_err(|_| FtlError::Io(format!("wear leveling destination write failed at {new_phys}")))?;

            replace::apply_wear_leveling_swap(&mut self.table, *data_logical, *spare_logical);
            self.shadow_record(*data_logical);
            self.shadow_record(*spare_logical);
            log::debug!("wear_leveling: moved logical {data_logical} from phys {old_phys} to {new_phys}");
        }
        self.persist_block_table(false)
    }

    // --- internal: mounting and formatting ------------------------------

    fn mount(&mut self) -> Result<()> {
        let tags = persistence::scan_tags(&mut self.lld, &self.device, &self.config);
        let registry: Vec<u32> = tags.iter().map(|&(_, p)| p).collect();
        let ordered = persistence::generation_order(&tags, self.config.first_bt_id, self.config.last_bt_id);

        for (tag, phys) in ordered {
            let found = persistence::find_last_image_in_block(
                &mut self.lld,
                phys,
                self.bt_pages,
                self.device.pages_per_block,
                self.device.page_data_size,
                self.device.page_spare_size,
                &self.config,
                self.device.data_block_num(),
                self.device.mlc,
            )?;
            let Some((offset, status, found_tag, table)) = found else {
                continue;
            };
            if found_tag != tag || !persistence::check_block_table(&table, &self.device) {
                continue;
            }
            self.table = table;
            self.bt_tag = tag;
            self.bt_offset = offset;
            self.bt_has_image = true;
            self.bt_status = status;
            self.bt_registry = registry;
            self.cache.invalidate_all();
            log::debug!("mount: recovered generation tag={tag} phys={phys} status={status:?}");
            return Ok(());
        }

        log::warn!("mount: no valid block table generation found, running SPL recovery");
        self.spl_recovery(&registry);
        if self.config.auto_format_flash {
            self.full_format()
        } else {
            Err(FtlError::Corrupt)
        }
    }

    fn spl_recovery(&mut self, registry: &[u32]) {
        for phys in self.device.spectra_start_block..=self.device.spectra_end_block {
            if registry.contains(&phys) || self.lld.is_factory_bad_block(phys) {
                continue;
            }
            let _ = self.lld.erase_block(phys);
        }
    }

    fn full_format(&mut self) -> Result<()> {
        let data_block_num = self.device.data_block_num();
        let mut table = BlockTable::new_identity(data_block_num, self.device.spectra_start_block, self.device.mlc);
        let bt_phys = table.state(BLOCK_TABLE_INDEX).phys();

        for logical in 0..data_block_num {
            let phys = table.state(logical).phys();
            if self.lld.is_factory_bad_block(phys) {
                table.set_state(logical, BlockState::Bad(phys));
            } else if logical != BLOCK_TABLE_INDEX {
                let _ = self.lld.erase_block(phys);
            }
        }
        table.set_state(BLOCK_TABLE_INDEX, BlockState::Data(bt_phys));
        let _ = self.lld.erase_block(bt_phys);

        self.table = table;
        self.cache.invalidate_all();
        self.bt_tag = self.config.first_bt_id;
        self.bt_offset = 0;
        self.bt_has_image = false;
        self.bt_status = BtStatus::InProgress;
        self.bt_registry = vec![bt_phys];
        self.bt_gc_cursor = 0;
        log::info!("full_format: fresh identity table, {data_block_num} logical blocks");
        self.persist_block_table(true)
    }

    // --- internal: address decoding and cache windows -------------------

    fn decode_addr(&self, addr: u64) -> (u32, u16, usize) {
        let bds = self.device.block_data_size() as u64;
        let logical_block = (addr / bds) as u32;
        let off = (addr % bds) as u32;
        let page_in_block = (off / self.device.page_data_size as u32) as u16;
        let byte_in_page = (off % self.device.page_data_size as u32) as usize;
        (logical_block, page_in_block, byte_in_page)
    }

    fn window_pages(&self) -> u16 {
        self.cache.window_pages()
    }

    fn windows_per_block(&self) -> u32 {
        let wp = self.window_pages() as u32;
        let ppb = self.device.pages_per_block as u32;
        (ppb + wp - 1) / wp
    }

    fn cache_key(&self, logical_block: u32, window_index: u32) -> u32 {
        logical_block * self.windows_per_block() + window_index
    }

    fn decode_key(&self, key: u32) -> (u32, u32) {
        let wpb = self.windows_per_block();
        (key / wpb, key % wpb)
    }

    // --- internal: cache miss handling -----------------------------------

    fn cache_miss_read(&mut self, key: u32, logical_block: u32, window_index: u32) -> Result<usize> {
        let victim = self.cache.lru_victim();
        if self.cache.items()[victim].dirty {
            self.write_back_item(victim)?;
        }

        let window_pages = self.window_pages();
        let window_start_page = window_index as u16 * window_pages;
        let pages_per_block = self.device.pages_per_block;
        let count = window_pages.min(pages_per_block.saturating_sub(window_start_page));
        let page_data_size = self.device.page_data_size;

        let state = self.table.state(logical_block);
        let content = if state.is_data() {
            let phys = state.phys();
            let mut buf = vec![0xFFu8; window_pages as usize * page_data_size as usize];
            let used = count as usize * page_data_size as usize;
            match self.lld.read_page_main(phys, window_start_page, count, &mut buf[..used]) {
                Ok(()) => {
                    if read_disturb::note_read(&mut self.table, &self.config, logical_block) {
                        self.maybe_migrate(logical_block)?;
                    }
                    buf
                }
                Err(e) => {
                    self.cache.invalidate_all();
                    return Err(FtlError::Io(format!("cache miss read failed at phys {phys}: {e}")));
                }
            }
        } else {
            vec![0xFFu8; window_pages as usize * page_data_size as usize]
        };

        self.cache.install(victim, key, content);
        self.cache.touch(victim);
        Ok(victim)
    }

    fn cache_miss_write(&mut self, key: u32, logical_block: u32, window_index: u32) -> Result<usize> {
        if self.table.state(logical_block).is_bad() {
            self.replace_bad_block(logical_block)?;
        }
        self.cache_miss_read(key, logical_block, window_index)
    }

    fn replace_bad_block(&mut self, logical: u32) -> Result<()> {
        let (_, gc_hint) = replace::replace_lw_block(&mut self.table, &self.config, logical)?;
        self.shadow_record(logical);
        if gc_hint == GcHint::Pass {
            self.garbage_collection()?;
        }
        Ok(())
    }

    // --- internal: write-back and error recovery -------------------------

    fn write_back_item(&mut self, idx: usize) -> Result<()> {
        let key = match self.cache.items()[idx].logical_block {
            Some(k) => k,
            None => return Ok(()),
        };
        let (logical_block, window_index) = self.decode_key(key);
        let content = self.cache.items()[idx].content.clone();
        self.cache_write_back(logical_block, window_index, content.clone())?;
        self.cache.install(idx, key, content);
        Ok(())
    }

    fn cache_write_back(&mut self, logical_block: u32, window_index: u32, content: Vec<u8>) -> Result<()> {
        let mut attempts = 0u8;
        loop {
            attempts += 1;
            match self.try_cache_write_back(logical_block, window_index, &content) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if attempts >= self.config.retry_times {
                        return self.flash_error_handle(logical_block, window_index, &content, e);
                    }
                    log::warn!("cache_write_back: retrying logical {logical_block} after failure: {e}");
                }
            }
        }
    }

    fn try_cache_write_back(&mut self, logical_block: u32, window_index: u32, content: &[u8]) -> Result<()> {
        self.begin_command();
        let old_state = self.table.state(logical_block);
        let old_had_data = old_state.is_data();
        let old_phys = old_state.phys();

        let (new_phys, gc_hint) = replace::replace_lw_block(&mut self.table, &self.config, logical_block)?;
        self.shadow_record(logical_block);
        if gc_hint == GcHint::Pass {
            let _ = self.garbage_collection();
        }
        self.record_ipf()?;

        match self.lld.erase_block(new_phys) {
            Ok(()) => {
                let w = self.table.wear(logical_block).saturating_add(1);
                self.table.set_wear(logical_block, w);
                self.shadow_record(logical_block);
            }
            Err(e) => {
                self.table.set_state(logical_block, BlockState::Bad(new_phys));
                self.shadow_record(logical_block);
                return Err(e);
            }
        }

        let pages_per_block = self.device.pages_per_block;
        let page_data_size = self.device.page_data_size;
        let window_pages = self.window_pages();
        let window_start_page = window_index as u16 * window_pages;

        let mut full = vec![0xFFu8; pages_per_block as usize * page_data_size as usize];
        if old_had_data {
            let _ = self.lld.read_page_main(old_phys, 0, pages_per_block, &mut full);
        }

        let start_byte = window_start_page as usize * page_data_size as usize;
        full[start_byte..start_byte + content.len()].copy_from_slice(content);

        for item in self.cache.items() {
            if let Some(other_key) = item.logical_block {
                let (ol, ow) = self.decode_key(other_key);
                if ol == logical_block && ow != window_index {
                    let ostart = ow as usize * window_pages as usize * page_data_size as usize;
                    let olen = item.content.len();
                    full[ostart..ostart + olen].copy_from_slice(&item.content);
                }
            }
        }

        self.lld
            .write_page_main(new_phys, 0, pages_per_block, &full)
            .map_err(|_| FtlError::Io(format!("cache write-back failed at phys {new_phys}")))
    }

    fn flash_error_handle(&mut self, logical_block: u32, window_index: u32, content: &[u8], _last_err: FtlError) -> Result<()> {
        loop {
            self.garbage_collection()?;
            let has_spare = self.table.iter().any(|(_, s)| s.is_spare());
            if !has_spare {
                return Err(FtlError::NoSpace);
            }
            let phys = self.table.state(logical_block).phys();
            self.table.set_state(logical_block, BlockState::Bad(phys));
            self.shadow_record(logical_block);
            log::warn!("flash_error_handle: marked logical {logical_block} (phys {phys}) bad, retrying");
            match self.try_cache_write_back(logical_block, window_index, content) {
                Ok(()) => return Ok(()),
                Err(_) => continue,
            }
        }
    }

    // --- internal: garbage collection ------------------------------------

    fn run_garbage_collection(&mut self) -> Result<u32> {
        self.bt_garbage_collection()?;
        let discard_count = self.table.iter().filter(|(_, s)| s.is_discard()).count();
        if discard_count == 0 {
            return Ok(0);
        }
        self.record_ipf()?;
        let bt_registry = self.bt_registry.clone();
        let erased = gc::garbage_collection(&mut self.table, &bt_registry, &mut self.lld)?;
        self.persist_block_table(false)?;
        Ok(erased)
    }

    fn run_bt_gc(&mut self) -> Result<u32> {
        let mut registry = self.bt_registry.clone();
        let erased = gc::bt_garbage_collection(&mut self.table, BLOCK_TABLE_INDEX, &mut registry, self.bt_gc_cursor, &mut self.lld)?;
        self.bt_registry = registry;
        self.bt_gc_cursor = if self.bt_registry.is_empty() {
            0
        } else {
            self.bt_gc_cursor % self.bt_registry.len()
        };
        Ok(erased)
    }

    // --- internal: read-disturb migration --------------------------------

    fn maybe_migrate(&mut self, logical_block: u32) -> Result<()> {
        match self.run_migration(logical_block) {
            Err(FtlError::NoSpace) => {
                self.garbage_collection()?;
                match self.run_migration(logical_block) {
                    Ok(()) | Err(FtlError::NoSpace) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            other => other,
        }
    }

    fn run_migration(&mut self, logical_block: u32) -> Result<()> {
        self.begin_command();
        self.record_ipf()?;
        let pages_per_block = self.device.pages_per_block;
        let page_data_size = self.device.page_data_size;
        read_disturb::migrate(
            &mut self.table,
            &self.config,
            logical_block,
            pages_per_block,
            page_data_size,
            &mut self.arena.block_scratch,
            &mut self.lld,
        )?;
        self.shadow_record(logical_block);
        self.persist_block_table(false)
    }

    // --- internal: erase accounting ---------------------------------------

    fn erase_and_bump_wear(&mut self, logical: u32, phys: u32) -> Result<()> {
        self.begin_command();
        match self.lld.erase_block(phys) {
            Ok(()) => {
                let w = self.table.wear(logical).saturating_add(1);
                self.table.set_wear(logical, w);
                self.table.set_read_counter(logical, 0);
                self.shadow_record(logical);
                if w >= 0xFE {
                    self.adjust_wear(logical)?;
                }
                Ok(())
            }
            Err(e) => {
                self.table.set_state(logical, BlockState::Bad(phys));
                self.shadow_record(logical);
                Err(e)
            }
        }
    }

    fn adjust_wear(&mut self, maxed_logical: u32) -> Result<()> {
        match replace::adjust_relative_erase_count(&mut self.table, maxed_logical) {
            AdjustOutcome::Normalized => Ok(()),
            AdjustOutcome::NeedsStaticWearLeveling => {
                self.shadow_record(maxed_logical);
                self.wear_leveling()
            }
        }
    }

    // --- internal: block-table persistence --------------------------------

    fn next_bt_tag(&self) -> u8 {
        if self.bt_tag >= self.config.last_bt_id {
            self.config.first_bt_id
        } else {
            self.bt_tag + 1
        }
    }

    fn record_ipf(&mut self) -> Result<()> {
        if self.bt_status == BtStatus::InProgress {
            return Ok(());
        }
        self.bt_status = BtStatus::InProgress;
        let phys = self.table.state(BLOCK_TABLE_INDEX).phys();
        let ipf_offset = if self.bt_has_image { self.bt_offset + self.bt_pages } else { 0 };
        persistence::write_ipf_page(&mut self.lld, phys, ipf_offset, &self.arena.ipf_page)
    }

    fn persist_block_table(&mut self, force: bool) -> Result<()> {
        let bt_pages = self.bt_pages;
        let mut force = force;
        loop {
            let relocate = force
                || !self.bt_has_image
                || {
                    let candidate = self.bt_offset as u32 + bt_pages as u32 + 1;
                    candidate + bt_pages as u32 > self.device.pages_per_block as u32
                };

            let write_offset = if relocate {
                if self.bt_has_image {
                    let (_, gc_hint) = replace::replace_lw_block(&mut self.table, &self.config, BLOCK_TABLE_INDEX)?;
                    if gc_hint == GcHint::Pass {
                        let _ = self.garbage_collection();
                    }
                    self.bt_tag = self.next_bt_tag();
                    let new_phys = self.table.state(BLOCK_TABLE_INDEX).phys();
                    self.bt_registry.push(new_phys);
                    log::debug!("persist_block_table: relocated to phys {new_phys}, tag {}", self.bt_tag);
                }
                0u16
            } else {
                self.bt_offset + bt_pages + 1
            };

            let phys = self.table.state(BLOCK_TABLE_INDEX).phys();
            match persistence::write_image(
                &mut self.lld,
                phys,
                write_offset,
                bt_pages,
                &self.table,
                &self.config,
                self.bt_tag,
                self.device.page_data_size,
                self.device.page_spare_size,
            ) {
                Ok(()) => {
                    self.bt_offset = write_offset;
                    self.bt_has_image = true;
                    self.bt_status = BtStatus::Current;
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("persist_block_table: write to phys {phys} failed: {e}; marking bad and relocating");
                    self.table.set_state(BLOCK_TABLE_INDEX, BlockState::Bad(phys));
                    force = true;
                }
            }
        }
    }

    // --- internal: command-DMA shadow log ---------------------------------

    /// Advance to the next command tag. Called once per physical command
    /// composed on the write path (cache write-back, block erase, read-
    /// disturb migration, one wear-leveling swap) so that the deltas
    /// `shadow_record` appends afterward carry the tag the LLD will later
    /// report a per-command outcome against.
    #[cfg(feature = "cmd-dma")]
    fn begin_command(&mut self) {
        self.cmd_seq += 1;
    }

    #[cfg(not(feature = "cmd-dma"))]
    fn begin_command(&mut self) {}

    #[cfg(feature = "cmd-dma")]
    fn shadow_record(&mut self, logical: u32) {
        if self.shadow.is_some() {
            let state = self.table.state(logical);
            let wear = self.table.wear(logical);
            let rc = self.table.read_counter(logical);
            let seq = self.cmd_seq;
            self.shadow.as_mut().expect("checked is_some").record(seq, logical, state, wear, rc);
        }
    }

    #[cfg(not(feature = "cmd-dma"))]
    fn shadow_record(&mut self, _logical: u32) {}

    /// Begin a command-DMA batch: snapshot the table and start accumulating
    /// deltas instead of trusting in-memory mutations immediately.
    #[cfg(feature = "cmd-dma")]
    pub fn begin_batch(&mut self) {
        self.shadow = Some(ShadowLog::begin(&self.table));
        self.cmd_seq = 0;
    }

    /// Dispatch the composed batch and reconcile the shadow log against the
    /// reported per-command outcomes.
    #[cfg(feature = "cmd-dma")]
    pub fn end_batch(&mut self) -> Result<()> {
        self.lld.execute_cmds(self.cmd_seq as u16)?;
        let outcomes = self.lld.event_status()?;
        let shadow = self.shadow.take().expect("end_batch called without begin_batch");

        let failure = outcomes.iter().find(|o| !matches!(o.status, EventStatus::Pass | EventStatus::CorrectableEcc));
        match failure {
            None => {
                self.table = shadow.commit();
                Ok(())
            }
            Some(fail) => {
                let (restored, dropped) = shadow.rollback(fail.tag);
                self.table = restored;
                for logical in dropped {
                    if matches!(fail.status, EventStatus::EraseFail | EventStatus::ProgramFail) {
                        let phys = self.table.state(logical).phys();
                        self.table.set_state(logical, BlockState::Bad(phys));
                    }
                    self.cache.invalidate_block(logical);
                }
                self.persist_block_table(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryLld;

    fn small_ftl(total_blocks: u32) -> Ftl<MemoryLld> {
        let lld = MemoryLld::new_default(total_blocks);
        let mut ftl = Ftl::new(lld, FtlConfigBuilder::new().with_num_free_blocks_gate(1)).unwrap();
        ftl.flash_format(false).unwrap();
        ftl
    }

    #[test]
    fn format_then_write_read_round_trips() {
        let mut ftl = small_ftl(16);
        let page_data_size = ftl.identify_device().page_data_size as usize;
        let data = vec![0xAB; page_data_size];
        ftl.page_write(0, &data).unwrap();
        let back = ftl.page_read(0).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn flush_cache_persists_writes_across_eviction() {
        let mut ftl = small_ftl(16);
        let page_data_size = ftl.identify_device().page_data_size as usize;
        let bds = ftl.identify_device().block_data_size() as u64;
        let data = vec![0x42; page_data_size];
        ftl.page_write(0, &data).unwrap();
        ftl.flush_cache().unwrap();
        ftl.cache.invalidate_all();
        let back = ftl.page_read(0).unwrap();
        assert_eq!(back, data);

        // Different logical block: should read back as all-0xFF (SPARE).
        let other = ftl.page_read(bds * 5).unwrap();
        assert!(other.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn remount_recovers_written_data() {
        let lld = MemoryLld::new_default(16);
        let mut ftl = Ftl::new(lld, FtlConfigBuilder::new().with_num_free_blocks_gate(1)).unwrap();
        ftl.flash_format(false).unwrap();
        let page_data_size = ftl.identify_device().page_data_size as usize;
        let data = vec![0x7E; page_data_size];
        ftl.page_write(0, &data).unwrap();
        ftl.flush_cache().unwrap();

        let Ftl { lld, .. } = ftl;
        let mut remounted = Ftl::new(lld, FtlConfigBuilder::new().with_num_free_blocks_gate(1)).unwrap();
        remounted.flash_init().unwrap();
        assert_eq!(remounted.page_read(0).unwrap(), data);
    }

    #[test]
    fn is_bad_block_reports_marked_blocks() {
        let mut ftl = small_ftl(16);
        let bds = ftl.identify_device().block_data_size() as u64;
        assert!(!ftl.is_bad_block(bds * 2));
        ftl.table.set_state(2, BlockState::Bad(2));
        assert!(ftl.is_bad_block(bds * 2));
    }

    #[test]
    fn garbage_collection_is_reentrancy_guarded() {
        let mut ftl = small_ftl(16);
        ftl.gc_in_progress.set(true);
        assert_eq!(ftl.garbage_collection().unwrap(), 0);
    }
}
