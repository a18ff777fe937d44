use crate::device::DeviceInfo;
use crate::error::Result;

/// How the low-level driver accepts and reports on commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LldMode {
    /// Every `LldPort` call completes synchronously before returning.
    Polled,
    /// Commands are queued and only dispatched on `execute_cmds`; their
    /// outcomes are collected later via `event_status`.
    CmdDma,
}

/// Per-command completion status reported by a command-DMA batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventStatus {
    Pass,
    CorrectableEcc,
    UncorrectableEcc,
    ProgramFail,
    EraseFail,
    DmaFail,
}

/// One completed command's outcome, as reported by [`LldPort::event_status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandOutcome {
    pub tag: u32,
    pub block: u32,
    pub page: u16,
    pub status: EventStatus,
}

/// The FTL's external collaborator: a raw NAND device capability.
///
/// This is the only boundary the FTL crosses. Implementors own ECC, timing,
/// controller register layout, DMA descriptor composition, and (in
/// `CmdDma` mode) command batching; the FTL only ever calls these methods.
///
/// The two CMD-DMA-only methods have no-op default implementations so that a
/// `Polled` implementor needs to write nothing extra, and so the FTL's write
/// path can call them unconditionally rather than forking into two code
/// paths keyed on mode.
pub trait LldPort {
    /// Device geometry and capability flags, read once at init.
    fn device_info(&self) -> DeviceInfo;

    /// How this implementor accepts commands.
    fn mode(&self) -> LldMode {
        LldMode::Polled
    }

    /// Read `count` main-area pages starting at `page` of block `phys_blk`
    /// into `buf` (`buf.len() >= count * page_data_size`).
    fn read_page_main(&mut self, phys_blk: u32, page: u16, count: u16, buf: &mut [u8]) -> Result<()>;

    /// Read one page's main area and spare area.
    fn read_page_main_spare(
        &mut self,
        phys_blk: u32,
        page: u16,
        buf: &mut [u8],
        spare: &mut [u8],
    ) -> Result<()>;

    /// Read one page's spare area only.
    fn read_page_spare(&mut self, phys_blk: u32, page: u16, spare: &mut [u8]) -> Result<()>;

    /// Program `count` main-area pages starting at `page` of block `phys_blk`.
    fn write_page_main(&mut self, phys_blk: u32, page: u16, count: u16, buf: &[u8]) -> Result<()>;

    /// Program one page's main area and spare area together.
    fn write_page_main_spare(
        &mut self,
        phys_blk: u32,
        page: u16,
        buf: &[u8],
        spare: &[u8],
    ) -> Result<()>;

    /// Program one page's spare area only.
    fn write_page_spare(&mut self, phys_blk: u32, page: u16, spare: &[u8]) -> Result<()>;

    /// Erase an entire physical block.
    fn erase_block(&mut self, phys_blk: u32) -> Result<()>;

    /// Whether the device's factory bad-block marker is set for `phys_blk`.
    fn is_factory_bad_block(&self, phys_blk: u32) -> bool;

    /// Dispatch up to `n` previously composed commands as one batch.
    /// No-op under [`LldMode::Polled`].
    fn execute_cmds(&mut self, _n: u16) -> Result<()> {
        Ok(())
    }

    /// Drain completion status for the most recently executed batch.
    /// Returns empty under [`LldMode::Polled`].
    fn event_status(&mut self) -> Result<Vec<CommandOutcome>> {
        Ok(Vec::new())
    }
}
