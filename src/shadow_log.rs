//! Command-DMA delta log and rollback.
//!
//! Present only under the `cmd-dma` feature. When the LLD batches commands,
//! every in-memory mutation to the block table is recorded here instead of
//! being trusted immediately; on batch completion the log is replayed
//! against a pre-batch snapshot (all succeeded) or used to partially apply
//! and then discard (one failed).

use crate::block_table::{BlockState, BlockTable};

/// One recorded mutation to a logical block's table entry, tagged with the
/// command sequence number that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delta {
    pub ftl_cmd_seq: u32,
    pub logical: u32,
    pub state: BlockState,
    pub wear: u8,
    pub read_counter: u16,
}

/// Accumulates [`Delta`]s for one in-flight command-DMA batch against a
/// snapshot taken at batch start.
#[derive(Clone, Debug)]
pub struct ShadowLog {
    snapshot: BlockTable,
    deltas: Vec<Delta>,
}

impl ShadowLog {
    /// Begin a new batch, snapshotting the table as it is right now.
    pub fn begin(table: &BlockTable) -> Self {
        Self {
            snapshot: table.clone(),
            deltas: Vec::new(),
        }
    }

    /// Record that `logical`'s entry changed to `state`/`wear`/`read_counter`
    /// as part of command `ftl_cmd_seq`.
    pub fn record(&mut self, ftl_cmd_seq: u32, logical: u32, state: BlockState, wear: u8, read_counter: u16) {
        self.deltas.push(Delta {
            ftl_cmd_seq,
            logical,
            state,
            wear,
            read_counter,
        });
    }

    /// All deltas recorded so far, in submission order.
    pub fn deltas(&self) -> &[Delta] {
        &self.deltas
    }

    /// Every command succeeded: replay all deltas onto the snapshot so it
    /// becomes the new baseline, and clear the log for the next batch.
    pub fn commit(mut self) -> BlockTable {
        for d in &self.deltas {
            self.snapshot.set_state(d.logical, d.state);
            self.snapshot.set_wear(d.logical, d.wear);
            self.snapshot.set_read_counter(d.logical, d.read_counter);
        }
        self.snapshot
    }

    /// A command at batch index `failed_at` (0-based, by submission order)
    /// failed. Apply every delta whose `ftl_cmd_seq` precedes `failed_at`
    /// onto the snapshot (those writes happened), discard the rest, and
    /// return the reconciled table along with the logical blocks whose
    /// pending (unreplayed) deltas were dropped, for the caller to mark bad
    /// or invalidate in cache as appropriate.
    pub fn rollback(mut self, failed_at: u32) -> (BlockTable, Vec<u32>) {
        let mut dropped = Vec::new();
        for d in &self.deltas {
            if d.ftl_cmd_seq < failed_at {
                self.snapshot.set_state(d.logical, d.state);
                self.snapshot.set_wear(d.logical, d.wear);
                self.snapshot.set_read_counter(d.logical, d.read_counter);
            } else {
                dropped.push(d.logical);
            }
        }
        dropped.sort_unstable();
        dropped.dedup();
        (self.snapshot, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_replays_every_delta() {
        let table = BlockTable::new_identity(2, 0, false);
        let mut log = ShadowLog::begin(&table);
        log.record(0, 0, BlockState::Data(0), 1, 0);
        log.record(1, 1, BlockState::Discard(1), 2, 0);
        let committed = log.commit();
        assert_eq!(committed.state(0), BlockState::Data(0));
        assert_eq!(committed.wear(0), 1);
        assert_eq!(committed.state(1), BlockState::Discard(1));
    }

    #[test]
    fn rollback_applies_only_pre_failure_deltas() {
        let table = BlockTable::new_identity(2, 0, false);
        let mut log = ShadowLog::begin(&table);
        log.record(0, 0, BlockState::Data(0), 1, 0);
        log.record(1, 1, BlockState::Discard(1), 2, 0);
        let (rolled_back, dropped) = log.rollback(1);
        assert_eq!(rolled_back.state(0), BlockState::Data(0));
        assert_eq!(rolled_back.state(1), BlockState::Spare(1));
        assert_eq!(dropped, vec![1]);
    }
}
