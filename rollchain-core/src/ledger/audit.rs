//! Chain verification and orphan detection

use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

use super::hasher::block_hash;
use crate::model::{LedgerBlock, ATTENDANCE_MARKED, GENESIS_PREVIOUS_HASH};
use crate::store::{AttendanceStore, LedgerStore, StoreError};

const PAGE_SIZE: usize = 256;

/// First point where the stored chain stops being a valid chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainBreak {
    Gap {
        expected: u64,
        found: u64,
    },
    PreviousHashMismatch {
        block_number: u64,
        expected: String,
        found: String,
    },
    HashMismatch {
        block_number: u64,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub blocks_checked: u64,
    pub tail_hash: Option<String>,
    pub break_at: Option<ChainBreak>,
}

impl ChainReport {
    pub fn is_valid(&self) -> bool {
        self.break_at.is_none()
    }
}

/// Walk the whole ledger from block 1, recomputing every hash and link
pub async fn verify_chain(store: &dyn LedgerStore) -> Result<ChainReport, StoreError> {
    let mut expected_number = 1u64;
    let mut previous_hash = GENESIS_PREVIOUS_HASH.to_string();

    loop {
        let page = store.blocks_from(expected_number, PAGE_SIZE).await?;
        if page.is_empty() {
            break;
        }

        for block in &page {
            if let Some(broken) = check_block(block, expected_number, &previous_hash) {
                warn!(target: "integrity", "Ledger chain broken: {:?}", broken);
                return Ok(ChainReport {
                    blocks_checked: expected_number - 1,
                    tail_hash: Some(previous_hash).filter(|h| h != GENESIS_PREVIOUS_HASH),
                    break_at: Some(broken),
                });
            }
            previous_hash = block.hash.clone();
            expected_number += 1;
        }
    }

    let blocks_checked = expected_number - 1;
    info!("Ledger chain verified: {} blocks", blocks_checked);
    Ok(ChainReport {
        blocks_checked,
        tail_hash: (blocks_checked > 0).then_some(previous_hash),
        break_at: None,
    })
}

fn check_block(
    block: &LedgerBlock,
    expected_number: u64,
    previous_hash: &str,
) -> Option<ChainBreak> {
    if block.block_number != expected_number {
        return Some(ChainBreak::Gap {
            expected: expected_number,
            found: block.block_number,
        });
    }
    if block.previous_hash != previous_hash {
        return Some(ChainBreak::PreviousHashMismatch {
            block_number: block.block_number,
            expected: previous_hash.to_string(),
            found: block.previous_hash.clone(),
        });
    }
    let recomputed = block_hash(&block.payload, &block.previous_hash);
    if block.hash != recomputed {
        return Some(ChainBreak::HashMismatch {
            block_number: block.block_number,
            expected: recomputed,
            found: block.hash.clone(),
        });
    }
    None
}

/// Attendance blocks whose record was never persisted
///
/// These are the accepted leftovers of a record write failing after the
/// block was appended; they are reported, never removed.
pub async fn orphaned_blocks(
    ledger: &dyn LedgerStore,
    attendance: &dyn AttendanceStore,
) -> Result<Vec<LedgerBlock>, StoreError> {
    let record_ids: HashSet<String> = attendance.record_ids().await?.into_iter().collect();
    let mut orphans = Vec::new();
    let mut from = 1u64;

    loop {
        let page = ledger.blocks_from(from, PAGE_SIZE).await?;
        let Some(last) = page.last() else {
            break;
        };
        from = last.block_number + 1;

        orphans.extend(page.into_iter().filter(|block| {
            block.payload.get("action").and_then(|a| a.as_str()) == Some(ATTENDANCE_MARKED)
                && block
                    .payload
                    .get("attendance_id")
                    .and_then(|id| id.as_str())
                    .is_some_and(|id| !record_ids.contains(id))
        }));
    }

    if !orphans.is_empty() {
        info!("Found {} orphaned attendance blocks", orphans.len());
    }
    Ok(orphans)
}
