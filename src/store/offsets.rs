//! Pattern-offset state: one row per generation-parameter hash.
//!
//! `reserve` is the single contended write point between concurrent
//! generation campaigns. It runs read-modify-write inside one transaction
//! (the connection mutex serializes in-process callers; the transaction
//! covers replicas sharing the file).

use rusqlite::{OptionalExtension, params};

use super::CampaignStore;
use crate::errors::StoreError;

impl CampaignStore {
    /// Current offset for a hash; 0 if the hash has never reserved.
    pub fn peek_offset(&self, config_hash: &str) -> Result<i64, StoreError> {
        let offset = self
            .conn
            .query_row(
                "SELECT last_offset FROM domain_generation_phase_config_state
                 WHERE config_hash = ?1",
                params![config_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset.unwrap_or(0))
    }

    /// Atomically advance `last_offset` by `count` and return the pre-image:
    /// the starting offset of the reserved range.
    pub fn reserve_offsets(&self, config_hash: &str, count: i64) -> Result<i64, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO domain_generation_phase_config_state
                 (config_hash, last_offset, updated_at)
             VALUES (?1, 0, ?2)",
            params![config_hash, Self::now()],
        )?;
        let start: i64 = tx.query_row(
            "SELECT last_offset FROM domain_generation_phase_config_state
             WHERE config_hash = ?1",
            params![config_hash],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE domain_generation_phase_config_state
             SET last_offset = last_offset + ?1, updated_at = ?2
             WHERE config_hash = ?3",
            params![count, Self::now(), config_hash],
        )?;
        tx.commit()?;
        Ok(start)
    }
}
