//! Transaction-wide storage states and side effects.
//!
//! Every `(contract, slot)` the transaction touches gets a tracked entry:
//! the pre-image snapshotted from the host on first touch, the current
//! post-image, and the canonical diff between the two. Reads hit the
//! post-image first, so a transaction observes its own writes; nothing
//! reaches the host until it commits the finalised change set.

use crate::host::HostInterface;
use crate::types::*;
use lbor::{lbor_decode, lbor_encode, ValueDiff};

/// Before/after/diff for one mutated slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub before: lbor::Value,
    pub after: lbor::Value,
    pub diff: ValueDiff,
}

/// One finalised mutation, in first-touch order, as handed to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChangeEntry {
    pub contract: ContractAddress,
    pub slot: String,
    pub before: lbor::Value,
    pub after: lbor::Value,
    /// Wire form of the delta; `apply(before, diff) == after`.
    pub diff_bytes: Vec<u8>,
}

pub type StorageChangeSet = Vec<StorageChangeEntry>;

#[derive(Debug, Default)]
pub struct StorageTrack {
    changes: IndexMap<(ContractAddress, String), StorageChange>,
}

impl StorageTrack {
    pub fn new() -> Self {
        Self {
            changes: index_map_new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn clear(&mut self) {
        self.changes.clear();
    }

    /// Current effective value of a slot: the transaction's own post-image
    /// when present, the host's stored value otherwise. Absent slots read
    /// as `Null`.
    pub fn effective_read(
        &self,
        host: &dyn HostInterface,
        contract: &ContractAddress,
        slot: &str,
    ) -> Result<lbor::Value, StorageError> {
        if let Some(change) = self.changes.get(&(contract.clone(), slot.to_owned())) {
            return Ok(change.after.clone());
        }
        self.host_read(host, contract, slot)
    }

    fn host_read(
        &self,
        host: &dyn HostInterface,
        contract: &ContractAddress,
        slot: &str,
    ) -> Result<lbor::Value, StorageError> {
        match host
            .storage_get(contract, slot)
            .map_err(StorageError::CommitRejected)?
        {
            Some(bytes) => Ok(lbor_decode(&bytes)?),
            None => Ok(lbor::Value::Null),
        }
    }

    /// Records a write. The first write of a slot snapshots the pre-image;
    /// later writes keep that pre-image and recompute the diff against it.
    /// Deletion is a write of `Null`.
    pub fn write(
        &mut self,
        host: &dyn HostInterface,
        contract: &ContractAddress,
        slot: &str,
        after: lbor::Value,
    ) -> Result<(), StorageError> {
        let key = (contract.clone(), slot.to_owned());
        match self.changes.get_mut(&key) {
            None => {
                let before = self.host_read(host, contract, slot)?;
                let diff = lbor::lbor_diff(&before, &after);
                self.changes.insert(
                    key,
                    StorageChange {
                        before,
                        after,
                        diff,
                    },
                );
            }
            Some(change) => {
                change.diff = lbor::lbor_diff(&change.before, &after);
                change.after = after;
            }
        }
        Ok(())
    }

    /// Finalises the captured changes into the change set handed to the
    /// host, in first-touch order. Untouched-in-effect entries (written
    /// back to the pre-image) are dropped.
    pub fn finalize(self) -> Result<StorageChangeSet, StorageError> {
        let mut entries = Vec::with_capacity(self.changes.len());
        for ((contract, slot), change) in self.changes {
            if change.before == change.after {
                continue;
            }
            let diff_bytes = change.diff.to_bytes()?;
            entries.push(StorageChangeEntry {
                contract,
                slot,
                before: change.before,
                after: change.after,
                diff_bytes,
            });
        }
        Ok(entries)
    }
}

/// Encodes a post-image for host-side persistence.
pub fn encode_slot_value(value: &lbor::Value) -> Result<Vec<u8>, StorageError> {
    Ok(lbor_encode(value)?)
}
