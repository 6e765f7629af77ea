//! Per-turn scratch buffer

use crate::error::RoutingFault;
use crate::types::TranscriptTurn;

use super::profile::ProfileWrite;

/// Result of a completed delegated sub-turn
#[derive(Debug, Clone)]
pub struct DelegationRecord {
    pub persona: String,
    pub output: String,
    /// Turns the sub-turn adds to the session: the user's message, then the target's answer
    pub exchange: Vec<TranscriptTurn>,
    /// Writes staged by the delegated persona, merged only if the delegation is accepted
    pub writes: Vec<ProfileWrite>,
}

/// Transient state collected while a single turn runs. Never persisted on its own.
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    writes: Vec<ProfileWrite>,
    delegation: Option<DelegationRecord>,
    delegation_attempts: usize,
    faults: Vec<RoutingFault>,
}

impl ScratchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, write: ProfileWrite) {
        self.writes.push(write);
    }

    pub fn stage_all(&mut self, writes: impl IntoIterator<Item = ProfileWrite>) {
        self.writes.extend(writes);
    }

    pub fn writes(&self) -> &[ProfileWrite] {
        &self.writes
    }

    /// Most recent staged value for `key`
    pub fn staged_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.writes.iter().rev().find(|w| w.key == key).map(|w| &w.value)
    }

    /// Marker for [`ScratchBuffer::rollback`]
    pub fn checkpoint(&self) -> usize {
        self.writes.len()
    }

    /// Drop writes staged after `checkpoint`
    pub fn rollback(&mut self, checkpoint: usize) {
        self.writes.truncate(checkpoint);
    }

    /// Count a delegation attempt and return the running total
    pub fn note_delegation_attempt(&mut self) -> usize {
        self.delegation_attempts += 1;
        self.delegation_attempts
    }

    pub fn delegation_attempts(&self) -> usize {
        self.delegation_attempts
    }

    pub fn record_delegation(&mut self, record: DelegationRecord) {
        self.delegation = Some(record);
    }

    pub fn delegation(&self) -> Option<&DelegationRecord> {
        self.delegation.as_ref()
    }

    pub fn take_delegation(&mut self) -> Option<DelegationRecord> {
        self.delegation.take()
    }

    pub fn record_fault(&mut self, fault: RoutingFault) {
        self.faults.push(fault);
    }

    pub fn faults(&self) -> &[RoutingFault] {
        &self.faults
    }

    pub fn into_writes(self) -> Vec<ProfileWrite> {
        self.writes
    }
}
