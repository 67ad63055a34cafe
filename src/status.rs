//! Operation outcome types.
//!
//! Unlike hard failures (`SpinelError`), these describe the normal results
//! of the operation state machines: a read can find nothing, and any
//! operation against a record that has left memory goes pending until its
//! device I/O completes.

/// Outcome of a read operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The key was found; carries the reader-produced output bytes.
    Found(Vec<u8>),
    /// The key is absent, tombstoned, or expired.
    NotFound,
    /// The record lives below the head address; the result will surface
    /// through `complete_pending` under this serial number.
    Pending(u64),
}

impl ReadOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, ReadOutcome::Pending(_))
    }
}

/// Outcome of an upsert or read-modify-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// No live record existed; a fresh record was appended.
    Created,
    /// The record was overwritten in the mutable region.
    InPlaceUpdated,
    /// A new version was appended behind the existing chain head.
    CopyUpdated,
    /// The operation needs a device read first; completes under this serial.
    Pending(u64),
}

impl UpdateOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, UpdateOutcome::Pending(_))
    }
}

/// Outcome of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The live record was in the mutable region and was tombstoned there.
    InPlace,
    /// A tombstone record was appended at the tail.
    Appended,
}

/// A completed formerly-pending operation, drained via `complete_pending`.
#[derive(Debug)]
pub enum CompletedOp {
    Read {
        serial: u64,
        result: crate::common::Result<ReadOutcome>,
    },
    Rmw {
        serial: u64,
        result: crate::common::Result<UpdateOutcome>,
    },
}

impl CompletedOp {
    pub fn serial(&self) -> u64 {
        match self {
            CompletedOp::Read { serial, .. } => *serial,
            CompletedOp::Rmw { serial, .. } => *serial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_predicates() {
        assert!(ReadOutcome::Pending(7).is_pending());
        assert!(!ReadOutcome::NotFound.is_pending());
        assert!(UpdateOutcome::Pending(3).is_pending());
        assert!(!UpdateOutcome::Created.is_pending());
    }
}
