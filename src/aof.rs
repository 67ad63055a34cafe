//! Append-only operation log with replica tail-sync.
//!
//! The AOF records logical operations, not record bytes: each append is a
//! length-prefixed envelope `{previous, current, next, payload_len,
//! payload}` so a reader can walk the stream in either direction. A
//! single appender holds the commit lock; commit is synchronous
//! (`SyncMode::Always`) or driven by the background group-commit task.
//! Replicas hold cursors into the stream; prefix truncation never passes
//! the slowest acknowledged cursor, and a replica asking to start behind
//! the truncation point is rejected unless the AOF is configured lossy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{AofConfig, Result, SpinelError, SyncMode};
use crate::device::{read_blocking, write_blocking, StorageDevice};

/// Envelope header size: previous + current + next + payload length.
pub const ENVELOPE_HEADER: u64 = 28;

/// Receiving side of replica tail-sync. Returning `Ok` from `send`
/// acknowledges the chunk.
pub trait ReplicaClient: Send + Sync {
    fn send(&self, bytes: &[u8]) -> Result<()>;
}

/// A replica's position in the AOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaCursor {
    /// Everything below this is acknowledged by the replica.
    pub previous_address: u64,
    /// Everything below this has been handed to the client.
    pub tail_address: u64,
}

struct Replica {
    cursor: ReplicaCursor,
    client: Arc<dyn ReplicaClient>,
}

struct AppendState {
    tail: u64,
    last_record: u64,
}

/// A logical operation carried in an AOF envelope payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AofOp {
    Upsert {
        key: Vec<u8>,
        value: Vec<u8>,
        expiration: Option<u64>,
    },
    Rmw {
        key: Vec<u8>,
        input: Vec<u8>,
    },
    Delete {
        key: Vec<u8>,
    },
}

impl AofOp {
    const KIND_UPSERT: u8 = 1;
    const KIND_RMW: u8 = 2;
    const KIND_DELETE: u8 = 3;
    const FLAG_EXPIRATION: u8 = 0x10;

    pub fn encode(&self) -> Vec<u8> {
        fn put(out: &mut Vec<u8>, bytes: &[u8]) {
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        let mut out = Vec::new();
        match self {
            AofOp::Upsert {
                key,
                value,
                expiration,
            } => {
                let mut kind = Self::KIND_UPSERT;
                if expiration.is_some() {
                    kind |= Self::FLAG_EXPIRATION;
                }
                out.push(kind);
                if let Some(expires_at) = expiration {
                    out.extend_from_slice(&expires_at.to_le_bytes());
                }
                put(&mut out, key);
                put(&mut out, value);
            }
            AofOp::Rmw { key, input } => {
                out.push(Self::KIND_RMW);
                put(&mut out, key);
                put(&mut out, input);
            }
            AofOp::Delete { key } => {
                out.push(Self::KIND_DELETE);
                put(&mut out, key);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<AofOp> {
        fn take<'a>(bytes: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
            if bytes.len() < n {
                return Err(SpinelError::Corruption {
                    message: "truncated AOF payload".to_string(),
                });
            }
            let (head, rest) = bytes.split_at(n);
            *bytes = rest;
            Ok(head)
        }
        fn field(bytes: &mut &[u8]) -> Result<Vec<u8>> {
            let len = u32::from_le_bytes(take(bytes, 4)?.try_into().unwrap()) as usize;
            Ok(take(bytes, len)?.to_vec())
        }

        let mut rest = bytes;
        let kind_byte = take(&mut rest, 1)?[0];
        match kind_byte & 0x0f {
            Self::KIND_UPSERT => {
                let expiration = if kind_byte & Self::FLAG_EXPIRATION != 0 {
                    Some(u64::from_le_bytes(take(&mut rest, 8)?.try_into().unwrap()))
                } else {
                    None
                };
                Ok(AofOp::Upsert {
                    key: field(&mut rest)?,
                    value: field(&mut rest)?,
                    expiration,
                })
            }
            Self::KIND_RMW => Ok(AofOp::Rmw {
                key: field(&mut rest)?,
                input: field(&mut rest)?,
            }),
            Self::KIND_DELETE => Ok(AofOp::Delete {
                key: field(&mut rest)?,
            }),
            other => Err(SpinelError::Corruption {
                message: format!("unknown AOF op kind {}", other),
            }),
        }
    }
}

/// Counters surfaced by [`AofLog::stats`].
#[derive(Debug, Clone)]
pub struct AofStats {
    pub tail_address: u64,
    pub committed_until: u64,
    pub truncated_until: u64,
    pub replica_count: usize,
}

/// The append-only operation log.
pub struct AofLog {
    device: Arc<dyn StorageDevice>,
    options: AofConfig,
    sync_mode: SyncMode,
    append: Mutex<AppendState>,
    tail: AtomicU64,
    committed_until: AtomicU64,
    truncated_until: AtomicU64,
    replicas: Mutex<HashMap<u64, Replica>>,
    next_replica_id: AtomicU64,
}

impl AofLog {
    pub fn new(
        device: Arc<dyn StorageDevice>,
        options: AofConfig,
        sync_mode: SyncMode,
    ) -> Arc<Self> {
        let tail = device.size();
        let truncated = device.truncated_until();
        Arc::new(Self {
            device,
            options,
            sync_mode,
            append: Mutex::new(AppendState {
                tail,
                last_record: truncated,
            }),
            tail: AtomicU64::new(tail),
            committed_until: AtomicU64::new(tail),
            truncated_until: AtomicU64::new(truncated),
            replicas: Mutex::new(HashMap::new()),
            next_replica_id: AtomicU64::new(1),
        })
    }

    pub fn options(&self) -> &AofConfig {
        &self.options
    }

    pub fn tail_address(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    pub fn committed_until(&self) -> u64 {
        self.committed_until.load(Ordering::Acquire)
    }

    pub fn truncated_until(&self) -> u64 {
        self.truncated_until.load(Ordering::Acquire)
    }

    /// Appends one operation envelope; returns its address. Append order
    /// is commit order: the append lock is the single-appender gate.
    pub fn append(&self, op: &AofOp) -> Result<u64> {
        let payload = op.encode();
        let current = {
            let mut state = self.append.lock();
            let current = state.tail;
            let next = current + ENVELOPE_HEADER + payload.len() as u64;

            let mut envelope = Vec::with_capacity(ENVELOPE_HEADER as usize + payload.len());
            envelope.extend_from_slice(&state.last_record.to_le_bytes());
            envelope.extend_from_slice(&current.to_le_bytes());
            envelope.extend_from_slice(&next.to_le_bytes());
            envelope.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            envelope.extend_from_slice(&payload);

            write_blocking(self.device.as_ref(), current, &envelope)?;
            state.last_record = current;
            state.tail = next;
            self.tail.store(next, Ordering::Release);
            current
        };
        match self.sync_mode {
            SyncMode::Always => self.commit()?,
            SyncMode::Periodic | SyncMode::None => {}
        }
        Ok(current)
    }

    /// Makes everything appended so far durable and visible to replica
    /// streaming.
    pub fn commit(&self) -> Result<()> {
        let tail = self.tail_address();
        if tail > self.committed_until() {
            self.device.flush()?;
            self.committed_until.fetch_max(tail, Ordering::AcqRel);
            log::trace!("aof committed through {:#x}", tail);
        }
        Ok(())
    }

    /// Registers a replica cursor starting at `start_address`.
    pub fn register_replica(
        &self,
        start_address: u64,
        client: Arc<dyn ReplicaClient>,
    ) -> Result<u64> {
        let truncated = self.truncated_until();
        let start = if start_address < truncated {
            if !self.options.lossy {
                return Err(SpinelError::ReplicaTooFarBehind {
                    start_address,
                    truncated_until: truncated,
                });
            }
            log::warn!(
                "lossy AOF: replica start {:#x} clamped to truncation point {:#x}",
                start_address,
                truncated
            );
            truncated
        } else {
            start_address
        };
        let id = self.next_replica_id.fetch_add(1, Ordering::AcqRel);
        self.replicas.lock().insert(
            id,
            Replica {
                cursor: ReplicaCursor {
                    previous_address: start,
                    tail_address: start,
                },
                client,
            },
        );
        log::info!("registered replica {} at {:#x}", id, start);
        Ok(id)
    }

    pub fn remove_replica(&self, id: u64) {
        self.replicas.lock().remove(&id);
    }

    pub fn cursor(&self, id: u64) -> Option<ReplicaCursor> {
        self.replicas.lock().get(&id).map(|r| r.cursor)
    }

    /// Streams committed bytes to every replica behind the commit point.
    /// Cursors advance only on acknowledgment; a failed send leaves the
    /// cursor for the next pass. Returns the total bytes acknowledged.
    pub fn stream_pending(&self) -> usize {
        let committed = self.committed_until();
        let mut sent_total = 0usize;
        let mut replicas = self.replicas.lock();
        for (id, replica) in replicas.iter_mut() {
            let from = replica.cursor.previous_address;
            if committed <= from {
                continue;
            }
            let len = (committed - from) as u32;
            let bytes = match read_blocking(self.device.as_ref(), from, len) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("replica {}: AOF read at {:#x} failed: {}", id, from, e);
                    continue;
                }
            };
            replica.cursor.tail_address = committed;
            match replica.client.send(&bytes) {
                Ok(()) => {
                    replica.cursor.previous_address = committed;
                    sent_total += bytes.len();
                }
                Err(e) => {
                    log::warn!("replica {}: send failed, will retry: {}", id, e);
                }
            }
        }
        sent_total
    }

    /// Truncates the AOF prefix below `address`, but never past the
    /// slowest replica's acknowledged position, and always on an AOF page
    /// boundary. Returns the new truncation point.
    pub fn safe_truncate_until(&self, address: u64) -> Result<u64> {
        let min_cursor = {
            let replicas = self.replicas.lock();
            replicas
                .values()
                .map(|r| r.cursor.previous_address)
                .min()
                .unwrap_or(u64::MAX)
        };
        let page = self.options.page_size as u64;
        let safe = address.min(min_cursor) / page * page;
        if safe <= self.truncated_until() {
            return Ok(self.truncated_until());
        }
        let cut = self.device.truncate_until(safe)?;
        self.truncated_until.fetch_max(cut, Ordering::AcqRel);
        log::debug!("aof truncated to {:#x}", self.truncated_until());
        Ok(self.truncated_until())
    }

    /// Walks committed envelopes starting at `from` (which must be an
    /// envelope boundary at or above the truncation point). Used for
    /// post-checkpoint replay during recovery.
    pub fn read_ops_from(&self, from: u64) -> Result<Vec<(u64, AofOp)>> {
        let committed = self.committed_until();
        let mut cursor = from.max(self.truncated_until());
        let mut ops = Vec::new();
        while cursor + ENVELOPE_HEADER <= committed {
            let header = read_blocking(self.device.as_ref(), cursor, ENVELOPE_HEADER as u32)?;
            let current = u64::from_le_bytes(header[8..16].try_into().unwrap());
            let next = u64::from_le_bytes(header[16..24].try_into().unwrap());
            let payload_len = u32::from_le_bytes(header[24..28].try_into().unwrap());
            if next <= cursor || payload_len == 0 {
                break;
            }
            if current != cursor {
                return Err(SpinelError::Corruption {
                    message: format!(
                        "AOF envelope at {:#x} claims address {:#x}",
                        cursor, current
                    ),
                });
            }
            if next > committed {
                break;
            }
            let payload = read_blocking(
                self.device.as_ref(),
                cursor + ENVELOPE_HEADER,
                payload_len,
            )?;
            ops.push((cursor, AofOp::decode(&payload)?));
            cursor = next;
        }
        Ok(ops)
    }

    pub fn stats(&self) -> AofStats {
        AofStats {
            tail_address: self.tail_address(),
            committed_until: self.committed_until(),
            truncated_until: self.truncated_until(),
            replica_count: self.replicas.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    struct CollectingClient {
        received: Mutex<Vec<u8>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl CollectingClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    impl ReplicaClient for CollectingClient {
        fn send(&self, bytes: &[u8]) -> Result<()> {
            if self.fail.load(Ordering::Acquire) {
                return Err(SpinelError::Storage {
                    message: "replica link down".to_string(),
                });
            }
            self.received.lock().extend_from_slice(bytes);
            Ok(())
        }
    }

    fn test_aof(lossy: bool) -> Arc<AofLog> {
        let options = AofConfig {
            enabled: true,
            main_memory: true,
            lossy,
            page_size: 64,
            commit_interval_ms: 10,
        };
        AofLog::new(
            Arc::new(MemoryDevice::default()),
            options,
            SyncMode::Always,
        )
    }

    #[test]
    fn test_op_encoding_roundtrip() {
        let ops = vec![
            AofOp::Upsert {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                expiration: None,
            },
            AofOp::Upsert {
                key: b"k2".to_vec(),
                value: b"v2".to_vec(),
                expiration: Some(12345),
            },
            AofOp::Rmw {
                key: b"counter".to_vec(),
                input: 5u64.to_le_bytes().to_vec(),
            },
            AofOp::Delete { key: b"gone".to_vec() },
        ];
        for op in ops {
            assert_eq!(AofOp::decode(&op.encode()).unwrap(), op);
        }
    }

    #[test]
    fn test_append_order_equals_read_order() {
        let aof = test_aof(false);
        let mut addresses = Vec::new();
        for i in 0..10u32 {
            let op = AofOp::Upsert {
                key: i.to_le_bytes().to_vec(),
                value: vec![i as u8; 8],
                expiration: None,
            };
            addresses.push(aof.append(&op).unwrap());
        }
        let ops = aof.read_ops_from(0).unwrap();
        assert_eq!(ops.len(), 10);
        for (i, (addr, op)) in ops.iter().enumerate() {
            assert_eq!(*addr, addresses[i]);
            match op {
                AofOp::Upsert { key, .. } => {
                    assert_eq!(key, &(i as u32).to_le_bytes().to_vec())
                }
                other => panic!("unexpected op {:?}", other),
            }
        }
    }

    #[test]
    fn test_replica_observes_prefix() {
        let aof = test_aof(false);
        let client = CollectingClient::new();
        let id = aof.register_replica(0, client.clone()).unwrap();

        for i in 0..5u32 {
            aof.append(&AofOp::Delete {
                key: i.to_le_bytes().to_vec(),
            })
            .unwrap();
        }
        let sent = aof.stream_pending();
        assert!(sent > 0);
        assert_eq!(aof.cursor(id).unwrap().previous_address, aof.committed_until());

        // The replica holds a well-formed prefix: the envelope chain walks
        // cleanly from byte zero through everything received.
        let received = client.received.lock().clone();
        assert_eq!(received.len() as u64, aof.committed_until());
        let mut cursor = 0u64;
        let mut count = 0;
        while cursor + ENVELOPE_HEADER <= received.len() as u64 {
            let base = cursor as usize;
            let current = u64::from_le_bytes(received[base + 8..base + 16].try_into().unwrap());
            let next = u64::from_le_bytes(received[base + 16..base + 24].try_into().unwrap());
            assert_eq!(current, cursor);
            assert!(next > cursor);
            cursor = next;
            count += 1;
        }
        assert_eq!(count, 5);
    }

    #[test]
    fn test_failed_send_leaves_cursor() {
        let aof = test_aof(false);
        let client = CollectingClient::new();
        client.fail.store(true, Ordering::Release);
        let id = aof.register_replica(0, client.clone()).unwrap();

        aof.append(&AofOp::Delete { key: b"k".to_vec() }).unwrap();
        assert_eq!(aof.stream_pending(), 0);
        assert_eq!(aof.cursor(id).unwrap().previous_address, 0);

        client.fail.store(false, Ordering::Release);
        assert!(aof.stream_pending() > 0);
        assert_eq!(aof.cursor(id).unwrap().previous_address, aof.committed_until());
    }

    #[test]
    fn test_truncation_respects_replica_cursor() {
        let aof = test_aof(false);
        let client = CollectingClient::new();
        let id = aof.register_replica(0, client).unwrap();

        for _ in 0..10 {
            aof.append(&AofOp::Delete { key: vec![0u8; 32] }).unwrap();
        }
        // The replica has acknowledged nothing, so nothing may go.
        let cut = aof.safe_truncate_until(aof.committed_until()).unwrap();
        assert_eq!(cut, 0);

        aof.stream_pending();
        let acked = aof.cursor(id).unwrap().previous_address;
        let cut = aof.safe_truncate_until(aof.committed_until()).unwrap();
        assert!(cut <= acked);
        assert!(cut % 64 == 0);
    }

    #[test]
    fn test_replica_behind_truncation_is_rejected_when_not_lossy() {
        let aof = test_aof(false);
        for _ in 0..10 {
            aof.append(&AofOp::Delete { key: vec![0u8; 32] }).unwrap();
        }
        aof.safe_truncate_until(aof.committed_until()).unwrap();
        let truncated = aof.truncated_until();
        assert!(truncated > 0);

        let result = aof.register_replica(0, CollectingClient::new());
        assert!(matches!(
            result,
            Err(SpinelError::ReplicaTooFarBehind { .. })
        ));
    }

    #[test]
    fn test_lossy_mode_clamps_replica_start() {
        let aof = test_aof(true);
        for _ in 0..10 {
            aof.append(&AofOp::Delete { key: vec![0u8; 32] }).unwrap();
        }
        aof.safe_truncate_until(aof.committed_until()).unwrap();
        let truncated = aof.truncated_until();
        assert!(truncated > 0);

        let id = aof.register_replica(0, CollectingClient::new()).unwrap();
        assert_eq!(aof.cursor(id).unwrap().previous_address, truncated);
    }
}
