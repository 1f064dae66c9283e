use std::io::Write;
use std::net::TcpStream;
use std::sync::Mutex;

use tracing::{debug, warn};

/// Monotonically assigned per-connection identity; the registry keys replica
/// records by it so writer comparisons stay stable across calls.
pub type ConnectionId = u64;

struct ReplicaRecord<W> {
    id: ConnectionId,
    writer: W,
    #[allow(dead_code)]
    replid: String,
    acked_offset: u64,
}

struct RegistryInner<W> {
    replicas: Vec<ReplicaRecord<W>>,
    master_offset: u64,
}

/// Master-side registry of replica writers plus the replication offset.
/// Generic over the writer so the bookkeeping is testable off-socket.
pub struct ReplicaRegistry<W: Write = TcpStream> {
    inner: Mutex<RegistryInner<W>>,
}

impl<W: Write> ReplicaRegistry<W> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                replicas: Vec::new(),
                master_offset: 0,
            }),
        }
    }

    pub fn add_replica(&self, id: ConnectionId, writer: W, replid: &str, acked_offset: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.replicas.push(ReplicaRecord {
            id,
            writer,
            replid: replid.to_string(),
            acked_offset,
        });
        debug!(connection = id, total = inner.replicas.len(), "replica registered");
    }

    pub fn remove(&self, id: ConnectionId) {
        let mut inner = self.inner.lock().unwrap();
        inner.replicas.retain(|r| r.id != id);
    }

    pub fn replica_count(&self) -> usize {
        self.inner.lock().unwrap().replicas.len()
    }

    pub fn master_offset(&self) -> u64 {
        self.inner.lock().unwrap().master_offset
    }

    /// Writes `bytes` to every registered replica, dropping writers that
    /// fail, then advances the master offset by the payload length.
    pub fn broadcast(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.replicas.retain_mut(|replica| {
            match replica.writer.write_all(bytes).and_then(|_| replica.writer.flush()) {
                Ok(()) => true,
                Err(err) => {
                    warn!(connection = replica.id, %err, "replica writer failed, dropping it");
                    false
                }
            }
        });
        inner.master_offset += bytes.len() as u64;
    }

    pub fn update_ack(&self, id: ConnectionId, offset: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(replica) = inner.replicas.iter_mut().find(|r| r.id == id) {
            replica.acked_offset = offset;
        }
    }

    /// How many replicas have acknowledged at least `target` bytes.
    pub fn check_replica_sync(&self, target: u64) -> usize {
        self.inner
            .lock()
            .unwrap()
            .replicas
            .iter()
            .filter(|r| r.acked_offset >= target)
            .count()
    }
}
