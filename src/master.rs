use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandler, Session};
use crate::protocol::command::{split_request, CommandError, Verb};
use crate::protocol::resp::{Resp, RespConnection};
use crate::rdb::empty_rdb;
use crate::registry::ReplicaRegistry;
use crate::server::Engine;

const WAIT_POLL_TICK: Duration = Duration::from_millis(100);

/// One client connection served by a master. After a completed PSYNC the
/// same connection is re-purposed as the replication link to that replica.
pub struct MasterConnection {
    engine: Arc<Engine>,
    session: Session,
    pending_replica: bool,
}

impl MasterConnection {
    pub fn new(engine: Arc<Engine>) -> Self {
        MasterConnection {
            engine,
            session: Session::new(),
            pending_replica: false,
        }
    }

    fn handle_replconf(&mut self, args: &[String]) -> Result<Vec<Resp>, CommandError> {
        match args.first().map(|s| s.to_uppercase()).as_deref() {
            Some("ACK") => {
                // sent by a replica writer; bookkeeping only, no reply
                let offset = args
                    .get(1)
                    .and_then(|n| n.parse::<u64>().ok())
                    .ok_or_else(|| CommandError::new("invalid REPLCONF ACK offset"))?;
                self.engine.registry.update_ack(self.session.id, offset);
                Ok(vec![])
            }
            _ => Ok(vec![Resp::simple("OK")]),
        }
    }

    fn handle_psync(&mut self, args: &[String]) -> Result<Vec<Resp>, CommandError> {
        match args {
            [replid, offset] if replid == "?" && offset == "-1" => {
                let replid = self
                    .engine
                    .replid()
                    .ok_or_else(|| CommandError::new("PSYNC is only available on a master"))?;
                let reply = format!("FULLRESYNC {} {}", replid, self.engine.registry.master_offset());
                self.pending_replica = true;
                Ok(vec![Resp::Simple(reply), Resp::File(empty_rdb())])
            }
            _ => Err(CommandError::new("unsupported PSYNC request")),
        }
    }

    fn handle_wait(&mut self, args: &[String]) -> Result<Vec<Resp>, CommandError> {
        let [required, timeout_ms] = args else {
            return Err(CommandError::new(
                "wrong number of arguments for 'wait' command",
            ));
        };
        let required = required
            .parse::<usize>()
            .map_err(|_| CommandError::new("value is not an integer or out of range"))?;
        let timeout_ms = timeout_ms
            .parse::<u64>()
            .map_err(|_| CommandError::new("timeout is not an integer or out of range"))?;
        let synced = wait_for_sync(
            &self.engine.registry,
            required,
            Duration::from_millis(timeout_ms),
        );
        Ok(vec![Resp::Int(synced as i64)])
    }

    /// Registers the connection as a replica writer and keeps reading its
    /// acknowledgements until it drops.
    fn serve_replica(&mut self, connection: &mut RespConnection) -> Result<()> {
        let id = self.session.id;
        let registry = &self.engine.registry;
        let writer = connection.writer_handle()?;
        let replid = self.engine.replid().unwrap_or_default().to_string();
        // a freshly synced replica is caught up to the snapshot offset
        registry.add_replica(id, writer, &replid, registry.master_offset());
        info!(connection = id, "connection promoted to replication link");

        loop {
            let frame = match connection.read_frame() {
                Ok((_, frame)) => frame,
                Err(err) => {
                    registry.remove(id);
                    info!(connection = id, "replica disconnected");
                    return Err(err);
                }
            };
            match split_request(&frame) {
                Ok((name, args))
                    if name.eq_ignore_ascii_case("REPLCONF")
                        && args.first().map_or(false, |s| s.eq_ignore_ascii_case("ACK")) =>
                {
                    if let Some(offset) = args.get(1).and_then(|n| n.parse::<u64>().ok()) {
                        debug!(connection = id, offset, "replica acknowledged");
                        registry.update_ack(id, offset);
                    }
                }
                _ => debug!(connection = id, ?frame, "ignoring frame on replication link"),
            }
        }
    }
}

impl ConnectionHandler for MasterConnection {
    fn session(&mut self) -> &mut Session {
        &mut self.session
    }

    fn execute(
        &mut self,
        verb: Verb,
        args: &[String],
        request: Option<&Resp>,
    ) -> Result<Vec<Resp>, CommandError> {
        match verb {
            Verb::Replconf => self.handle_replconf(args),
            Verb::Psync => self.handle_psync(args),
            Verb::Wait => self.handle_wait(args),
            _ => {
                let replies = self.engine.execute(verb, args)?;
                // propagate the accepted write before the client sees its reply
                if verb.is_write() {
                    if let Some(frame) = request {
                        self.engine.registry.broadcast(&frame.encode());
                    }
                }
                Ok(replies)
            }
        }
    }

    fn after_reply(&mut self, connection: &mut RespConnection) -> Result<()> {
        if self.pending_replica {
            self.pending_replica = false;
            self.serve_replica(connection)?;
        }
        Ok(())
    }
}

/// WAIT core: freeze the offset target, short-circuit when there is nothing
/// to wait for, otherwise round-trip a GETACK and poll the acknowledgements.
pub(crate) fn wait_for_sync<W: Write>(
    registry: &ReplicaRegistry<W>,
    required: usize,
    timeout: Duration,
) -> usize {
    let target = registry.master_offset();
    if target == 0 {
        return registry.replica_count();
    }

    registry.broadcast(&Resp::command(&["REPLCONF", "GETACK", "*"]).encode());

    let deadline = Instant::now() + timeout;
    loop {
        let synced = registry.check_replica_sync(target);
        if synced >= required {
            return synced;
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(synced, required, "WAIT timed out");
            return synced;
        }
        thread::sleep(WAIT_POLL_TICK.min(deadline - now));
    }
}
