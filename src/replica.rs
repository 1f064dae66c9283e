use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::client::MasterClient;
use crate::connection::{ConnectionHandler, Session};
use crate::net::Binding;
use crate::protocol::command::{CommandError, Verb};
use crate::protocol::resp::Resp;
use crate::server::Engine;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// One client connection served by a replica. Commands run against the
/// local keyspace; nothing is ever propagated from here.
pub struct ReplicaConnection {
    engine: Arc<Engine>,
    session: Session,
}

impl ReplicaConnection {
    pub fn new(engine: Arc<Engine>) -> Self {
        ReplicaConnection {
            engine,
            session: Session::new(),
        }
    }
}

impl ConnectionHandler for ReplicaConnection {
    fn session(&mut self) -> &mut Session {
        &mut self.session
    }

    fn execute(
        &mut self,
        verb: Verb,
        args: &[String],
        _request: Option<&Resp>,
    ) -> Result<Vec<Resp>, CommandError> {
        self.engine.execute(verb, args)
    }
}

/// The replica's side of the replication link: handshake, then endless
/// ingestion of propagated commands with exact byte accounting.
struct MasterLink {
    engine: Arc<Engine>,
    master: Binding,
    bytes_processed: u64,
}

impl MasterLink {
    fn run(&mut self) -> Result<()> {
        let mut client = MasterClient::connect(&self.master)?;
        client.ping_pong()?;
        client.replconf(&["listening-port", &self.engine.listen_port().to_string()])?;
        client.replconf(&["capa", "psync2"])?;
        let _snapshot = client.psync()?;
        // byte accounting starts fresh after the snapshot
        self.bytes_processed = 0;

        loop {
            // the master may pack several commands into one TCP segment
            for (argv, len) in client.connection.read_command_batch()? {
                let Some((name, args)) = argv.split_first() else {
                    continue;
                };
                match name.parse::<Verb>() {
                    Ok(Verb::Replconf) => {
                        // GETACK is the only upstream round-trip; the
                        // reported offset excludes the GETACK frame itself
                        if args.first().map_or(false, |s| s.eq_ignore_ascii_case("GETACK")) {
                            let ack = Resp::command(&[
                                "REPLCONF",
                                "ACK",
                                &self.bytes_processed.to_string(),
                            ]);
                            client.connection.send_frame(&ack)?;
                        }
                    }
                    Ok(verb) => {
                        // propagated commands execute silently
                        if let Err(err) = self.engine.execute(verb, args) {
                            debug!(%verb, %err, "propagated command failed locally");
                        }
                    }
                    Err(err) => debug!(%err, "ignoring unknown propagated command"),
                }
                self.bytes_processed += len as u64;
            }
        }
    }
}

/// Spawns the replication thread; it reconnects with a backoff whenever the
/// master link fails.
pub fn start_replication(engine: Arc<Engine>, master: Binding) -> Result<()> {
    let thread_name = format!("replica-link-{}", master);
    thread::Builder::new().name(thread_name).spawn(move || {
        let mut link = MasterLink {
            engine,
            master,
            bytes_processed: 0,
        };
        loop {
            if let Err(err) = link.run() {
                warn!(%err, "replication link failed, will reconnect");
            }
            thread::sleep(RECONNECT_BACKOFF);
        }
    })?;
    Ok(())
}
