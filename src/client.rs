use std::net::TcpStream;

use anyhow::{bail, Result};
use tracing::info;

use crate::net::Binding;
use crate::protocol::resp::{Resp, RespConnection};

/// Replica-side client for the master link: runs the handshake steps and
/// then hands the same connection over to command ingestion.
pub struct MasterClient {
    pub connection: RespConnection,
}

impl MasterClient {
    pub fn connect(master: &Binding) -> Result<Self> {
        let stream = TcpStream::connect(master.to_string())?;
        info!(%master, "connected to master");
        Ok(MasterClient {
            connection: RespConnection::new(stream),
        })
    }

    pub fn ping_pong(&mut self) -> Result<()> {
        self.connection.send_frame(&Resp::command(&["PING"]))?;
        if let (_, Resp::Simple(reply)) = self.connection.read_frame()? {
            if reply.eq_ignore_ascii_case("PONG") {
                return Ok(());
            }
        }
        bail!("handshake PING was not answered with PONG");
    }

    pub fn replconf(&mut self, params: &[&str]) -> Result<()> {
        let mut parts = vec!["REPLCONF"];
        parts.extend_from_slice(params);
        self.connection.send_frame(&Resp::command(&parts))?;
        if let (_, Resp::Simple(reply)) = self.connection.read_frame()? {
            if reply.eq_ignore_ascii_case("OK") {
                return Ok(());
            }
        }
        bail!("handshake REPLCONF {:?} was not acknowledged", params);
    }

    /// Requests a full resync and returns the snapshot payload.
    pub fn psync(&mut self) -> Result<Vec<u8>> {
        self.connection
            .send_frame(&Resp::command(&["PSYNC", "?", "-1"]))?;
        match self.connection.read_frame()? {
            (_, Resp::Simple(reply)) if reply.to_uppercase().starts_with("FULLRESYNC ") => {
                let snapshot = self.connection.read_rdb()?;
                info!(bytes = snapshot.len(), "received full resync snapshot");
                Ok(snapshot)
            }
            (_, reply) => bail!("unexpected PSYNC response: {:?}", reply),
        }
    }
}
