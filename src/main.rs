use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::connection::ConnectionHandler;
use crate::master::MasterConnection;
use crate::net::Binding;
use crate::replica::ReplicaConnection;
use crate::server::{Engine, Role};

mod client;
mod config;
mod connection;
mod master;
mod net;
mod protocol;
mod rdb;
mod registry;
mod replica;
mod server;
mod store;
mod stream;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let binding = Binding("127.0.0.1".to_string(), config.port);
    let engine = Arc::new(Engine::new(config));

    let listener = TcpListener::bind(binding.to_string())?;
    let role = if engine.is_master() { "master" } else { "replica" };
    info!(%binding, role, "listening");

    if let Role::Replica { master } = &engine.role {
        replica::start_replication(engine.clone(), master.clone())?;
    }

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let engine = engine.clone();
                let peer = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                thread::Builder::new()
                    .name(format!("client-{}", peer))
                    .spawn(move || {
                        let result = if engine.is_master() {
                            MasterConnection::new(engine).handle_connection(stream)
                        } else {
                            ReplicaConnection::new(engine).handle_connection(stream)
                        };
                        if let Err(err) = result {
                            debug!(%err, "connection closed");
                        }
                    })?;
            }
            Err(err) => warn!(%err, "failed to accept a connection"),
        }
    }
    Ok(())
}
