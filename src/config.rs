use std::env;

use crate::net::{Binding, Port, DEFAULT_PORT};

/// Server settings sourced from the environment. `CONFIG GET` exposes the
/// same surface, so arbitrary names are read back from the environment too.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: Port,
    pub replica_of: Option<Binding>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = match env::var("port") {
            Ok(value) => value.parse()?,
            Err(_) => DEFAULT_PORT,
        };
        let replica_of = match env::var("replicaof") {
            Ok(value) => Some(value.parse()?),
            Err(_) => None,
        };
        Ok(Config { port, replica_of })
    }

    pub fn get(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }
}
