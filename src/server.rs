use std::sync::RwLock;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::net::Binding;
use crate::protocol::command::{named_option, named_option_list, CommandError, Verb};
use crate::protocol::resp::Resp;
use crate::registry::ReplicaRegistry;
use crate::store::Keyspace;
use crate::stream::{self, StreamEntry, StreamId};

const XREAD_POLL_TICK: Duration = Duration::from_millis(200);

pub enum Role {
    Master { replid: String },
    Replica { master: Binding },
}

/// Process-wide server state: role, keyspace and the replica registry. One
/// instance is shared by every connection thread.
pub struct Engine {
    pub role: Role,
    pub registry: ReplicaRegistry,
    store: RwLock<Keyspace>,
    config: Config,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let role = match &config.replica_of {
            Some(master) => Role::Replica {
                master: master.clone(),
            },
            None => Role::Master {
                replid: new_replid(),
            },
        };
        Engine {
            role,
            registry: ReplicaRegistry::new(),
            store: RwLock::new(Keyspace::new()),
            config,
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self.role, Role::Master { .. })
    }

    pub fn replid(&self) -> Option<&str> {
        match &self.role {
            Role::Master { replid } => Some(replid),
            Role::Replica { .. } => None,
        }
    }

    pub fn listen_port(&self) -> u16 {
        self.config.port
    }

    /// Keyspace-facing command execution, shared by both roles. Replication
    /// verbs are intercepted by the master connection before they get here.
    pub fn execute(&self, verb: Verb, args: &[String]) -> Result<Vec<Resp>, CommandError> {
        match (verb, args) {
            (Verb::Ping, _) => Ok(vec![Resp::simple("PONG")]),
            (Verb::Echo, [message]) => Ok(vec![Resp::bulk(message)]),
            (Verb::Set, [key, value, options @ ..]) => {
                let expires_at = parse_expiry_options(options)?;
                self.store.write().unwrap().set(key, value, expires_at);
                Ok(vec![Resp::simple("OK")])
            }
            (Verb::Get, [key]) => Ok(vec![self
                .store
                .write()
                .unwrap()
                .get(key)
                .map_or(Resp::NullBulk, Resp::Bulk)]),
            (Verb::Incr, [key]) => {
                let value = self.store.write().unwrap().incr(key)?;
                Ok(vec![Resp::Int(value)])
            }
            (Verb::Type, [key]) => Ok(vec![Resp::simple(
                self.store.write().unwrap().value_type(key),
            )]),
            (Verb::Keys, [pattern]) => {
                let keys = self.store.write().unwrap().keys(pattern);
                Ok(vec![Resp::Array(
                    keys.iter().map(|k| Resp::bulk(k)).collect(),
                )])
            }
            (Verb::Xadd, [key, id_spec, pairs @ ..]) => {
                let mut fields = Vec::new();
                let mut iter = pairs.iter();
                while let Some((field, value)) = iter.next().zip(iter.next()) {
                    fields.push((field.clone(), value.clone()));
                }
                let id = self.store.write().unwrap().add_stream(key, id_spec, fields)?;
                Ok(vec![Resp::Bulk(id.to_string())])
            }
            (Verb::Xrange, [key, start, end]) => {
                let (start, start_exclusive) = stream::parse_range_start(start)?;
                let end = stream::parse_range_end(end)?;
                let entries =
                    self.store
                        .write()
                        .unwrap()
                        .range_stream(key, start, start_exclusive, end)?;
                Ok(vec![Resp::Array(
                    entries.iter().map(encode_stream_entry).collect(),
                )])
            }
            (Verb::Xread, params) => self.xread(params),
            (Verb::Config, [sub, name]) if sub.eq_ignore_ascii_case("GET") => {
                let value = self.config.get(name).map_or(Resp::NullBulk, Resp::Bulk);
                Ok(vec![Resp::Array(vec![Resp::bulk(name), value])])
            }
            (Verb::Config, _) => Err(CommandError::new("unsupported CONFIG subcommand")),
            (Verb::Info, [section]) if section.eq_ignore_ascii_case("replication") => {
                let info = match &self.role {
                    Role::Master { replid } => format!(
                        "role:master\r\nmaster_repl_offset:{}\r\nmaster_replid:{}",
                        self.registry.master_offset(),
                        replid
                    ),
                    Role::Replica { .. } => "role:slave".to_string(),
                };
                Ok(vec![Resp::Bulk(info)])
            }
            (Verb::Info, _) => Err(CommandError::new("unsupported INFO section")),
            // a replica answers the generic REPLCONF contract; the full
            // subcommand handling lives on the master connection
            (Verb::Replconf, _) => Ok(vec![Resp::simple("OK")]),
            (Verb::Psync | Verb::Wait, _) => Err(CommandError::new(format!(
                "{} is only available on a master",
                verb
            ))),
            _ => Err(CommandError::new(format!(
                "wrong number of arguments for '{}' command",
                verb.to_string().to_lowercase()
            ))),
        }
    }

    /// XREAD [BLOCK ms] STREAMS k1 .. kN id1 .. idN — start IDs are
    /// exclusive and `$` freezes to the current top before any waiting.
    fn xread(&self, params: &[String]) -> Result<Vec<Resp>, CommandError> {
        let block_ms: Option<u64> = named_option(params, "BLOCK")?;
        let streams = named_option_list(params, "STREAMS")
            .ok_or_else(|| CommandError::new("syntax error"))?;
        if streams.is_empty() || streams.len() % 2 != 0 {
            return Err(CommandError::new(
                "Unbalanced XREAD list of streams: for each stream key an ID or '$' must be specified.",
            ));
        }
        let (keys, ids) = streams.split_at(streams.len() / 2);

        let mut starts = Vec::with_capacity(keys.len());
        {
            let mut store = self.store.write().unwrap();
            for (key, id) in keys.iter().zip(ids) {
                let from = if id == "$" {
                    store.latest_stream_id(key)?
                } else {
                    stream::parse_range_start(id)?.0
                };
                starts.push(from);
            }
        }

        let deadline = match block_ms {
            Some(ms) if ms > 0 => Some(Instant::now() + Duration::from_millis(ms)),
            _ => None,
        };
        loop {
            let results = self.collect_xread(keys, &starts)?;
            if !results.is_empty() {
                return Ok(vec![Resp::Array(results)]);
            }
            match block_ms {
                None => return Ok(vec![Resp::NullBulk]),
                Some(_) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            debug!("blocking XREAD timed out");
                            return Ok(vec![Resp::NullBulk]);
                        }
                    }
                    thread::sleep(XREAD_POLL_TICK);
                }
            }
        }
    }

    fn collect_xread(&self, keys: &[String], starts: &[StreamId]) -> Result<Vec<Resp>, CommandError> {
        let mut store = self.store.write().unwrap();
        let mut results = Vec::new();
        for (key, start) in keys.iter().zip(starts) {
            let entries = store.range_stream(key, *start, true, StreamId::MAX)?;
            if entries.is_empty() {
                continue;
            }
            results.push(Resp::Array(vec![
                Resp::bulk(key),
                Resp::Array(entries.iter().map(encode_stream_entry).collect()),
            ]));
        }
        Ok(results)
    }
}

fn encode_stream_entry(entry: &StreamEntry) -> Resp {
    let mut fields = Vec::with_capacity(entry.fields.len() * 2);
    for (field, value) in &entry.fields {
        fields.push(Resp::bulk(field));
        fields.push(Resp::bulk(value));
    }
    Resp::Array(vec![
        Resp::Bulk(entry.id.to_string()),
        Resp::Array(fields),
    ])
}

/// SET expiry options: PX takes milliseconds, EX seconds; the later option
/// wins when both appear. Negative values are rejected.
fn parse_expiry_options(options: &[String]) -> Result<Option<SystemTime>, CommandError> {
    let mut expires_at = None;
    let mut i = 0;
    while i < options.len() {
        let unit_ms = match options[i].to_ascii_uppercase().as_str() {
            "PX" => Some(1),
            "EX" => Some(1000),
            _ => None,
        };
        if let Some(unit_ms) = unit_ms {
            let raw = options
                .get(i + 1)
                .ok_or_else(|| CommandError::new("syntax error"))?;
            let amount = raw
                .parse::<i64>()
                .map_err(|_| CommandError::new("value is not an integer or out of range"))?;
            if amount < 0 {
                return Err(CommandError::new("invalid expire time in 'set' command"));
            }
            let millis = (amount as u64).saturating_mul(unit_ms);
            expires_at = Some(SystemTime::now() + Duration::from_millis(millis));
            i += 2;
        } else {
            i += 1;
        }
    }
    Ok(expires_at)
}

fn new_replid() -> String {
    let mut replid = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    replid.truncate(40);
    replid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::DEFAULT_PORT;

    fn master_engine() -> Engine {
        Engine::new(Config {
            port: DEFAULT_PORT,
            replica_of: None,
        })
    }

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn set_then_get_roundtrip() {
        let engine = master_engine();
        assert_eq!(
            engine.execute(Verb::Set, &args(&["foo", "bar"])).unwrap(),
            vec![Resp::simple("OK")]
        );
        assert_eq!(
            engine.execute(Verb::Get, &args(&["foo"])).unwrap(),
            vec![Resp::bulk("bar")]
        );
        assert_eq!(
            engine.execute(Verb::Get, &args(&["missing"])).unwrap(),
            vec![Resp::NullBulk]
        );
    }

    #[test]
    fn set_with_zero_px_expires_immediately() {
        let engine = master_engine();
        engine
            .execute(Verb::Set, &args(&["foo", "bar", "px", "0"]))
            .unwrap();
        assert_eq!(
            engine.execute(Verb::Get, &args(&["foo"])).unwrap(),
            vec![Resp::NullBulk]
        );
    }

    #[test]
    fn negative_expiry_is_rejected() {
        let engine = master_engine();
        let err = engine
            .execute(Verb::Set, &args(&["foo", "bar", "EX", "-1"]))
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid expire time in 'set' command");
    }

    #[test]
    fn later_expiry_option_wins() {
        // PX 0 after EX 100 expires the key immediately
        let engine = master_engine();
        engine
            .execute(Verb::Set, &args(&["foo", "bar", "EX", "100", "PX", "0"]))
            .unwrap();
        assert_eq!(
            engine.execute(Verb::Get, &args(&["foo"])).unwrap(),
            vec![Resp::NullBulk]
        );
    }

    #[test]
    fn incr_on_a_missing_key_yields_one() {
        let engine = master_engine();
        assert_eq!(
            engine.execute(Verb::Incr, &args(&["n"])).unwrap(),
            vec![Resp::Int(1)]
        );
        assert_eq!(
            engine.execute(Verb::Incr, &args(&["n"])).unwrap(),
            vec![Resp::Int(2)]
        );
    }

    #[test]
    fn backward_stream_ids_error_with_the_exact_message() {
        let engine = master_engine();
        assert_eq!(
            engine
                .execute(Verb::Xadd, &args(&["s", "5-0", "f", "v"]))
                .unwrap(),
            vec![Resp::bulk("5-0")]
        );
        let err = engine
            .execute(Verb::Xadd, &args(&["s", "4-0", "f", "v"]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The ID specified in XADD is equal or smaller than the target stream top item"
        );
    }

    #[test]
    fn xrange_replies_with_nested_entry_arrays() {
        let engine = master_engine();
        engine
            .execute(Verb::Xadd, &args(&["s", "1-1", "temperature", "36"]))
            .unwrap();
        engine
            .execute(Verb::Xadd, &args(&["s", "1-2", "temperature", "37"]))
            .unwrap();
        let reply = engine
            .execute(Verb::Xrange, &args(&["s", "-", "+"]))
            .unwrap();
        assert_eq!(
            reply,
            vec![Resp::Array(vec![
                Resp::Array(vec![
                    Resp::bulk("1-1"),
                    Resp::command(&["temperature", "36"]),
                ]),
                Resp::Array(vec![
                    Resp::bulk("1-2"),
                    Resp::command(&["temperature", "37"]),
                ]),
            ])]
        );
    }

    #[test]
    fn xread_is_exclusive_of_the_start_id() {
        let engine = master_engine();
        engine
            .execute(Verb::Xadd, &args(&["s", "1-1", "f", "a"]))
            .unwrap();
        engine
            .execute(Verb::Xadd, &args(&["s", "1-2", "f", "b"]))
            .unwrap();
        let reply = engine
            .execute(Verb::Xread, &args(&["STREAMS", "s", "1-1"]))
            .unwrap();
        assert_eq!(
            reply,
            vec![Resp::Array(vec![Resp::Array(vec![
                Resp::bulk("s"),
                Resp::Array(vec![Resp::Array(vec![
                    Resp::bulk("1-2"),
                    Resp::command(&["f", "b"]),
                ])]),
            ])])]
        );
    }

    #[test]
    fn xread_with_no_data_and_no_block_is_a_null_bulk() {
        let engine = master_engine();
        let reply = engine
            .execute(Verb::Xread, &args(&["STREAMS", "s", "$"]))
            .unwrap();
        assert_eq!(reply, vec![Resp::NullBulk]);
    }

    #[test]
    fn info_replication_reports_the_master_fields() {
        let engine = master_engine();
        let reply = engine
            .execute(Verb::Info, &args(&["replication"]))
            .unwrap();
        let Resp::Bulk(info) = &reply[0] else {
            panic!("INFO must reply with a bulk string");
        };
        assert!(info.contains("role:master"));
        assert!(info.contains("master_repl_offset:0"));
        let replid = engine.replid().unwrap();
        assert_eq!(replid.len(), 40);
        assert!(info.contains(replid));
    }

    #[test]
    fn info_replication_on_a_replica_is_just_the_role() {
        let engine = Engine::new(Config {
            port: DEFAULT_PORT,
            replica_of: Some(Binding("localhost".to_string(), 6380)),
        });
        assert_eq!(
            engine.execute(Verb::Info, &args(&["replication"])).unwrap(),
            vec![Resp::bulk("role:slave")]
        );
    }

    #[test]
    fn config_get_reflects_the_environment() {
        let engine = master_engine();
        std::env::set_var("cinder_engine_test", "42");
        assert_eq!(
            engine
                .execute(Verb::Config, &args(&["GET", "cinder_engine_test"]))
                .unwrap(),
            vec![Resp::Array(vec![
                Resp::bulk("cinder_engine_test"),
                Resp::bulk("42"),
            ])]
        );
    }

    #[test]
    fn unknown_arity_is_a_command_error() {
        let engine = master_engine();
        assert!(engine.execute(Verb::Get, &args(&[])).is_err());
        assert!(engine.execute(Verb::Echo, &args(&[])).is_err());
    }
}
