use std::fmt::Display;
use std::str::FromStr;

use anyhow::bail;
use thiserror::Error;

use crate::protocol::resp::Resp;

/// User-visible command failure. Rendered as a RESP error frame at dispatch;
/// the connection survives.
#[derive(Error, Debug, PartialEq)]
#[error("{0}")]
pub struct CommandError(pub String);

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        CommandError(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Ping,
    Echo,
    // keyspace commands
    Set,
    Get,
    Incr,
    Type,
    Keys,
    // stream commands
    Xadd,
    Xrange,
    Xread,
    // transactions
    Multi,
    Exec,
    Discard,
    // server and replication commands
    Config,
    Info,
    Replconf,
    Psync,
    Wait,
}

impl Verb {
    /// Commands whose accepted frames a master forwards to its replicas.
    pub fn is_write(&self) -> bool {
        matches!(self, Verb::Set)
    }
}

impl FromStr for Verb {
    type Err = CommandError;

    fn from_str(input: &str) -> Result<Verb, Self::Err> {
        match input.to_uppercase().as_str() {
            "PING" => Ok(Verb::Ping),
            "ECHO" => Ok(Verb::Echo),
            "SET" => Ok(Verb::Set),
            "GET" => Ok(Verb::Get),
            "INCR" => Ok(Verb::Incr),
            "TYPE" => Ok(Verb::Type),
            "KEYS" => Ok(Verb::Keys),
            "XADD" => Ok(Verb::Xadd),
            "XRANGE" => Ok(Verb::Xrange),
            "XREAD" => Ok(Verb::Xread),
            "MULTI" => Ok(Verb::Multi),
            "EXEC" => Ok(Verb::Exec),
            "DISCARD" => Ok(Verb::Discard),
            "CONFIG" => Ok(Verb::Config),
            "INFO" => Ok(Verb::Info),
            "REPLCONF" => Ok(Verb::Replconf),
            "PSYNC" => Ok(Verb::Psync),
            "WAIT" => Ok(Verb::Wait),
            _ => Err(CommandError::new(format!("unknown command '{}'", input))),
        }
    }
}

impl Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Verb::Ping => "PING",
            Verb::Echo => "ECHO",
            Verb::Set => "SET",
            Verb::Get => "GET",
            Verb::Incr => "INCR",
            Verb::Type => "TYPE",
            Verb::Keys => "KEYS",
            Verb::Xadd => "XADD",
            Verb::Xrange => "XRANGE",
            Verb::Xread => "XREAD",
            Verb::Multi => "MULTI",
            Verb::Exec => "EXEC",
            Verb::Discard => "DISCARD",
            Verb::Config => "CONFIG",
            Verb::Info => "INFO",
            Verb::Replconf => "REPLCONF",
            Verb::Psync => "PSYNC",
            Verb::Wait => "WAIT",
        };
        write!(f, "{}", name)
    }
}

/// Splits a request frame into its command name and argv tail. A frame that
/// is not a non-empty array of bulk strings is a protocol violation and
/// closes the connection.
pub fn split_request(frame: &Resp) -> anyhow::Result<(String, Vec<String>)> {
    match frame {
        Resp::Array(items) if !items.is_empty() => {
            let mut argv = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Resp::Bulk(s) => argv.push(s.clone()),
                    _ => bail!("request elements must be bulk strings: {:?}", frame),
                }
            }
            let tail = argv.split_off(1);
            Ok((argv.remove(0), tail))
        }
        _ => bail!("request must be a non-empty array: {:?}", frame),
    }
}

/// Finds `name` in an argv tail and parses the value that follows it,
/// e.g. `BLOCK 500` in an XREAD tail.
pub fn named_option<R: FromStr>(args: &[String], name: &str) -> Result<Option<R>, CommandError> {
    let wanted = name.to_uppercase();
    args.iter()
        .position(|a| a.to_uppercase() == wanted)
        .and_then(|i| args.get(i + 1))
        .map(|a| {
            a.parse::<R>()
                .map_err(|_| CommandError::new(format!("value of {} option is not valid", name)))
        })
        .transpose()
}

/// Finds `name` in an argv tail and returns every value after it.
pub fn named_option_list<'a>(args: &'a [String], name: &str) -> Option<&'a [String]> {
    let wanted = name.to_uppercase();
    args.iter()
        .position(|a| a.to_uppercase() == wanted)
        .map(|i| &args[i + 1..])
}
