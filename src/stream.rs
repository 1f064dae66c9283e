use std::fmt::Display;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::protocol::command::CommandError;

/// Stream entry identifier: milliseconds paired with a sequence number,
/// ordered lexicographically. `0-0` is reserved and never a valid entry ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

#[derive(Error, Debug, PartialEq)]
pub enum StreamIdError {
    #[error("The ID specified in XADD is equal or smaller than the target stream top item")]
    SmallTop,
    #[error("The ID specified in XADD must be greater than 0-0")]
    SmallFirst,
    #[error("Invalid stream ID specified as stream command argument")]
    Unparsable,
}

impl From<StreamIdError> for CommandError {
    fn from(err: StreamIdError) -> Self {
        CommandError::new(err.to_string())
    }
}

impl StreamId {
    pub const MIN: Self = Self { ms: 0, seq: 0 };
    pub const MAX: Self = Self {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = StreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_point(s, 0)
    }
}

fn parse_part(s: &str) -> Result<u64, StreamIdError> {
    s.parse::<u64>().map_err(|_| StreamIdError::Unparsable)
}

fn parse_point(s: &str, default_seq: u64) -> Result<StreamId, StreamIdError> {
    match s.split_once('-') {
        Some((ms, seq)) => Ok(StreamId::new(parse_part(ms)?, parse_part(seq)?)),
        None => Ok(StreamId::new(parse_part(s)?, default_seq)),
    }
}

/// Resolves an XADD ID spec against the stream's current top entry.
/// `*` takes the wall clock; `<ms>-*` auto-increments within that
/// millisecond. Explicit IDs pass through verbatim.
pub fn resolve_entry_id(spec: &str, top: Option<StreamId>) -> Result<StreamId, StreamIdError> {
    if spec == "*" {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        return Ok(match top {
            Some(top) if now_ms <= top.ms => StreamId::new(top.ms, top.seq + 1),
            _ => StreamId::new(now_ms, 0),
        });
    }
    if let Some(ms) = spec.strip_suffix("-*") {
        let ms = parse_part(ms)?;
        let id = match top {
            Some(top) if top.ms == ms => StreamId::new(ms, top.seq + 1),
            _ => StreamId::new(ms, 0),
        };
        // the reserved 0-0 is never auto-generated
        return Ok(if id == StreamId::MIN {
            StreamId::new(0, 1)
        } else {
            id
        });
    }
    spec.parse()
}

/// Append precondition: IDs are strictly increasing and above the reserved
/// minimum.
pub fn validate_append(id: StreamId, top: Option<StreamId>) -> Result<(), StreamIdError> {
    if id <= StreamId::MIN {
        return Err(StreamIdError::SmallFirst);
    }
    if let Some(top) = top {
        if id <= top {
            return Err(StreamIdError::SmallTop);
        }
    }
    Ok(())
}

/// Lower range boundary: `-` is the minimum, `(id` is exclusive, a bare
/// millisecond value starts at sequence 0.
pub fn parse_range_start(s: &str) -> Result<(StreamId, bool), StreamIdError> {
    if s == "-" {
        return Ok((StreamId::MIN, false));
    }
    if let Some(inner) = s.strip_prefix('(') {
        return Ok((parse_point(inner, 0)?, true));
    }
    Ok((parse_point(s, 0)?, false))
}

/// Upper range boundary: `+` is the maximum, a bare millisecond value covers
/// every sequence within it.
pub fn parse_range_end(s: &str) -> Result<StreamId, StreamIdError> {
    if s == "+" {
        return Ok(StreamId::MAX);
    }
    parse_point(s, u64::MAX)
}

/// One stream entry: its ID plus the field/value list in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Vec<(String, String)>,
}
