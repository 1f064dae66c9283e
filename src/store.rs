use std::collections::HashMap;
use std::time::SystemTime;

use crate::protocol::command::CommandError;
use crate::stream::{self, StreamEntry, StreamId};

enum Value {
    String(String),
    Stream(Vec<StreamEntry>),
}

struct StoredValue {
    value: Value,
    expires_at: Option<SystemTime>,
}

impl StoredValue {
    fn from_string(value: &str, expires_at: Option<SystemTime>) -> Self {
        StoredValue {
            value: Value::String(value.to_string()),
            expires_at,
        }
    }

    fn empty_stream() -> Self {
        StoredValue {
            value: Value::Stream(Vec::new()),
            expires_at: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| at <= SystemTime::now())
    }
}

/// The typed keyspace. Expired entries are observed as absent and removed on
/// the read that finds them.
pub struct Keyspace(HashMap<String, StoredValue>);

impl Keyspace {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    fn live_entry(&mut self, key: &str) -> Option<&StoredValue> {
        if self.0.get(key).map_or(false, |v| v.is_expired()) {
            self.0.remove(key);
        }
        self.0.get(key)
    }

    pub fn set(&mut self, key: &str, value: &str, expires_at: Option<SystemTime>) {
        self.0
            .insert(key.to_string(), StoredValue::from_string(value, expires_at));
    }

    pub fn get(&mut self, key: &str) -> Option<String> {
        match self.live_entry(key) {
            Some(StoredValue {
                value: Value::String(s),
                ..
            }) => Some(s.clone()),
            _ => None,
        }
    }

    /// Missing keys count from zero. The result is stored back as a plain
    /// string without expiry.
    pub fn incr(&mut self, key: &str) -> Result<i64, CommandError> {
        let not_an_integer = || CommandError::new("value is not an integer or out of range");
        let next = match self.live_entry(key) {
            None => 1,
            Some(entry) => match &entry.value {
                Value::String(s) => s
                    .parse::<i64>()
                    .ok()
                    .and_then(|n| n.checked_add(1))
                    .ok_or_else(not_an_integer)?,
                Value::Stream(_) => return Err(not_an_integer()),
            },
        };
        self.set(key, &next.to_string(), None);
        Ok(next)
    }

    pub fn value_type(&mut self, key: &str) -> &'static str {
        match self.live_entry(key) {
            None => "none",
            Some(entry) => match entry.value {
                Value::String(_) => "string",
                Value::Stream(_) => "stream",
            },
        }
    }

    pub fn keys(&mut self, pattern: &str) -> Vec<String> {
        self.0.retain(|_, v| !v.is_expired());
        self.0
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect()
    }

    /// Appends to (or creates) a stream, resolving the ID spec against the
    /// current top entry.
    pub fn add_stream(
        &mut self,
        key: &str,
        id_spec: &str,
        fields: Vec<(String, String)>,
    ) -> Result<StreamId, CommandError> {
        if self.0.get(key).map_or(false, |v| v.is_expired()) {
            self.0.remove(key);
        }
        let entry = self
            .0
            .entry(key.to_string())
            .or_insert_with(StoredValue::empty_stream);
        match &mut entry.value {
            Value::Stream(entries) => {
                let top = entries.last().map(|e| e.id);
                let id = if id_spec.contains('*') {
                    stream::resolve_entry_id(id_spec, top)?
                } else {
                    id_spec.parse()?
                };
                stream::validate_append(id, top)?;
                entries.push(StreamEntry { id, fields });
                Ok(id)
            }
            _ => Err(CommandError::new("not a stream")),
        }
    }

    /// Entries with IDs in `[start, end]`; the lower bound turns exclusive
    /// for XREAD. Missing keys read as an empty stream.
    pub fn range_stream(
        &mut self,
        key: &str,
        start: StreamId,
        start_exclusive: bool,
        end: StreamId,
    ) -> Result<Vec<StreamEntry>, CommandError> {
        match self.live_entry(key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                Value::Stream(entries) => Ok(entries
                    .iter()
                    .filter(|e| {
                        let above = if start_exclusive {
                            e.id > start
                        } else {
                            e.id >= start
                        };
                        above && e.id <= end
                    })
                    .cloned()
                    .collect()),
                _ => Err(CommandError::new("not a stream")),
            },
        }
    }

    /// Current top ID, used to freeze the `$` sentinel at XREAD entry.
    /// A missing stream resolves to the minimum so the caller waits for the
    /// first ever entry.
    pub fn latest_stream_id(&mut self, key: &str) -> Result<StreamId, CommandError> {
        match self.live_entry(key) {
            None => Ok(StreamId::MIN),
            Some(entry) => match &entry.value {
                Value::Stream(entries) => Ok(entries.last().map_or(StreamId::MIN, |e| e.id)),
                _ => Err(CommandError::new("not a stream")),
            },
        }
    }
}

/// POSIX filename-style matching: `*`, `?`, `[set]` with ranges and `[!set]`
/// negation. Everything else matches literally.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    match_at(&pattern, &text)
}

fn match_at(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => (0..=text.len()).any(|i| match_at(&pattern[1..], &text[i..])),
        Some('?') => !text.is_empty() && match_at(&pattern[1..], &text[1..]),
        Some('[') => match parse_class(&pattern[1..]) {
            Some((negated, items, rest)) => match text.first() {
                Some(&c) => {
                    let inside = items.iter().any(|&(lo, hi)| lo <= c && c <= hi);
                    (inside != negated) && match_at(rest, &text[1..])
                }
                None => false,
            },
            // unterminated class matches a literal '['
            None => text.first() == Some(&'[') && match_at(&pattern[1..], &text[1..]),
        },
        Some(&c) => text.first() == Some(&c) && match_at(&pattern[1..], &text[1..]),
    }
}

type ClassItems = Vec<(char, char)>;

fn parse_class(pattern: &[char]) -> Option<(bool, ClassItems, &[char])> {
    let mut i = 0;
    let negated = matches!(pattern.first(), Some('!') | Some('^'));
    if negated {
        i += 1;
    }
    let mut items = Vec::new();
    let mut first = true;
    while let Some(&c) = pattern.get(i) {
        if c == ']' && !first {
            return Some((negated, items, &pattern[i + 1..]));
        }
        first = false;
        if pattern.get(i + 1) == Some(&'-') && pattern.get(i + 2).map_or(false, |&e| e != ']') {
            items.push((c, pattern[i + 2]));
            i += 3;
        } else {
            items.push((c, c));
            i += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn set_then_get_returns_the_value() {
        let mut ks = Keyspace::new();
        ks.set("foo", "bar", None);
        assert_eq!(ks.get("foo"), Some("bar".to_string()));
        assert_eq!(ks.get("missing"), None);
    }

    #[test]
    fn expired_entries_read_as_absent_and_are_removed() {
        let mut ks = Keyspace::new();
        let past = SystemTime::now() - Duration::from_millis(5);
        ks.set("foo", "bar", Some(past));
        assert_eq!(ks.get("foo"), None);
        assert_eq!(ks.value_type("foo"), "none");
        assert!(ks.keys("*").is_empty());
    }

    #[test]
    fn future_expiry_keeps_the_entry_alive() {
        let mut ks = Keyspace::new();
        let later = SystemTime::now() + Duration::from_secs(60);
        ks.set("foo", "bar", Some(later));
        assert_eq!(ks.get("foo"), Some("bar".to_string()));
    }

    #[test]
    fn set_replaces_any_prior_value() {
        let mut ks = Keyspace::new();
        ks.add_stream("k", "1-1", vec![("f".to_string(), "v".to_string())])
            .unwrap();
        assert_eq!(ks.value_type("k"), "stream");
        ks.set("k", "now-a-string", None);
        assert_eq!(ks.value_type("k"), "string");
        assert_eq!(ks.get("k"), Some("now-a-string".to_string()));
    }

    #[test]
    fn incr_counts_from_zero_and_rejects_non_integers() {
        let mut ks = Keyspace::new();
        assert_eq!(ks.incr("n"), Ok(1));
        assert_eq!(ks.incr("n"), Ok(2));

        ks.set("s", "41", None);
        assert_eq!(ks.incr("s"), Ok(42));

        ks.set("bad", "banana", None);
        let err = ks.incr("bad").unwrap_err();
        assert_eq!(err.to_string(), "value is not an integer or out of range");

        ks.set("max", &i64::MAX.to_string(), None);
        assert!(ks.incr("max").is_err());

        ks.add_stream("st", "1-1", vec![]).unwrap();
        assert!(ks.incr("st").is_err());
    }

    #[test]
    fn value_types_cover_the_three_kinds() {
        let mut ks = Keyspace::new();
        ks.set("s", "x", None);
        ks.add_stream("st", "1-1", vec![]).unwrap();
        assert_eq!(ks.value_type("s"), "string");
        assert_eq!(ks.value_type("st"), "stream");
        assert_eq!(ks.value_type("gone"), "none");
    }

    #[test]
    fn keys_filters_with_glob_patterns() {
        let mut ks = Keyspace::new();
        for key in ["apple", "apricot", "banana", "a1"] {
            ks.set(key, "1", None);
        }
        let mut matched = ks.keys("ap*");
        matched.sort();
        assert_eq!(matched, vec!["apple", "apricot"]);
        assert_eq!(ks.keys("a?"), vec!["a1"]);
        assert_eq!(ks.keys("[b]anana"), vec!["banana"]);
        assert_eq!(ks.keys("*").len(), 4);
    }

    #[test]
    fn stream_appends_enforce_id_ordering() {
        let mut ks = Keyspace::new();
        let id = ks
            .add_stream("s", "5-0", vec![("f".to_string(), "v".to_string())])
            .unwrap();
        assert_eq!(id.to_string(), "5-0");

        let err = ks
            .add_stream("s", "4-0", vec![("f".to_string(), "v".to_string())])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The ID specified in XADD is equal or smaller than the target stream top item"
        );

        let err = ks.add_stream("s", "0-0", vec![]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "The ID specified in XADD must be greater than 0-0"
        );
    }

    #[test]
    fn wildcard_appends_within_a_millisecond_bump_the_sequence() {
        let mut ks = Keyspace::new();
        let first = ks.add_stream("s", "7-*", vec![]).unwrap();
        let second = ks.add_stream("s", "7-*", vec![]).unwrap();
        assert_eq!(first, StreamId::new(7, 0));
        assert_eq!(second, StreamId::new(7, 1));
    }

    #[test]
    fn auto_ids_are_strictly_increasing() {
        let mut ks = Keyspace::new();
        let first = ks.add_stream("s", "*", vec![]).unwrap();
        let second = ks.add_stream("s", "*", vec![]).unwrap();
        assert!(second > first);
        if second.ms == first.ms {
            assert_eq!(second.seq, first.seq + 1);
        }
    }

    #[test]
    fn ranges_are_inclusive_and_ordered() {
        let mut ks = Keyspace::new();
        for seq in 0..4 {
            ks.add_stream("s", &format!("1-{}", seq + 1), vec![]).unwrap();
        }
        let all = ks
            .range_stream("s", StreamId::MIN, false, StreamId::MAX)
            .unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let tail = ks
            .range_stream("s", StreamId::new(1, 2), true, StreamId::MAX)
            .unwrap();
        assert_eq!(tail.first().unwrap().id, StreamId::new(1, 3));

        assert!(ks
            .range_stream("missing", StreamId::MIN, false, StreamId::MAX)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn latest_stream_id_freezes_the_dollar_sentinel() {
        let mut ks = Keyspace::new();
        assert_eq!(ks.latest_stream_id("missing").unwrap(), StreamId::MIN);
        ks.add_stream("s", "3-2", vec![]).unwrap();
        assert_eq!(ks.latest_stream_id("s").unwrap(), StreamId::new(3, 2));
        ks.set("plain", "x", None);
        assert!(ks.latest_stream_id("plain").is_err());
    }

    #[test]
    fn glob_covers_star_question_and_classes() {
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("h?llo", "hello"));
        assert!(!glob_match("h?llo", "heello"));
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[ae]llo", "hillo"));
        assert!(glob_match("[a-c]x", "bx"));
        assert!(!glob_match("[a-c]x", "dx"));
        assert!(glob_match("[!a]x", "bx"));
        assert!(!glob_match("[!a]x", "ax"));
        assert!(glob_match("literal", "literal"));
        assert!(!glob_match("literal", "litera"));
    }
}
