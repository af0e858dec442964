//! Wire-level data model: signed events and query filters.
//!
//! Signature verification is deliberately out of scope — `Event` carries
//! whatever `sig` the wire handed us and the core never inspects it
//! beyond passing it through.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A content-addressed event ID: the lowercase-hex SHA-256 of the event's
/// canonical serialization. Opaque to the core beyond equality/hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        EventId(s.to_string())
    }
}

/// A single NIP-01 tag: `tags[0]` is the tag name (e.g. `"e"`, `"p"`), the
/// rest are positional values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// A signed event, opaque to the core beyond the fields it needs to
/// classify, deduplicate, and cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find(|t| t.name() == Some(name)).and_then(Tag::value)
    }
}

/// The query predicate. An empty field means "no constraint on that
/// dimension".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Keyed by `"#<letter>"`, e.g. `"#e"` -> `["<event id>"]`.
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// A filter with `since` set and every other dimension unconstrained —
    /// the mirror loop's "from this moment forward" subscription.
    pub fn since_now(now: i64) -> Self {
        Filter {
            since: Some(now),
            ..Default::default()
        }
    }

    pub fn tag_values(&self, letter: &str) -> Option<&[String]> {
        self.tags.get(&format!("#{letter}")).map(Vec::as_slice)
    }

    /// Matches the deletion-check shape: exactly one kind equal to 5,
    /// exactly one `#e` tag value, nothing else set.
    pub fn is_deletion_check_shape(&self) -> bool {
        self.kinds == [5]
            && self.ids.is_empty()
            && self.authors.is_empty()
            && self.since.is_none()
            && self.until.is_none()
            && self.tags.len() == 1
            && self.tags.get("#e").map(|v| v.len() == 1).unwrap_or(false)
    }
}

/// Messages a client sends the local relay. Also used verbatim when the
/// core itself acts as a client talking to an upstream peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ClientMessage {
    Event { event: Event },
    Req { sub_id: String, filters: Vec<Filter> },
    Count { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
}

/// Messages the local relay sends a client, and what an upstream peer
/// sends back to us when we act as a client toward it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum RelayMessage {
    Event { sub_id: String, event: Event },
    Eose { sub_id: String },
    Ok { event_id: EventId, accepted: bool, message: String },
    Count { sub_id: String, count: u64 },
    Notice { message: String },
    /// NIP-42 challenge, sent by an upstream relay unprompted after
    /// connect (and sometimes again alongside an `auth-required` OK).
    Auth { challenge: String },
}

/// Upstream OK-response parsed into its machine-readable prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPrefix {
    Duplicate,
    Pow,
    Blocked,
    RateLimited,
    Invalid,
    Restricted,
    Mute,
    Error,
    AuthRequired,
}

impl ErrorPrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorPrefix::Duplicate => "duplicate",
            ErrorPrefix::Pow => "pow",
            ErrorPrefix::Blocked => "blocked",
            ErrorPrefix::RateLimited => "rate-limited",
            ErrorPrefix::Invalid => "invalid",
            ErrorPrefix::Restricted => "restricted",
            ErrorPrefix::Mute => "mute",
            ErrorPrefix::Error => "error",
            ErrorPrefix::AuthRequired => "auth-required",
        }
    }

    /// Parse the prefix out of an upstream OK message, e.g.
    /// `"blocked: spam"` -> `Some(Blocked)`.
    pub fn parse(message: &str) -> Option<Self> {
        let prefix = message.split(':').next()?.trim();
        match prefix {
            "duplicate" => Some(ErrorPrefix::Duplicate),
            "pow" => Some(ErrorPrefix::Pow),
            "blocked" => Some(ErrorPrefix::Blocked),
            "rate-limited" => Some(ErrorPrefix::RateLimited),
            "invalid" => Some(ErrorPrefix::Invalid),
            "restricted" => Some(ErrorPrefix::Restricted),
            "mute" => Some(ErrorPrefix::Mute),
            "error" => Some(ErrorPrefix::Error),
            "auth-required" => Some(ErrorPrefix::AuthRequired),
            _ => None,
        }
    }
}

/// A prefixed rejection from an upstream relay, with the peer it came from.
#[derive(Debug, Clone)]
pub struct PrefixedError {
    pub prefix: Option<ErrorPrefix>,
    pub message: String,
    pub peer: String,
}

impl std::fmt::Display for PrefixedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_check_shape_matches() {
        let mut tags = BTreeMap::new();
        tags.insert("#e".to_string(), vec!["deadbeef".to_string()]);
        let f = Filter {
            kinds: vec![5],
            tags,
            ..Default::default()
        };
        assert!(f.is_deletion_check_shape());
    }

    #[test]
    fn deletion_check_shape_rejects_extra_authors() {
        let mut tags = BTreeMap::new();
        tags.insert("#e".to_string(), vec!["deadbeef".to_string()]);
        let f = Filter {
            kinds: vec![5],
            authors: vec!["abc".to_string()],
            tags,
            ..Default::default()
        };
        assert!(!f.is_deletion_check_shape());
    }

    #[test]
    fn deletion_check_shape_rejects_multiple_e_tags() {
        let mut tags = BTreeMap::new();
        tags.insert("#e".to_string(), vec!["a".to_string(), "b".to_string()]);
        let f = Filter {
            kinds: vec![5],
            tags,
            ..Default::default()
        };
        assert!(!f.is_deletion_check_shape());
    }

    #[test]
    fn error_prefix_roundtrip() {
        for p in [
            ErrorPrefix::Duplicate,
            ErrorPrefix::Pow,
            ErrorPrefix::Blocked,
            ErrorPrefix::RateLimited,
            ErrorPrefix::Invalid,
            ErrorPrefix::Restricted,
            ErrorPrefix::Mute,
            ErrorPrefix::Error,
            ErrorPrefix::AuthRequired,
        ] {
            let msg = format!("{}: some detail", p.as_str());
            assert_eq!(ErrorPrefix::parse(&msg), Some(p));
        }
    }

    #[test]
    fn error_prefix_unknown_returns_none() {
        assert_eq!(ErrorPrefix::parse("something weird"), None);
    }
}
