//! Key-value store models.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// TTL reported for keys that never expire.
pub const NO_EXPIRY: i64 = -1;

/// Redis data type of a key, as reported by `TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    String,
    List,
    Set,
    ZSet,
    Hash,
    Stream,
    None,
    #[serde(other)]
    Unknown,
}

impl KeyType {
    /// Parse a `TYPE` reply.
    pub fn from_type_reply(reply: &str) -> Self {
        match reply {
            "string" => Self::String,
            "list" => Self::List,
            "set" => Self::Set,
            "zset" => Self::ZSet,
            "hash" => Self::Hash,
            "stream" => Self::Stream,
            "none" => Self::None,
            _ => Self::Unknown,
        }
    }
}

/// A key found by a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key: String,
    pub key_type: KeyType,
    /// Seconds until expiry, `-1` when persistent.
    pub ttl: i64,
    /// Memory usage in bytes, when the server reports it.
    pub size: Option<u64>,
}

/// Full view of a single key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyDetails {
    pub key: String,
    pub key_type: KeyType,
    pub ttl: i64,
    pub value: Value,
    pub encoding: Option<String>,
    pub size: Option<u64>,
    /// String length or collection cardinality.
    pub length: Option<u64>,
}

/// One page of an incremental key scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySearchPage {
    pub keys: Vec<KeyInfo>,
    /// Token to pass back for the next page; "0" once complete.
    pub cursor: String,
    pub scan_complete: bool,
    /// Number of keys in this page.
    pub total: i64,
}

/// Normalize a caller TTL: only positive values expire.
pub fn effective_ttl(ttl: Option<i64>) -> Option<u64> {
    ttl.filter(|t| *t > 0).map(|t| t as u64)
}
