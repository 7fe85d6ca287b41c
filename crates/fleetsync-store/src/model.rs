//! Store data model: transaction operations, outcomes, and keyspace notifications

use std::time::Duration;

/// Prefix of the channel a store publishes keyspace events of database 0 on
pub const KEYSPACE_CHANNEL_PREFIX: &str = "__keyspace@0__:";

/// Channel on which changes to `key` are announced.
pub fn keyspace_channel(key: &str) -> String {
    format!("{}{}", KEYSPACE_CHANNEL_PREFIX, key)
}

/// Write queued inside a watched transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOp {
    /// Reset the watched key's time-to-live
    PExpire(Duration),
    /// Delete the watched key
    Del,
}

/// Result of a watched transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// The watched key was unchanged and the queued writes were applied
    Committed,
    /// The watched key changed between the read and the commit; nothing was written
    Discarded,
    /// The caller chose not to write and released the watch
    Abandoned,
}

/// A message received on a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

impl ChannelMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    pub fn event(&self) -> KeyspaceEvent {
        KeyspaceEvent::from_payload(&self.payload)
    }
}

/// Keyspace notification payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyspaceEvent {
    Set,
    Expire,
    Del,
    Expired,
    Other(String),
}

impl KeyspaceEvent {
    pub fn from_payload(payload: &str) -> Self {
        match payload {
            "set" => KeyspaceEvent::Set,
            "expire" => KeyspaceEvent::Expire,
            "del" => KeyspaceEvent::Del,
            "expired" => KeyspaceEvent::Expired,
            other => KeyspaceEvent::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            KeyspaceEvent::Set => "set",
            KeyspaceEvent::Expire => "expire",
            KeyspaceEvent::Del => "del",
            KeyspaceEvent::Expired => "expired",
            KeyspaceEvent::Other(s) => s,
        }
    }

    /// Whether the key no longer exists after this event
    pub fn is_removal(&self) -> bool {
        matches!(self, KeyspaceEvent::Del | KeyspaceEvent::Expired)
    }
}

impl std::fmt::Display for KeyspaceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_channel() {
        assert_eq!(
            keyspace_channel("play:locks:globalCounter"),
            "__keyspace@0__:play:locks:globalCounter"
        );
    }

    #[test]
    fn test_keyspace_event_parsing() {
        assert_eq!(KeyspaceEvent::from_payload("del"), KeyspaceEvent::Del);
        assert_eq!(KeyspaceEvent::from_payload("expired"), KeyspaceEvent::Expired);
        assert_eq!(
            KeyspaceEvent::from_payload("rename_from"),
            KeyspaceEvent::Other("rename_from".to_string())
        );
        assert!(KeyspaceEvent::Del.is_removal());
        assert!(KeyspaceEvent::Expired.is_removal());
        assert!(!KeyspaceEvent::Set.is_removal());
        assert!(!KeyspaceEvent::Expire.is_removal());
    }

    #[test]
    fn test_channel_message_event() {
        let msg = ChannelMessage::new(keyspace_channel("k"), "expired");
        assert_eq!(msg.event(), KeyspaceEvent::Expired);
        assert_eq!(msg.event().to_string(), "expired");
    }
}
