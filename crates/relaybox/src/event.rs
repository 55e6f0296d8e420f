use crate::{Error, Result};
use serde_derive::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// A nostr event as it appears on the wire.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Event {
    /// 32-bytes sha256 of the serialized event data, hex-encoded
    pub id: String,
    /// 32-bytes hex-encoded public key of the event creator
    pub pubkey: String,
    /// unix timestamp in seconds
    pub created_at: u64,
    /// event kind
    pub kind: u64,
    /// Tags
    pub tags: Vec<Vec<String>>,
    /// arbitrary string
    pub content: String,
    /// 64-bytes signature of the id, hex-encoded
    pub sig: String,
}

// Events are identified by their id; two copies of the same event
// fetched from different relays compare equal.
impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl Event {
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(Into::into)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// The first value of every tag named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.len() >= 2 && tag[0] == name)
            .map(|tag| tag[1].as_str())
    }
}

impl std::str::FromStr for Event {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Event::from_json(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = r#"{"id":"6b0e2778f7205d38319fa4a5c64bd8b07a37b46a17faae41d4026d4d46032069","pubkey":"32e1827635450ebb3c5a7d12c1f8e7b2b514439ac10a67eef3d9fd9c5c68e245","created_at":1702552477,"kind":1,"tags":[["p","f1989a96d75aa386b6b3b9aae4d18c5b665cd4ba31b8f13c1e3b9851a49219d5"],["t","nostr"]],"content":"hello","sig":"af02c971bc"}"#;

    #[test]
    fn parses_wire_event() {
        let event = Event::from_json(RAW).unwrap();
        assert_eq!(event.kind, 1);
        assert_eq!(event.created_at, 1702552477);
        assert_eq!(event.content, "hello");
        assert_eq!(event.tags.len(), 2);
    }

    #[test]
    fn equality_is_by_id() {
        let a = Event::from_json(RAW).unwrap();
        let mut b = a.clone();
        b.content = "different".to_string();
        assert_eq!(a, b);
    }

    #[test]
    fn tag_values_by_name() {
        let event = Event::from_json(RAW).unwrap();
        let hashtags: Vec<&str> = event.tag_values("t").collect();
        assert_eq!(hashtags, vec!["nostr"]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Event::from_json("not an event").is_err());
    }
}
