use crate::{Event, Filter, Result};
use serde_json::json;

/// Messages sent by clients, received by relays
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum ClientMessage {
    Event {
        event: Event,
    },
    Req {
        sub_id: String,
        filters: Vec<Filter>,
    },
    Close {
        sub_id: String,
    },
}

impl ClientMessage {
    pub fn event(event: Event) -> Self {
        ClientMessage::Event { event }
    }

    pub fn req(sub_id: String, filters: Vec<Filter>) -> Self {
        ClientMessage::Req { sub_id, filters }
    }

    pub fn close(sub_id: String) -> Self {
        ClientMessage::Close { sub_id }
    }

    /// Subscription id this message belongs to, if it has one.
    pub fn sub_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Event { .. } => None,
            ClientMessage::Req { sub_id, .. } => Some(sub_id),
            ClientMessage::Close { sub_id } => Some(sub_id),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(match self {
            Self::Event { event } => json!(["EVENT", event]).to_string(),
            Self::Req { sub_id, filters } => {
                let mut frame = json!(["REQ", sub_id]);
                let mut filters = serde_json::to_value(filters)?;
                if let (Some(frame), Some(filters)) = (frame.as_array_mut(), filters.as_array_mut())
                {
                    frame.append(filters);
                }
                frame.to_string()
            }
            Self::Close { sub_id } => json!(["CLOSE", sub_id]).to_string(),
        })
    }
}
