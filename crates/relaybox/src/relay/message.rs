use crate::{Error, Result};

/// Result of an OK command, reporting whether a relay accepted an event.
#[derive(Debug, Eq, PartialEq)]
pub struct CommandResult<'a> {
    event_id: &'a str,
    status: bool,
    message: &'a str,
}

impl<'a> CommandResult<'a> {
    pub fn event_id(&self) -> &'a str {
        self.event_id
    }

    pub fn accepted(&self) -> bool {
        self.status
    }

    pub fn message(&self) -> &'a str {
        self.message
    }
}

/// A parsed relay-to-client message. Borrows from the raw frame, so the
/// frame must outlive the message.
#[derive(Debug, Eq, PartialEq)]
pub enum RelayMessage<'a> {
    OK(CommandResult<'a>),
    Eose(&'a str),
    /// Subscription id plus the whole raw frame the event arrived in.
    Event(&'a str, &'a str),
    Notice(&'a str),
    Auth(&'a str),
}

impl<'a> RelayMessage<'a> {
    pub fn eose(subid: &'a str) -> Self {
        RelayMessage::Eose(subid)
    }

    pub fn notice(msg: &'a str) -> Self {
        RelayMessage::Notice(msg)
    }

    pub fn auth(challenge: &'a str) -> Self {
        RelayMessage::Auth(challenge)
    }

    pub fn ok(event_id: &'a str, status: bool, message: &'a str) -> Self {
        RelayMessage::OK(CommandResult {
            event_id,
            status,
            message,
        })
    }

    pub fn event(ev: &'a str, sub_id: &'a str) -> Self {
        RelayMessage::Event(sub_id, ev)
    }

    pub fn from_json(msg: &'a str) -> Result<RelayMessage<'a>> {
        if msg.is_empty() {
            return Err(Error::Empty);
        }

        // make sure we can inspect the beginning of the message below ...
        if msg.len() < 12 {
            return Err(Error::DecodeFailed("message too short".into()));
        }

        // Notice
        // Relay response format: ["NOTICE", <message>]
        if msg.starts_with("[\"NOTICE\",") {
            // TODO: there could be more than one space, whatever
            let start = if msg.as_bytes().get(10) == Some(&b' ') {
                12
            } else {
                11
            };
            let end = msg.len() - 2;
            let notice = msg
                .get(start..end)
                .ok_or_else(|| Error::DecodeFailed("invalid NOTICE format".into()))?;
            return Ok(Self::notice(notice));
        }

        // Event
        // Relay response format: ["EVENT", <subscription id>, <event JSON>]
        if msg.starts_with("[\"EVENT\"") {
            let mut start = 9;
            while msg.as_bytes().get(start) == Some(&b' ') {
                start += 1; // Move past optional spaces
            }
            let rest = msg
                .get(start..)
                .ok_or_else(|| Error::DecodeFailed("Invalid EVENT format".into()))?;
            if let Some(comma_index) = rest.find(',') {
                let sub_id = rest[..comma_index].trim().trim_matches('"');
                return Ok(Self::event(msg, sub_id));
            }
            return Err(Error::DecodeFailed("Invalid EVENT format".into()));
        }

        // EOSE (NIP-15)
        // Relay response format: ["EOSE", <subscription_id>]
        if msg.starts_with("[\"EOSE\",") {
            let start = if msg.as_bytes().get(8) == Some(&b' ') {
                10 // Skip space after the comma
            } else {
                9 // Start immediately after the comma
            };

            if let Some(end_bracket_index) = msg.rfind(']') {
                if start < end_bracket_index {
                    if let Some(sub_id) = msg.get(start..end_bracket_index) {
                        return Ok(Self::eose(sub_id.trim().trim_matches('"').trim()));
                    }
                }
            }
            return Err(Error::DecodeFailed(
                "Invalid subscription ID or format".into(),
            ));
        }

        // OK (NIP-20)
        // Relay response format: ["OK",<event_id>, <true|false>, <message>]
        if msg.starts_with("[\"OK\",") && msg.len() >= 78 {
            let event_id = msg
                .get(7..71)
                .ok_or_else(|| Error::DecodeFailed("invalid OK format".into()))?;
            let (status, message_start) = if msg.get(73..77) == Some("true") {
                (true, 78)
            } else if msg.get(73..78) == Some("false") {
                (false, 79)
            } else {
                return Err(Error::DecodeFailed("bad boolean value".into()));
            };
            let message = msg
                .get(message_start..msg.len() - 2)
                .ok_or_else(|| Error::DecodeFailed("invalid OK format".into()))?
                .trim()
                .trim_matches('"');
            return Ok(Self::ok(event_id, status, message));
        }

        // AUTH (NIP-42)
        // Relay response format: ["AUTH", <challenge>]
        if msg.starts_with("[\"AUTH\",") {
            let start = if msg.as_bytes().get(8) == Some(&b' ') {
                10
            } else {
                9
            };

            if let Some(end_bracket_index) = msg.rfind(']') {
                if start < end_bracket_index {
                    if let Some(challenge) = msg.get(start..end_bracket_index) {
                        return Ok(Self::auth(challenge.trim().trim_matches('"').trim()));
                    }
                }
            }
            return Err(Error::DecodeFailed("invalid AUTH format".into()));
        }

        Err(Error::DecodeFailed(format!(
            "unrecognized message type: '{msg}'"
        )))
    }
}
