use crate::api::models::Message;
use serde::{Deserialize, Serialize};

/// Raw push frame before dispatch: `{"type": "...", "data": ...}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct IncomingEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    UnreadCount(u64),
    NewMessage(Message),
}

#[derive(Deserialize)]
struct CountPayload {
    count: u64,
}

impl PushEvent {
    /// Decodes one text frame.
    ///
    /// `Ok(None)` is a well-formed frame of a type this client does not handle.
    /// `Err` is a malformed frame; callers drop it.
    pub fn parse(text: &str) -> serde_json::Result<Option<PushEvent>> {
        let incoming: IncomingEvent = serde_json::from_str(text)?;
        let event = match incoming.event_type.as_str() {
            "unread_count" => {
                let payload: CountPayload = serde_json::from_value(incoming.data)?;
                PushEvent::UnreadCount(payload.count)
            }
            "new_message" => PushEvent::NewMessage(serde_json::from_value(incoming.data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PushEvent::UnreadCount(_) => "unread_count",
            PushEvent::NewMessage(_) => "new_message",
        }
    }
}
