use serde::Serialize;
use serde_derive::Deserialize;

/// Raw channel lifecycle announcements, broadcast by the channel manager.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    Open,
    Closed,
    Frame(/* raw text frame */ String),
}

/// A decoded, accepted inbound message. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub topic: String,
    pub payload: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Checking,
    Online,
    Offline,
}

#[derive(Clone, Debug)]
pub struct PresenceUpdate {
    pub device_id: String,
    pub status: Status,
}
