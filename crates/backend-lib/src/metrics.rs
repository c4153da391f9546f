// ==============
// chat-backend-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_DISCONNECTION: &str = "ws.disconnection";
pub const WS_ACTIVE: &str = "ws.active";
pub const MESSAGES_SENT: &str = "chat.messages_sent";
pub const EVENTS_BROADCAST: &str = "chat.events_broadcast";
