use std::sync::Arc;

use crate::utils::BusError;

/// Notifications broadcast by a bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Ready,
    Error(Arc<BusError>),
    Listening { queue: String },
    Subscribed { queue: String },
    Unlistened { queue: String },
    ConnectionClose,
    ConnectionError(String),
    ChannelClose { confirm: bool },
}
