//! Connection model and status types
//!
//! Leaf data shared by every other module: the immutable description of a
//! connection, the lifecycle/status vocabulary reported to the platform, and
//! the message shapes crossing the mapping pipeline boundary.

pub mod connection;
pub mod message;
pub mod status;

pub use connection::{
    Connection, ConnectionId, ConsumerKey, Enforcement, HeaderMapping, ReplyTarget, Source,
    Target,
};
pub use message::{
    AckStatus, Acknowledgement, ExternalMessage, InboundOutcome, MappedMessage, OutboundSignal,
};
pub use status::{ClientState, ConnectivityStatus, ResourceStatus, ResourceType, StatusReport};
