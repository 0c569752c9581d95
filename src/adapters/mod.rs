//! Adapters
//!
//! Implementations of the publisher ports and the claim watch source.

pub mod channel;
pub mod kubernetes;
pub mod logging;

pub use channel::{ChannelPublisher, Published};
pub use kubernetes::{watch_claims, KubePublisher};
pub use logging::LoggingPublisher;
