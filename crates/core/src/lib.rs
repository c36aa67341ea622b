pub mod capability;
pub mod config;
pub mod error;
pub mod message;
pub mod paths;

pub use capability::{Capability, CapabilityDescriptor};
pub use config::Config;
pub use error::{Error, ErrorResponse, Result};
pub use message::{Message, MessageKind};
pub use paths::Paths;
