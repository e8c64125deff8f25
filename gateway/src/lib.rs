//! Chat-platform transport: typed REST calls, the event stream, and an
//! in-memory stand-in with the same interface.
pub mod discord;
pub mod error;
pub mod events;
pub mod memory;
pub mod service;
pub mod types;

pub use discord::DiscordGateway;
pub use error::GatewayError;
pub use events::GatewayEvent;
pub use memory::{MemoryGateway, RoleMutation};
pub use service::GatewayService;
