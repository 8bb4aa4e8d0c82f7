pub mod cidr;
pub mod config;
pub mod credential;
pub mod error;
pub mod types;
pub mod wire;

pub use error::{RelayError, RelayResult};
pub use types::{AgentConfig, RelayMode, TokenPurpose};
