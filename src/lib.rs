pub mod core;

pub use crate::core::config::{ConfigError, EngineConfig};
pub use crate::core::{Engine, EngineError, TickReport};
