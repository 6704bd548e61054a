pub mod config;
pub mod types;

pub use config::GridshardConfig;
pub use types::*;
