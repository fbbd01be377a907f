//! Redis backend store for the taskflow engine.
//!
//! [`RedisBackend`] implements `taskflow_core::Backend`, so several scheduler
//! processes can share one Redis database. Flow creation is a MULTI/EXEC
//! transaction and task transitions are compare-and-set Lua scripts.

mod backend;
mod client;
mod config;
mod scripts;

pub use backend::RedisBackend;
pub use client::{RedisClient, RedisClientError};
pub use config::RedisConfig;
