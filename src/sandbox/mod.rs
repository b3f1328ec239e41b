//! Sandbox module containing all execution-related components.

pub mod adapter;
pub mod audit;
#[cfg(feature = "wasm")]
pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod events;
pub mod governor;
pub mod health;
pub mod io;
pub mod limits;
pub mod profile;
pub mod supervisor;
pub mod types;
pub mod validator;
