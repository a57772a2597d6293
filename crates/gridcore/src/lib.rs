#![deny(clippy::await_holding_refcell_ref)]

pub mod autoscaler;
pub mod availability;
pub mod backend;
pub mod common;
pub mod demand;
pub mod event;
pub mod host;
pub mod hostsfile;
pub mod instance;
pub mod job;
pub mod resource;
pub mod scale;
pub mod validator;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::ScaleError;
pub type Result<T> = std::result::Result<T, Error>;

/// Result of operations that talk to external systems.
pub type ScaleResult<T> = anyhow::Result<T>;

pub use common::{Map, Set};
