#![deny(clippy::await_holding_refcell_ref)]

pub mod backend;
pub mod cluster;
pub mod commands;
pub mod common;
pub mod daemon;
pub mod pipeline;

pub type Error = crate::common::error::GridScaleError;
pub type Result<T> = std::result::Result<T, Error>;
