pub mod cli;
pub mod error;
pub mod setup;
pub mod timeutils;
pub mod utils;
