//! Queue backends driven through command line tools.
pub mod command;
pub mod kube;
pub mod sge;
