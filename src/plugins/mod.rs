//! Subsystems built on the store.

pub mod actions;
pub mod codegen;
pub mod notify;
pub mod workflow;
