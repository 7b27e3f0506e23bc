//! Configuration model
//!
//! Sandbox description, validation, and JSON loading.

pub mod builder;
pub mod loader;
pub mod types;
pub mod validator;
