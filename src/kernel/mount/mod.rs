//! Filesystem isolation and mount management
//!
//! Assembles the sandbox root inside a private mount namespace.

pub mod filesystem;

pub use filesystem::FilesystemSetup;
