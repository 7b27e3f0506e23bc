//! UID/GID transitions into the sandbox identity.
//!
//! setresgid must run before setresuid: once the uid changes the process
//! may no longer be allowed to change its gid.

mod transition;

pub use transition::switch_identity;
