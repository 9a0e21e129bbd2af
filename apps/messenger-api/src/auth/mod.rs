//! Admission: resolving a session token to a user id before upgrade.

pub mod middleware;
pub mod sessions;
