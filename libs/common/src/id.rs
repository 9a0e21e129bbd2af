use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = messenger_common::id::prefixed_ulid("call");
/// assert!(id.starts_with("call_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    pub const CALL: &str = "call";
    pub const CONNECTION: &str = "conn";
    pub const SESSION: &str = "ses";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_ulid_format() {
        let id = prefixed_ulid(prefix::CALL);
        assert!(id.starts_with("call_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 4 + 1 + 26);
    }

    #[test]
    fn prefixed_ulids_are_unique() {
        let a = prefixed_ulid(prefix::CONNECTION);
        let b = prefixed_ulid(prefix::CONNECTION);
        assert_ne!(a, b);
    }
}
