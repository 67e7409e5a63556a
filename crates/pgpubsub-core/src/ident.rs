//! Safe quoting for channel identifiers and `NOTIFY` string literals.
//!
//! Channel names come from application code, not from the database, so they
//! must be treated the same way any other externally-supplied identifier is:
//! quoted, with embedded quote characters doubled rather than stripped.

/// Quote a channel name as a double-quoted SQL identifier for use in
/// `LISTEN`/`UNLISTEN`/`NOTIFY`.
///
/// # Examples
///
/// ```
/// use pgpubsub_core::ident::quote_ident;
///
/// assert_eq!(quote_ident("jobs"), "\"jobs\"");
/// assert_eq!(quote_ident("weird\"channel"), "\"weird\"\"channel\"");
/// ```
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string as a single-quoted SQL literal for use as the `NOTIFY`
/// payload.
///
/// # Examples
///
/// ```
/// use pgpubsub_core::ident::quote_literal;
///
/// assert_eq!(quote_literal("hello"), "'hello'");
/// assert_eq!(quote_literal("it's"), "'it''s'");
/// ```
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// The shape reserved for the channel-lock protocol's own sub-channel.
///
/// The router uses this to classify inbound notifications; the session uses
/// it to reject application `listen`/`notify` calls against reserved names.
pub fn is_reserved_channel(name: &str) -> bool {
    lock_channel_regex().is_match(name)
}

/// Derive the lock sub-channel name for a given application channel.
pub fn lock_channel_name(channel: &str) -> String {
    format!("__{channel}__lock__")
}

fn lock_channel_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^__.+__lock__$").expect("valid regex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("jobs"), "\"jobs\"");
        assert_eq!(quote_ident("user\"name"), "\"user\"\"name\"");
        assert_eq!(quote_ident(""), "\"\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("hello"), "'hello'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal(""), "''");
    }

    #[test]
    fn test_lock_channel_name() {
        assert_eq!(lock_channel_name("jobs"), "__jobs__lock__");
    }

    #[test]
    fn test_is_reserved_channel() {
        assert!(is_reserved_channel("__jobs__lock__"));
        assert!(is_reserved_channel("__x__lock__"));
        assert!(!is_reserved_channel("jobs"));
        assert!(!is_reserved_channel("__lock__"));
        assert!(!is_reserved_channel("jobs__lock__"));
    }
}
