//! Utility macros and helpers shared by the codecs and the connection.

/// A macro for early returns with an error if a condition is not met.
///
/// This is similar to the `assert!` macro, but returns an error instead of panicking.
///
/// # Example
///
/// ```ignore
/// ensure!(line.len() <= MAX_LINE_BYTES, ParseError::too_large_chunk_line(MAX_LINE_BYTES));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;

/// Finds the first occurrence of `needle` in `haystack`.
pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Returns true if `value` contains `token` as a case-insensitive substring.
///
/// Used for the loose `Connection: keep-alive, Upgrade` style checks.
pub(crate) fn contains_token(value: &[u8], token: &str) -> bool {
    let token = token.as_bytes();
    if token.len() > value.len() {
        return false;
    }
    value.windows(token.len()).any(|window| window.eq_ignore_ascii_case(token))
}
