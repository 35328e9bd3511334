// src/utils/naming.rs
// Canonical naming helpers for agent and IOP names.

use crate::constants::MAX_NAME_LENGTH;

/// Normalize an agent or IOP name so it is safe to carry in space-separated commands.
/// Rules:
/// - Leading/trailing whitespace is trimmed
/// - Every inner whitespace character becomes `_`
/// - Names longer than `MAX_NAME_LENGTH` characters are truncated
pub fn sanitize_name(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .take(MAX_NAME_LENGTH)
        .collect()
}

/// True when `s` needs no changes to be used as a name.
pub fn is_clean_name(s: &str) -> bool {
    !s.is_empty() && sanitize_name(s) == s
}
