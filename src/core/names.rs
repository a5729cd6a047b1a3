//! Topic and channel name rules.

pub const EPHEMERAL_SUFFIX: &str = "#ephemeral";
const MAX_NAME_LEN: usize = 64;

/// `[A-Za-z0-9._-]{1,64}`, optionally followed by `#ephemeral`.
pub fn is_valid_name(name: &str) -> bool {
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    if base.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    base.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

pub fn is_ephemeral(name: &str) -> bool {
    name.ends_with(EPHEMERAL_SUFFIX)
}
