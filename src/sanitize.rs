//! Identifier and path sanitization for untrusted input.
//!
//! Two policies live here:
//! - *normalize*: map an arbitrary external identifier (a session
//!   correlation id) onto a filesystem-safe one, deterministically.
//! - *validate*: reject identifiers and paths that are not already safe
//!   (project names, phase ids, manifest paths, command arguments).

use crate::errors::SecurityViolation;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

/// Characters that carry meaning to a POSIX shell.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '<', '>', '(', ')', '{', '}', '\\', '\n', '\r', '*', '?', '!', '"',
    '\'',
];

/// Length of the hash suffix appended when normalization alters the input.
const HASH_SUFFIX_LEN: usize = 8;

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Hex-encoded SHA-256 of `input`, truncated to `len` characters.
pub fn short_hash(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..len.min(hex.len())].to_string()
}

/// Normalize an untrusted identifier into `[A-Za-z0-9_-]{1,max_len}`.
///
/// Disallowed characters (including `.`, `/`, null bytes and shell
/// metacharacters) become `_`, runs of `_` collapse, and leading/trailing
/// separators are trimmed. When the result differs from the input, or must
/// be truncated, a short hash of the *original* input is appended so two
/// distinct hostile inputs cannot collapse onto the same identifier.
pub fn normalize_identifier(
    kind: &'static str,
    raw: &str,
    max_len: usize,
) -> Result<String, SecurityViolation> {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let mapped = if is_allowed(c) { c } else { '_' };
        if mapped == '_' && out.ends_with('_') {
            continue;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_matches(|c| c == '_' || c == '-');

    if trimmed.is_empty() {
        return Err(SecurityViolation::EmptyIdentifier { kind });
    }

    let max_len = max_len.max(HASH_SUFFIX_LEN + 2);
    if trimmed == raw && trimmed.len() <= max_len {
        return Ok(trimmed.to_string());
    }

    let suffix = short_hash(raw, HASH_SUFFIX_LEN);
    let keep = max_len - HASH_SUFFIX_LEN - 1;
    let head: String = trimmed.chars().take(keep).collect();
    let head = head.trim_end_matches(|c| c == '_' || c == '-');
    Ok(format!("{}-{}", head, suffix))
}

/// Validate an identifier that must already be safe (no normalization).
///
/// Accepts `[A-Za-z0-9][A-Za-z0-9_-]{0,63}`.
pub fn validate_identifier(kind: &'static str, raw: &str) -> Result<(), SecurityViolation> {
    reject_null_bytes(kind, raw)?;
    if raw.contains("..") || raw.contains('/') || raw.contains('\\') {
        return Err(SecurityViolation::PathTraversal {
            kind,
            input: raw.to_string(),
        });
    }
    let valid = !raw.is_empty()
        && raw.len() <= 64
        && raw.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && raw.chars().all(is_allowed);
    if valid {
        Ok(())
    } else {
        Err(SecurityViolation::InvalidIdentifier {
            kind,
            input: raw.to_string(),
        })
    }
}

pub fn reject_null_bytes(kind: &'static str, raw: &str) -> Result<(), SecurityViolation> {
    if raw.contains('\0') {
        return Err(SecurityViolation::NullByte {
            kind,
            input: raw.to_string(),
        });
    }
    Ok(())
}

/// Validate a relative path that will be joined under a trusted root.
///
/// Rejects null bytes, absolute paths, drive prefixes and any `..`
/// component. `.` components are dropped from the returned path.
pub fn validate_relative_path(kind: &'static str, raw: &str) -> Result<PathBuf, SecurityViolation> {
    reject_null_bytes(kind, raw)?;
    if raw.trim().is_empty() {
        return Err(SecurityViolation::EmptyIdentifier { kind });
    }

    let path = Path::new(raw);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(SecurityViolation::PathTraversal {
                    kind,
                    input: raw.to_string(),
                });
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SecurityViolation::AbsolutePath {
                    kind,
                    input: raw.to_string(),
                });
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(SecurityViolation::EmptyIdentifier { kind });
    }
    Ok(clean)
}

/// Join an untrusted relative path under `root`, validating it first.
pub fn safe_join(root: &Path, kind: &'static str, raw: &str) -> Result<PathBuf, SecurityViolation> {
    Ok(root.join(validate_relative_path(kind, raw)?))
}

/// Reject arguments shaped like shell command injection.
///
/// Commands are never run through a shell, but manifest-supplied argv
/// elements carrying metacharacters are still refused outright.
pub fn reject_shell_metacharacters(kind: &'static str, raw: &str) -> Result<(), SecurityViolation> {
    reject_null_bytes(kind, raw)?;
    if raw.contains(SHELL_METACHARACTERS) {
        return Err(SecurityViolation::ShellMetacharacters {
            kind,
            input: raw.to_string(),
        });
    }
    Ok(())
}
