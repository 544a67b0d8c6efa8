//! Path parsing, validation, and normalization
//!
//! Paths use `/` as the separator. Consecutive separators collapse and empty
//! components are elided. `normalize` resolves `.` and `..` with one
//! asymmetry that callers rely on: an absolute path silently discards `..`
//! at the root, while a relative path preserves a `..` it cannot pop.

use crate::error::{FsError, Result};

/// Path separator character
pub const SEPARATOR: char = '/';

/// Maximum path length in bytes
pub const MAX_PATH: usize = 1024;

/// Size of the on-disk filename buffer; valid names are at most
/// `MAX_NAME - 1` bytes
pub const MAX_NAME: usize = 250;

const CURRENT_DIR: &str = ".";
const PARENT_DIR: &str = "..";

/// A parsed path: absolute flag plus its non-empty components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathComponents {
    pub is_absolute: bool,
    pub components: Vec<String>,
}

/// Split a path into components. A lone `/` parses to zero components with
/// `is_absolute` set. Empty input is invalid.
pub fn parse(path: &str) -> Result<PathComponents> {
    if path.is_empty() {
        return Err(FsError::Invalid);
    }

    Ok(PathComponents {
        is_absolute: path.starts_with(SEPARATOR),
        components: path
            .split(SEPARATOR)
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect(),
    })
}

/// Render components back to a path string
pub fn components_to_string(pc: &PathComponents) -> String {
    let joined = pc.components.join("/");
    if pc.is_absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        CURRENT_DIR.to_string()
    } else {
        joined
    }
}

fn strip_trailing_separators(path: &str) -> &str {
    let trimmed = path.trim_end_matches(SEPARATOR);
    if trimmed.is_empty() && path.starts_with(SEPARATOR) {
        "/"
    } else {
        trimmed
    }
}

/// Split a path into (parent, final component). The parent is `"."` when the
/// path has no separator and `"/"` when the parent is the root. Fails for
/// empty input, the root itself, or a path ending in a separator with no
/// name.
pub fn split(path: &str) -> Result<(String, String)> {
    if path.is_empty() {
        return Err(FsError::Invalid);
    }

    let trimmed = strip_trailing_separators(path);
    if trimmed == "/" {
        return Err(FsError::Invalid);
    }

    match trimmed.rfind(SEPARATOR) {
        None => Ok((CURRENT_DIR.to_string(), trimmed.to_string())),
        Some(pos) => {
            let name = &trimmed[pos + 1..];
            if name.is_empty() {
                return Err(FsError::Invalid);
            }
            let parent = if pos == 0 { "/" } else { &trimmed[..pos] };
            Ok((parent.to_string(), name.to_string()))
        }
    }
}

/// True when the path starts with the separator
pub fn is_absolute(path: &str) -> bool {
    path.starts_with(SEPARATOR)
}

/// True for `/`, including redundant trailing separators
pub fn is_root(path: &str) -> bool {
    !path.is_empty() && path.chars().all(|c| c == SEPARATOR)
}

/// Filename rules: non-empty, shorter than [`MAX_NAME`], no separator, no
/// control bytes, and not the reserved `.` / `..` names
pub fn filename_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() >= MAX_NAME {
        return false;
    }
    if name == CURRENT_DIR || name == PARENT_DIR {
        return false;
    }
    !name
        .bytes()
        .any(|b| b == SEPARATOR as u8 || b < 0x20 || b == 0x7F)
}

/// Path rules: non-empty, shorter than [`MAX_PATH`], no control bytes, and
/// every component either a valid filename or `.` / `..`
pub fn is_valid(path: &str) -> bool {
    if path.is_empty() || path.len() >= MAX_PATH {
        return false;
    }
    if path.bytes().any(|b| (b < 0x20 || b == 0x7F) && b != SEPARATOR as u8) {
        return false;
    }

    match parse(path) {
        Ok(pc) => pc
            .components
            .iter()
            .all(|c| filename_is_valid(c) || c == CURRENT_DIR || c == PARENT_DIR),
        Err(_) => false,
    }
}

/// Canonicalize a path: collapse separators, drop `.`, and resolve `..`
/// against preceding components. For absolute paths `..` at the root is
/// discarded; for relative paths an unpoppable `..` survives literally. An
/// empty result renders as `/` or `.` respectively.
pub fn normalize(path: &str) -> Result<String> {
    let pc = parse(path)?;

    let mut normalized: Vec<String> = Vec::with_capacity(pc.components.len());
    for component in &pc.components {
        if component == CURRENT_DIR {
            continue;
        }
        if component == PARENT_DIR {
            let poppable = matches!(normalized.last(), Some(last) if last != PARENT_DIR);
            if poppable {
                normalized.pop();
            } else if !pc.is_absolute {
                // a relative path keeps the .. it cannot resolve
                normalized.push(PARENT_DIR.to_string());
            }
            continue;
        }
        normalized.push(component.clone());
    }

    Ok(components_to_string(&PathComponents {
        is_absolute: pc.is_absolute,
        components: normalized,
    }))
}

/// Final component of a path; `/` for the root, `.` for an empty input
pub fn basename(path: &str) -> String {
    let trimmed = strip_trailing_separators(path);
    if trimmed.is_empty() {
        return CURRENT_DIR.to_string();
    }
    if trimmed == "/" {
        return "/".to_string();
    }
    match trimmed.rfind(SEPARATOR) {
        None => trimmed.to_string(),
        Some(pos) => trimmed[pos + 1..].to_string(),
    }
}

/// Parent of a path; `.` when there is none, `/` when the parent is the root
pub fn dirname(path: &str) -> String {
    let trimmed = strip_trailing_separators(path);
    if trimmed.is_empty() {
        return CURRENT_DIR.to_string();
    }
    if trimmed == "/" {
        return "/".to_string();
    }
    match trimmed.rfind(SEPARATOR) {
        None => CURRENT_DIR.to_string(),
        Some(0) => "/".to_string(),
        Some(pos) => trimmed[..pos].to_string(),
    }
}

/// Number of components after parsing; 0 for unparseable input
pub fn depth(path: &str) -> usize {
    parse(path).map(|pc| pc.components.len()).unwrap_or(0)
}

/// True when `prefix` is an exact prefix of `path` ending on a component
/// boundary, after normalizing both
pub fn starts_with(path: &str, prefix: &str) -> bool {
    let (Ok(norm_path), Ok(norm_prefix)) = (normalize(path), normalize(prefix)) else {
        return false;
    };

    if !norm_path.starts_with(&norm_prefix) {
        return false;
    }
    if norm_path.len() == norm_prefix.len() {
        return true;
    }
    // boundary check: the match must end exactly where a component does
    norm_prefix.ends_with(SEPARATOR)
        || norm_path.as_bytes()[norm_prefix.len()] == SEPARATOR as u8
}
