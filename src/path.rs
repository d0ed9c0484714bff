//! Remote path helpers.
//!
//! Remote paths are plain `/`-separated strings; they never go through
//! `std::path`, which would apply the local platform's rules.

/// Last component of a path, ignoring trailing slashes. `/` stays `/`.
pub fn basename(path: &str) -> &str {
    if path == "/" {
        return path;
    }
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Join a directory and a child name with exactly one separator.
pub fn join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    format!("{}/{}", dir, name)
}

/// Join a ledger prefix and a name. An empty prefix is the sync root.
pub(crate) fn join_relative(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// `.` and `..` entries some servers include in listings.
pub(crate) fn is_dot_entry(name: &str) -> bool {
    name == "." || name == ".."
}

/// Successive prefixes of `path`, left to right.
///
/// `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`; `a/b` yields `a`, `a/b`.
pub fn ancestors_inclusive(path: &str) -> Vec<String> {
    let absolute = path.starts_with('/');
    let mut current = if absolute { String::from("/") } else { String::new() };
    let mut out = Vec::new();

    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push_str(segment);
        out.push(current.clone());
        current.push('/');
    }
    out
}
