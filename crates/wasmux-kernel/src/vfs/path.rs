//! Lexical path handling.
//!
//! Everything here works on strings alone and never touches a filesystem.
//! `..` is resolved textually, so `/a/link/..` is `/a` even if `link` is a
//! symlink; the resolver expands symlinks separately.

/// Normalize an absolute path.
///
/// Drops `.` components, applies `..` (which stops at the root), and
/// collapses repeated and trailing slashes. Relative input is treated as if
/// it started at `/`. The result always starts with `/`.
pub fn realpath(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in &parts {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Join `path` onto `base` unless it is already absolute, then normalize.
pub fn abspath(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        realpath(path)
    } else {
        realpath(&format!("{base}/{path}"))
    }
}

/// Everything before the last component. `dirname("/a")` is `/`.
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "",
    }
}

/// The last component. `basename("/")` is `/`.
pub fn basename(path: &str) -> &str {
    if path == "/" {
        return path;
    }
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Whether `path` is `prefix` or lies beneath it. Both must be normalized.
pub fn is_within(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// `path` relative to `prefix`, as a backend path starting with `/`.
///
/// Callers check [`is_within`] first; a path outside `prefix` maps to `/`.
pub fn strip_within(path: &str, prefix: &str) -> String {
    if prefix == "/" {
        return path.to_string();
    }
    match path.strip_prefix(prefix) {
        Some("") | None => "/".to_string(),
        Some(rest) => rest.to_string(),
    }
}

/// Join a mount point and a backend-relative path back into an absolute one.
pub fn join_within(prefix: &str, rel: &str) -> String {
    if prefix == "/" {
        rel.to_string()
    } else if rel == "/" {
        prefix.to_string()
    } else {
        format!("{prefix}{rel}")
    }
}
