//! Installation probe: decides whether an external tool is present.
//!
//! A probe never fails. A missing path or a missing marker is reported as
//! "not installed".

use std::path::{Path, PathBuf};

/// What must exist under an install root for the tool to count as installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// A subdirectory, e.g. a MATLAB package folder such as `+hdsort`.
    Dir(&'static str),
    /// A regular file, e.g. an entry-point script.
    File(&'static str),
}

impl Marker {
    fn present_under(self, root: &Path) -> bool {
        match self {
            Marker::Dir(name) => root.join(name).is_dir(),
            Marker::File(name) => root.join(name).is_file(),
        }
    }
}

/// Strip one pair of surrounding quote characters and make the path absolute.
///
/// Environment variables copied from shell snippets often arrive as
/// `"/opt/HDsort"`; the quotes are not part of the path.
pub fn normalize_install_path(raw: &str) -> PathBuf {
    let trimmed = raw.trim();
    let unquoted = ['"', '\'']
        .iter()
        .find_map(|q| {
            trimmed
                .strip_prefix(*q)
                .and_then(|rest| rest.strip_suffix(*q))
        })
        .unwrap_or(trimmed);

    let path = PathBuf::from(unquoted);
    std::path::absolute(&path).unwrap_or(path)
}

/// Return `true` iff `path` is set and `marker` exists under it.
pub fn is_installed(path: Option<&str>, marker: Marker) -> bool {
    match path {
        None => false,
        Some(raw) if raw.trim().is_empty() => false,
        Some(raw) => marker.present_under(&normalize_install_path(raw)),
    }
}

/// Read the first line of `<root>/version.txt`, or `"unknown"`.
pub fn read_version_file(path: Option<&str>) -> String {
    const UNKNOWN: &str = "unknown";
    let Some(raw) = path else {
        return UNKNOWN.to_string();
    };
    let file = normalize_install_path(raw).join("version.txt");
    match std::fs::read_to_string(&file) {
        Ok(contents) => contents
            .lines()
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(UNKNOWN)
            .to_string(),
        Err(e) => {
            tracing::debug!(path = %file.display(), error = %e, "no readable version file");
            UNKNOWN.to_string()
        }
    }
}
