use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Canonical folder-relative form: `/` separators, no leading slash, no `.` segments.
pub fn normalize_relative(path: &str) -> Result<String, PathError> {
    let unified = path.replace('\\', "/");
    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(PathError::UnsupportedComponent(path.to_string())),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

/// Absolute remote root with a leading slash and no trailing slash (`/` stays `/`).
pub fn normalize_remote_root(path: &str) -> Result<String, PathError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }
    match normalize_relative(trimmed) {
        Ok(relative) => Ok(format!("/{relative}")),
        Err(PathError::Empty) => Ok("/".to_string()),
        Err(err) => Err(err),
    }
}

pub fn join_remote(root: &str, relative: &str) -> String {
    let root = root.trim_end_matches('/');
    format!("{root}/{relative}")
}

/// Inverse of [`join_remote`]; `None` when `absolute` is not below `root`.
pub fn strip_remote_root(root: &str, absolute: &str) -> Option<String> {
    let root = root.trim_end_matches('/');
    let rest = absolute.strip_prefix(root)?;
    let rest = rest.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }
    Some(rest.to_string())
}

pub fn local_path_for(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(relative.to_string()));
            }
        }
    }
    Ok(out)
}

pub fn parent_of(relative: &str) -> Option<&str> {
    relative.rsplit_once('/').map(|(dir, _)| dir)
}

pub fn file_name(relative: &str) -> &str {
    relative.rsplit('/').next().unwrap_or(relative)
}
