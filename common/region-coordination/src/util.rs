use crate::error::{Error, Result};

/// Validate that a name is safe to use as a single node-path segment.
///
/// Server names and encoded region names are interpolated into node paths.
/// Without validation, a name like `../../master` could address arbitrary
/// nodes.
pub fn validate_path_segment(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(Error::InvalidState(
            "path segment must be 1-255 characters".to_string(),
        ));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidState(format!(
            "path segment {name:?} is reserved"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ',' | ':'))
    {
        return Err(Error::InvalidState(format!(
            "path segment {name:?} contains invalid characters"
        )));
    }
    Ok(())
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
