use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 255;

/// Trims and validates a node name.
pub fn normalize_name(name: &str) -> Result<String> {
    let name = name.trim();

    if name.is_empty() {
        return Err(Error::validation("name cannot be empty"));
    }

    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::validation(format!(
            "name cannot exceed {MAX_NAME_LEN} characters"
        )));
    }

    if name.chars().any(char::is_control) {
        return Err(Error::validation("name contains invalid characters"));
    }

    Ok(name.to_string())
}
