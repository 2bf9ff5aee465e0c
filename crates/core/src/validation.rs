//! Input validation utilities.
//!
//! Checks applied to configuration values before they reach the document store.

use crate::{CoreError, CoreResult};

/// Validates a CouchDB database name.
///
/// The name becomes a URL path segment, so it is restricted to the character set CouchDB
/// accepts: a lowercase ASCII letter followed by lowercase letters, digits and `_$()+-/`.
///
/// # Errors
///
/// Returns `CoreError::InvalidInput` if the name is empty, too long or contains other characters.
pub fn validate_database_name(name: &str) -> CoreResult<()> {
    const MAX_DATABASE_NAME_LEN: usize = 238;

    let Some(first) = name.bytes().next() else {
        return Err(CoreError::InvalidInput(
            "database name cannot be empty".into(),
        ));
    };

    if name.len() > MAX_DATABASE_NAME_LEN {
        return Err(CoreError::InvalidInput(format!(
            "database name exceeds maximum length of {} characters",
            MAX_DATABASE_NAME_LEN
        )));
    }

    if !first.is_ascii_lowercase() {
        return Err(CoreError::InvalidInput(
            "database name must start with a lowercase letter".into(),
        ));
    }

    let ok = name.bytes().all(|b| {
        matches!(
            b,
            b'a'..=b'z' | b'0'..=b'9' | b'_' | b'$' | b'(' | b')' | b'+' | b'-' | b'/'
        )
    });

    if !ok {
        return Err(CoreError::InvalidInput(format!(
            "database name '{name}' contains invalid characters (only a-z, 0-9 and _$()+-/ allowed)"
        )));
    }

    Ok(())
}

/// Validates the pipeline worker command line.
///
/// # Errors
///
/// Returns `CoreError::InvalidInput` if no program is given.
pub fn validate_pipeline_command(command: &[String]) -> CoreResult<()> {
    match command.first() {
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(CoreError::InvalidInput(
            "pipeline command must name a program".into(),
        )),
    }
}
