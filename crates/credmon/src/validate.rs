//! Input validation for names taken from the credential directory.
//!
//! Request file stems are written by unprivileged producers, so every
//! username is checked here before it is used to build a path or passed
//! to a subprocess. All validation is pure and returns a readable message.

/// Maximum username length (Linux limit is 32).
pub const USERNAME_MAX_LEN: usize = 32;

/// Validate a username taken from a `<username>.cred` file stem.
///
/// Rules:
/// - Not empty, at most 32 characters
/// - First character is an ascii letter or underscore
/// - Remaining characters are ascii letters, digits, `_`, `.` or `-`
/// - A single trailing `$` is allowed (machine accounts)
/// - Never `.` or `..`
pub fn validate_username(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("username is empty".into());
    }
    if name.len() > USERNAME_MAX_LEN {
        return Err(format!(
            "username too long ({} > {USERNAME_MAX_LEN})",
            name.len()
        ));
    }
    if name == "." || name == ".." {
        return Err(format!("username '{name}' is a path component"));
    }

    let body = name.strip_suffix('$').unwrap_or(name);
    let mut chars = body.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(format!(
                "username '{name}' must start with a letter or '_'"
            ));
        }
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-') {
        return Err(format!(
            "username '{name}' contains invalid characters (allowed: A-Z, a-z, 0-9, _, ., -)"
        ));
    }
    Ok(())
}

/// Validate an environment variable name used in a post-action template.
pub fn validate_env_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("environment key is empty".into());
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!(
            "env key '{key}' contains invalid characters (allowed: A-Z, a-z, 0-9, _)"
        ));
    }
    if key.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(format!("env key '{key}' must not start with a digit"));
    }
    Ok(())
}
