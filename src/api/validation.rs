//! Shared API validation utilities.

use crate::api::error::ApiError;
use axum::http::HeaderMap;

/// Header carrying the username set by the authentication layer.
pub const USER_HEADER: &str = "x-sandbox-user";

/// Cookie carrying the username when no header is present.
pub const USER_COOKIE: &str = "username";

/// Username used when the request carries no identity.
pub const GUEST_USER: &str = "guest";

/// Maximum username length.
pub const MAX_USERNAME_LEN: usize = 64;

/// Validate a resource name with common API rules.
///
/// Rules:
/// - Length: 1..=max_len characters
/// - Allowed characters: alphanumeric, hyphen (-), underscore (_), dot (.)
/// - Must start with a letter or digit
/// - Cannot end with a hyphen
/// - No consecutive hyphens
/// - No path separators (/, \)
pub fn validate_resource_name(name: &str, kind: &str, max_len: usize) -> Result<(), ApiError> {
    let first_char = name
        .chars()
        .next()
        .ok_or_else(|| ApiError::BadRequest(format!("{} name cannot be empty", kind)))?;

    if name.len() > max_len {
        return Err(ApiError::BadRequest(format!(
            "{} name too long: {} characters (max {})",
            kind,
            name.len(),
            max_len
        )));
    }

    if !first_char.is_ascii_alphanumeric() {
        return Err(ApiError::BadRequest(format!(
            "{} name must start with a letter or digit",
            kind
        )));
    }

    if name.ends_with('-') {
        return Err(ApiError::BadRequest(format!(
            "{} name cannot end with a hyphen",
            kind
        )));
    }

    let mut prev_was_hyphen = false;
    for c in name.chars() {
        if c == '-' {
            if prev_was_hyphen {
                return Err(ApiError::BadRequest(format!(
                    "{} name cannot contain consecutive hyphens",
                    kind
                )));
            }
            prev_was_hyphen = true;
        } else {
            prev_was_hyphen = false;
        }

        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.' {
            if c == '/' || c == '\\' {
                return Err(ApiError::BadRequest(format!(
                    "{} name cannot contain path separators",
                    kind
                )));
            }
            return Err(ApiError::BadRequest(format!(
                "{} name contains invalid character: '{}'",
                kind, c
            )));
        }
    }

    Ok(())
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(axum::http::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim())
}

/// Resolve the requesting username: header, then cookie, then guest.
pub fn resolve_username(headers: &HeaderMap) -> Result<String, ApiError> {
    let from_header = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let name = from_header
        .or_else(|| cookie_value(headers, USER_COOKIE).filter(|v| !v.is_empty()))
        .unwrap_or(GUEST_USER);

    validate_resource_name(name, "user", MAX_USERNAME_LEN)?;
    Ok(name.to_string())
}
