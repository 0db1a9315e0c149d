//! Input hygiene applied before anything reaches a redirect or a mailbox.

/// Clamp a post-login redirect target to a server-relative path.
///
/// Absolute URLs, protocol-relative `//…` (and the `/\` browser quirk),
/// and anything carrying control bytes all collapse to `/`.
pub fn sanitize_redirect(input: Option<&str>) -> String {
    let candidate = input.unwrap_or("/").trim();
    let ok = candidate.starts_with('/')
        && !candidate.starts_with("//")
        && !candidate.starts_with("/\\")
        && !candidate.chars().any(|c| c.is_control());
    if ok {
        candidate.to_string()
    } else {
        "/".to_string()
    }
}

/// Accept exactly one addr-spec: a single `@`, no whitespace, no control
/// characters, both sides non-empty. Returns the canonical lowercase form.
pub fn validate_email(input: &str) -> Option<String> {
    let email = input.trim();
    if email.is_empty() || email.len() > 254 {
        return None;
    }
    if email.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return None;
    }
    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(email.to_lowercase())
}
