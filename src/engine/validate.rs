//! Field checks applied before anything reaches the WAL.

use crate::limits::*;

use super::EngineError;

pub(crate) fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(field));
    }
    Ok(())
}

/// 3–50 characters of `[a-z0-9_-]`.
pub(crate) fn username(value: &str) -> Result<(), EngineError> {
    check_len("username too long", value, MAX_USERNAME_LEN)?;
    if value.len() < 3 {
        return Err(EngineError::validation("username must be at least 3 characters"));
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
    {
        return Err(EngineError::validation(
            "username may only contain lowercase letters, numbers, hyphens and underscores",
        ));
    }
    Ok(())
}

/// Non-empty `[a-z0-9-]`.
pub(crate) fn slug(value: &str) -> Result<(), EngineError> {
    check_len("slug too long", value, MAX_SLUG_LEN)?;
    if value.is_empty()
        || !value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(EngineError::validation(
            "slug may only contain lowercase letters, numbers and hyphens",
        ));
    }
    Ok(())
}

pub(crate) fn attendee_name(value: &str) -> Result<(), EngineError> {
    check_len("attendee name too long", value, MAX_NAME_LEN)?;
    if value.trim().chars().count() < 2 {
        return Err(EngineError::validation("name must be at least 2 characters"));
    }
    Ok(())
}

/// `local@domain.tld`, no whitespace, one `@`.
pub(crate) fn email(value: &str) -> Result<(), EngineError> {
    check_len("email too long", value, MAX_EMAIL_LEN)?;
    let invalid = || EngineError::validation(format!("invalid email address: {value:?}"));
    if value.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = value.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return Err(invalid());
    }
    Ok(())
}

pub(crate) fn url(value: &str) -> Result<(), EngineError> {
    check_len("url too long", value, MAX_URL_LEN)?;
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))
        .ok_or_else(|| EngineError::validation(format!("invalid url: {value:?}")))?;
    if rest.is_empty() || rest.chars().any(char::is_whitespace) {
        return Err(EngineError::validation(format!("invalid url: {value:?}")));
    }
    Ok(())
}

pub(crate) fn event_duration(minutes: u32) -> Result<(), EngineError> {
    if !(MIN_EVENT_DURATION_MIN..=MAX_EVENT_DURATION_MIN).contains(&minutes) {
        return Err(EngineError::validation(format!(
            "duration must be between {MIN_EVENT_DURATION_MIN} and {MAX_EVENT_DURATION_MIN} minutes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames() {
        assert!(username("ada_l-9").is_ok());
        assert!(username("ab").is_err());
        assert!(username("Ada").is_err());
        assert!(matches!(username(&"a".repeat(51)), Err(EngineError::LimitExceeded(_))));
    }

    #[test]
    fn slugs() {
        assert!(slug("30-min-intro").is_ok());
        assert!(slug("").is_err());
        assert!(slug("intro_call").is_err());
    }

    #[test]
    fn attendee_names() {
        assert!(attendee_name("Al").is_ok());
        assert!(attendee_name("Zoë").is_ok());
        assert!(attendee_name(" A ").is_err());
    }

    #[test]
    fn emails() {
        assert!(email("ada@example.com").is_ok());
        assert!(email("a.b+c@mail.example.org").is_ok());
        for bad in ["", "ada", "@example.com", "ada@", "ada@example", "ada@@example.com", "a da@example.com", "ada@example..com"] {
            assert!(email(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn urls() {
        assert!(url("https://zoom.us/j/1").is_ok());
        assert!(url("ftp://x").is_err());
        assert!(url("https://").is_err());
    }

    #[test]
    fn durations() {
        assert!(event_duration(15).is_ok());
        assert!(event_duration(240).is_ok());
        assert!(event_duration(14).is_err());
        assert!(event_duration(241).is_err());
    }
}
