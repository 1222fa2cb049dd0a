//! Local domain check for recipient addresses.

/// `true` when `recipient_domain` is the configured local domain, ignoring ASCII case.
///
/// Exactly one domain is served; subdomains and wildcards do not match.
pub fn validate_domain(recipient_domain: &str, configured_domain: &str) -> bool {
    !recipient_domain.is_empty() && recipient_domain.eq_ignore_ascii_case(configured_domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_match() {
        assert!(validate_domain("example.com", "example.com"));
        assert!(validate_domain("EXAMPLE.com", "example.com"));
        assert!(validate_domain("example.com", "Example.COM"));
    }

    #[test]
    fn test_mismatch() {
        assert!(!validate_domain("example.org", "example.com"));
        assert!(!validate_domain("mail.example.com", "example.com"));
        assert!(!validate_domain("example.com.", "example.com"));
        assert!(!validate_domain("", ""));
    }
}
