//! Email and domain allowlist.

/// Restricts who may obtain a session. Entries starting with `@` match a
/// whole domain, everything else is an exact email address. An empty list
/// admits everyone.
#[derive(Debug, Clone, Default)]
pub struct AccessList {
    emails: Vec<String>,
    domains: Vec<String>,
}

impl AccessList {
    pub fn new(entries: &[String]) -> Self {
        let mut emails = Vec::new();
        let mut domains = Vec::new();
        for entry in entries {
            let entry = entry.trim().to_lowercase();
            if entry.is_empty() {
                continue;
            }
            if entry.starts_with('@') {
                domains.push(entry);
            } else {
                emails.push(entry);
            }
        }
        Self { emails, domains }
    }

    /// True iff any entry is configured, i.e. authentication must resolve
    /// to an email address to be checked at all.
    pub fn requires_email(&self) -> bool {
        !self.emails.is_empty() || !self.domains.is_empty()
    }

    pub fn is_allowed(&self, email: &str) -> bool {
        if !self.requires_email() {
            return true;
        }
        let email = email.trim().to_lowercase();
        if self.emails.iter().any(|e| *e == email) {
            return true;
        }
        self.domains.iter().any(|d| email.ends_with(d.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> AccessList {
        AccessList::new(&entries.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_empty_list_allows_everyone() {
        let acl = list(&[]);
        assert!(!acl.requires_email());
        assert!(acl.is_allowed("anyone@anywhere.org"));
    }

    #[test]
    fn test_exact_email_entry() {
        let acl = list(&["alice@example.com"]);
        assert!(acl.requires_email());
        assert!(acl.is_allowed("alice@example.com"));
        assert!(acl.is_allowed("ALICE@Example.COM"));
        assert!(!acl.is_allowed("bob@example.com"));
    }

    #[test]
    fn test_domain_entry() {
        let acl = list(&["@example.com"]);
        assert!(acl.is_allowed("bob@example.com"));
        assert!(!acl.is_allowed("mal@evil.com"));
        // The suffix must include the separator, not just the characters.
        assert!(!acl.is_allowed("mal@notexample.com"));
    }

    #[test]
    fn test_mixed_entries() {
        let acl = list(&["@example.com", "carol@other.org"]);
        assert!(acl.is_allowed("x@example.com"));
        assert!(acl.is_allowed("carol@other.org"));
        assert!(!acl.is_allowed("dave@other.org"));
    }
}
