/// Domain and address helpers shared by the context builder and the plugins
pub struct DomainUtils;

const TWO_PART_TLDS: &[&str] = &[
    "co.uk", "com.au", "co.jp", "co.kr", "com.br", "co.za", "com.mx", "co.in", "com.sg",
    "co.nz", "com.ar", "co.il", "org.uk", "net.au", "gov.uk", "ac.uk", "edu.au",
];

impl DomainUtils {
    /// Extract the domain of an email address, stripping SMTP artifacts
    /// such as `>` or trailing `;param=value` pieces.
    pub fn extract_domain(email: &str) -> Option<String> {
        let at_pos = email.rfind('@')?;
        if at_pos == 0 {
            return None;
        }

        let domain = email[at_pos + 1..]
            .split_whitespace()
            .next()?
            .split(['>', ',', ';'])
            .next()?
            .trim()
            .trim_end_matches('.');

        let valid = domain.contains('.')
            && domain.len() < 255
            && !domain.starts_with('.')
            && domain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');

        valid.then(|| domain.to_lowercase())
    }

    /// Pull the bare address out of a header value like `"Name" <a@b.com>`
    pub fn extract_email_from_header(value: &str) -> Option<String> {
        let candidate = match (value.rfind('<'), value.rfind('>')) {
            (Some(start), Some(end)) if start < end => &value[start + 1..end],
            _ => value.trim(),
        };
        let candidate = candidate.trim().trim_matches(['<', '>', '"']);
        if candidate.contains('@') && Self::extract_domain(candidate).is_some() {
            Some(candidate.to_lowercase())
        } else {
            None
        }
    }

    /// Registrable part of a hostname, e.g. "email.natgeo.com" -> "natgeo.com",
    /// "mail.example.co.uk" -> "example.co.uk"
    pub fn root_domain(domain: &str) -> String {
        let domain = domain.trim_end_matches('.').to_lowercase();
        let parts: Vec<&str> = domain.split('.').collect();
        if parts.len() < 2 {
            return domain;
        }

        let last_two = format!("{}.{}", parts[parts.len() - 2], parts[parts.len() - 1]);
        if parts.len() >= 3 && TWO_PART_TLDS.contains(&last_two.as_str()) {
            return format!("{}.{}", parts[parts.len() - 3], last_two);
        }
        last_two
    }

    /// Relaxed (organizational domain) alignment as DMARC defines it
    pub fn is_aligned(a: &str, b: &str) -> bool {
        Self::root_domain(a) == Self::root_domain(b)
    }

    /// Check if domain matches any in list (with hierarchy support)
    pub fn matches_domain_list(domain: &str, domain_list: &[String]) -> bool {
        let domain_lower = domain.to_lowercase();

        domain_list.iter().any(|pattern| {
            let pattern_lower = pattern.to_lowercase();
            domain_lower == pattern_lower || domain_lower.ends_with(&format!(".{pattern_lower}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            DomainUtils::extract_domain("user@example.com"),
            Some("example.com".to_string())
        );
        assert_eq!(
            DomainUtils::extract_domain("user@sendgrid.net>,body=8bitmime"),
            Some("sendgrid.net".to_string())
        );
        assert_eq!(
            DomainUtils::extract_domain("user@domain.com;param=value"),
            Some("domain.com".to_string())
        );
        assert_eq!(DomainUtils::extract_domain("invalid"), None);
        assert_eq!(DomainUtils::extract_domain("@domain.com"), None);
        assert_eq!(DomainUtils::extract_domain("user@"), None);
        assert_eq!(DomainUtils::extract_domain("user@invalid_chars!"), None);
    }

    #[test]
    fn test_extract_email_from_header() {
        assert_eq!(
            DomainUtils::extract_email_from_header("\"State Farm\" <Claims@Psybook.info>"),
            Some("claims@psybook.info".to_string())
        );
        assert_eq!(
            DomainUtils::extract_email_from_header("plain@example.org"),
            Some("plain@example.org".to_string())
        );
        assert_eq!(DomainUtils::extract_email_from_header("No Address"), None);
    }

    #[test]
    fn test_root_domain() {
        assert_eq!(
            DomainUtils::root_domain("email.nationalgeographic.com"),
            "nationalgeographic.com"
        );
        assert_eq!(DomainUtils::root_domain("mail.example.co.uk"), "example.co.uk");
        assert_eq!(DomainUtils::root_domain("single"), "single");
    }

    #[test]
    fn test_alignment_and_lists() {
        assert!(DomainUtils::is_aligned("mail.example.com", "example.com"));
        assert!(!DomainUtils::is_aligned("example.com", "sendgrid.net"));

        let domains = vec!["example.com".to_string(), "test.org".to_string()];
        assert!(DomainUtils::matches_domain_list("mail.example.com", &domains));
        assert!(!DomainUtils::matches_domain_list("other.com", &domains));
    }
}
