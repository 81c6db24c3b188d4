use anyhow::{Result, anyhow};

pub fn normalize_domain_for_storage(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(anyhow!("domain name is required"));
    }
    let (wildcard, rest) = match trimmed.strip_prefix("*.") {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let ascii =
        idna::domain_to_ascii(rest).map_err(|err| anyhow!("invalid domain name: {err}"))?;
    if ascii.is_empty() {
        return Err(anyhow!("invalid domain name: {input}"));
    }
    let ascii = ascii.to_lowercase();
    Ok(if wildcard { format!("*.{ascii}") } else { ascii })
}

pub fn normalize_domain_suffix_for_storage(raw: &str) -> Result<String> {
    let stripped = raw
        .trim()
        .trim_start_matches("*.")
        .trim_start_matches('.')
        .trim_end_matches('.');
    if stripped.is_empty() {
        return Ok(String::new());
    }
    normalize_domain_for_storage(stripped)
}

/// Validates and normalizes a requested domain set.
/// The result is sorted and de-duplicated so two sets can be compared directly.
pub fn normalize_domain_set<I, S>(domains: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized = Vec::new();
    for domain in domains {
        let domain = domain.as_ref();
        if domain.trim().is_empty() {
            continue;
        }
        normalized.push(normalize_domain_for_storage(domain)?);
    }

    normalized.sort();
    normalized.dedup();

    if normalized.is_empty() {
        return Err(anyhow!("At least one domain is required"));
    }
    Ok(normalized)
}

/// Strips a leading wildcard label; DNS-01 records for `*.example.com` live at `example.com`.
pub fn base_domain(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}

pub fn matches_suffix(domain: &str, suffix: &str) -> bool {
    let domain = match normalize_domain_for_storage(base_domain(domain)) {
        Ok(value) => value,
        Err(_) => return false,
    };
    let suffix = match normalize_domain_suffix_for_storage(suffix) {
        Ok(value) => value,
        Err(_) => return false,
    };
    if suffix.is_empty() {
        return false;
    }
    domain == suffix || domain.ends_with(&format!(".{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_trailing_dot() {
        assert_eq!(
            normalize_domain_for_storage(" Example.COM. ").unwrap(),
            "example.com"
        );
    }

    #[test]
    fn keeps_wildcard_prefix() {
        assert_eq!(
            normalize_domain_for_storage("*.Example.com").unwrap(),
            "*.example.com"
        );
    }

    #[test]
    fn converts_idn_to_ascii() {
        assert_eq!(
            normalize_domain_for_storage("testé.fr").unwrap(),
            "xn--test-epa.fr"
        );
    }

    #[test]
    fn domain_set_is_sorted_and_deduplicated() {
        let set = normalize_domain_set(["b.example.com", "A.example.com", "b.example.com."])
            .unwrap();
        assert_eq!(set, vec!["a.example.com", "b.example.com"]);
    }

    #[test]
    fn empty_domain_set_is_rejected() {
        assert!(normalize_domain_set(["", "  "]).is_err());
        assert!(normalize_domain_set(Vec::<String>::new()).is_err());
    }

    #[test]
    fn suffix_matching_handles_subdomains_and_wildcards() {
        assert!(matches_suffix("example.com", "example.com"));
        assert!(matches_suffix("sub.example.com", "example.com"));
        assert!(matches_suffix("*.example.com", "example.com"));
        assert!(!matches_suffix("example.com", "sub.example.com"));
        assert!(!matches_suffix("badexample.com", "example.com"));
        assert!(matches_suffix("testé.ezs3.net", "ezs3.net"));
    }
}
