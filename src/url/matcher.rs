/// Checks if a host matches a wildcard pattern
///
/// This function supports two types of patterns:
/// 1. Exact match: "example.com" matches only "example.com"
/// 2. Wildcard match: "*.example.com" matches the bare host and any subdomain
///
/// A pattern that names a port only matches that port; a pattern without
/// one matches any port.
///
/// # Examples
///
/// ```
/// use c2c_scraper::url::matches_wildcard;
///
/// assert!(matches_wildcard("*.camptocamp.org", "api.camptocamp.org"));
/// assert!(matches_wildcard("localhost", "localhost:8080"));
/// assert!(!matches_wildcard("localhost:9000", "localhost:8080"));
/// ```
pub fn matches_wildcard(pattern: &str, candidate: &str) -> bool {
    let (pattern_host, pattern_port) = split_port(pattern);
    let (candidate_host, candidate_port) = split_port(candidate);

    if pattern_port.is_some() && pattern_port != candidate_port {
        return false;
    }

    match pattern_host.strip_prefix("*.") {
        Some(base) => {
            candidate_host == base
                || candidate_host
                    .strip_suffix(base)
                    .map_or(false, |prefix| prefix.ends_with('.'))
        }
        None => candidate_host == pattern_host,
    }
}

/// Checks a host against a list of patterns
pub fn host_allowed<S: AsRef<str>>(patterns: &[S], host: &str) -> bool {
    patterns.iter().any(|p| matches_wildcard(p.as_ref(), host))
}

fn split_port(value: &str) -> (&str, Option<&str>) {
    match value.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            (host, Some(port))
        }
        _ => (value, None),
    }
}
