use url::Url;

/// Extracts the host of a URL, with the port when one is explicit
///
/// The result keys per-host rate limiting and prefixes record identities, so
/// two servers on one machine (different ports) are distinct hosts.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use c2c_scraper::url::extract_host;
///
/// let url = Url::parse("https://API.camptocamp.org/routes").unwrap();
/// assert_eq!(extract_host(&url), Some("api.camptocamp.org".to_string()));
///
/// let url = Url::parse("http://127.0.0.1:8080/routes").unwrap();
/// assert_eq!(extract_host(&url), Some("127.0.0.1:8080".to_string()));
/// ```
pub fn extract_host(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_lowercase();
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// Returns the URL with its last path segment, query and fragment removed
///
/// `https://api.camptocamp.org/outings?act=ice_climbing` has the API root
/// `https://api.camptocamp.org/`; detail URLs are built as
/// `<root><kind>/<id>`.
pub fn api_root(url: &Url) -> Url {
    let mut root = url.clone();
    root.set_query(None);
    root.set_fragment(None);
    if let Ok(mut segments) = root.path_segments_mut() {
        segments.pop_if_empty().pop();
    }
    if !root.path().ends_with('/') {
        let path = format!("{}/", root.path());
        root.set_path(&path);
    }
    root
}
