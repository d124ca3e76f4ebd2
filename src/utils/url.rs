//! URL construction for gateway endpoints.
//!
//! Base URLs arrive from configuration with or without trailing slashes;
//! these helpers keep endpoint construction free of doubled separators.

/// Strip trailing slashes from a configured base URL.
///
/// # Examples
///
/// ```
/// use ensemble::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://gateway.example/api"), "https://gateway.example/api");
/// assert_eq!(normalize_base_url("https://gateway.example/api///"), "https://gateway.example/api");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Join a base URL and an endpoint path with exactly one slash between them.
///
/// # Examples
///
/// ```
/// use ensemble::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://gateway.example/api/", "chat/completions"),
///     "https://gateway.example/api/chat/completions"
/// );
/// assert_eq!(
///     construct_api_url("https://gateway.example/api", "/conversations/c-1/messages"),
///     "https://gateway.example/api/conversations/c-1/messages"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}
