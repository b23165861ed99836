//! URL utilities for consistent URL handling
//!
//! The completion server is addressed by a base URL that the plain and
//! tool-augmented endpoints are joined onto.

/// Normalize a base URL by removing trailing slashes
///
/// This ensures consistent URL construction when appending endpoints,
/// preventing double slashes in the final URLs.
///
/// # Examples
///
/// ```
/// use muxchat::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://api.example.com/v1"), "https://api.example.com/v1");
/// assert_eq!(normalize_base_url("https://api.example.com/v1/"), "https://api.example.com/v1");
/// assert_eq!(normalize_base_url("https://api.example.com/v1///"), "https://api.example.com/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Construct a complete API endpoint URL from a base URL and endpoint path
///
/// This function normalizes the base URL and safely appends the endpoint,
/// ensuring there are no double slashes in the result.
///
/// # Examples
///
/// ```
/// use muxchat::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://api.example.com/v1", "chat/completions"),
///     "https://api.example.com/v1/chat/completions"
/// );
/// assert_eq!(
///     construct_api_url("https://api.example.com/v1/", "chat/completions"),
///     "https://api.example.com/v1/chat/completions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

/// Check that `base_url` is an absolute http(s) URL with a host, returning
/// it without trailing slashes.
///
/// ```
/// use muxchat::utils::url::validate_base_url;
///
/// assert_eq!(validate_base_url(" http://localhost:8080/ ").unwrap(), "http://localhost:8080");
/// assert!(validate_base_url("localhost:8080").is_err());
/// ```
pub fn validate_base_url(base_url: &str) -> Result<String, String> {
    let trimmed = base_url.trim();
    let url = reqwest::Url::parse(trimmed).map_err(|err| err.to_string())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err("URL has no host".to_string());
    }
    Ok(normalize_base_url(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        // No trailing slash - should remain unchanged
        assert_eq!(
            normalize_base_url("https://api.example.com/v1"),
            "https://api.example.com/v1"
        );

        // Single trailing slash - should be removed
        assert_eq!(
            normalize_base_url("https://api.example.com/v1/"),
            "https://api.example.com/v1"
        );

        // Multiple trailing slashes - should all be removed
        assert_eq!(
            normalize_base_url("https://api.example.com/v1///"),
            "https://api.example.com/v1"
        );

        // Root URL with trailing slash
        assert_eq!(
            normalize_base_url("https://api.example.com/"),
            "https://api.example.com"
        );

        // Root URL without trailing slash
        assert_eq!(
            normalize_base_url("https://api.example.com"),
            "https://api.example.com"
        );

        // Empty string
        assert_eq!(normalize_base_url(""), "");

        // Just slashes
        assert_eq!(normalize_base_url("///"), "");
    }

    #[test]
    fn test_construct_api_url() {
        // Normal case - no trailing slash on base URL
        assert_eq!(
            construct_api_url("https://api.example.com/v1", "chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );

        // Base URL with trailing slash
        assert_eq!(
            construct_api_url("https://api.example.com/v1/", "chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );

        // Endpoint with leading slash
        assert_eq!(
            construct_api_url("https://api.example.com/v1", "/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );

        // Both base URL with trailing slash and endpoint with leading slash
        assert_eq!(
            construct_api_url("https://api.example.com/v1/", "/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );

        // Multiple trailing slashes on base URL
        assert_eq!(
            construct_api_url("https://api.example.com/v1///", "models"),
            "https://api.example.com/v1/models"
        );

        // Multiple leading slashes on endpoint
        assert_eq!(
            construct_api_url("https://api.example.com/v1", "///models"),
            "https://api.example.com/v1/models"
        );

        // Tool-augmented endpoint keeps its nested path
        assert_eq!(
            construct_api_url("http://localhost:8080/", "mcp/chat/completions"),
            "http://localhost:8080/mcp/chat/completions"
        );
    }

    #[test]
    fn validate_base_url_rejects_unusable_values() {
        assert_eq!(
            validate_base_url("https://api.example.com/v1//"),
            Ok("https://api.example.com/v1".to_string())
        );
        assert!(validate_base_url("ftp://example.com").is_err());
        assert!(validate_base_url("http://").is_err());
        assert!(validate_base_url("http://:8080").is_err());
        assert!(validate_base_url("http://exa mple.com").is_err());
        assert!(validate_base_url("http://host:notaport").is_err());
        assert!(validate_base_url("http://a:99999").is_err());
        assert!(validate_base_url("http://ex%ample.com").is_err());
        assert_eq!(
            validate_base_url("ftp://example.com"),
            Err("unsupported scheme 'ftp'".to_string())
        );
    }
}
