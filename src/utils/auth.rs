//! Authentication utilities for API requests
//!
//! Adds provider-specific authentication headers to HTTP requests.

/// Add provider-specific authentication headers to an HTTP request.
///
/// Anthropic uses an `x-api-key` header plus `anthropic-version`; every
/// other provider gets a standard `Authorization: Bearer` header.
pub fn add_auth_headers(
    request: reqwest::RequestBuilder,
    provider_name: &str,
    api_key: &str,
) -> reqwest::RequestBuilder {
    if provider_name.eq_ignore_ascii_case("anthropic") {
        return request
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01");
    }

    request.header("Authorization", format!("Bearer {api_key}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_auth_headers_build() {
        let client = reqwest::Client::new();
        let request = client.get("https://example.com");
        let built = add_auth_headers(request, "Anthropic", "test-key")
            .build()
            .unwrap();
        assert!(built.headers().contains_key("x-api-key"));
        assert!(built.headers().contains_key("anthropic-version"));
    }

    #[test]
    fn other_providers_use_bearer_auth() {
        let client = reqwest::Client::new();
        let request = client.get("https://example.com");
        let built = add_auth_headers(request, "openai", "test-key")
            .build()
            .unwrap();
        assert_eq!(
            built.headers().get("Authorization").unwrap(),
            "Bearer test-key"
        );
    }
}
