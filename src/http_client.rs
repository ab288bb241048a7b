use anyhow::Result;
use reqwest::{header, Client};

/// Creates the HTTP client used for search-page fetches. Sends the
/// standard headers a desktop browser would, with a configurable
/// user-agent string.
pub fn create_http_client(user_agent: &str) -> Result<Client> {
    let mut headers = header::HeaderMap::new();

    headers.insert(
        header::ACCEPT,
        header::HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        header::HeaderValue::from_static("de-DE,de;q=0.9,en-US;q=0.8,en;q=0.7"),
    );
    headers.insert(
        header::ACCEPT_ENCODING,
        header::HeaderValue::from_static("gzip, deflate, br"),
    );
    headers.insert(
        header::CONNECTION,
        header::HeaderValue::from_static("keep-alive"),
    );
    headers.insert(
        "Upgrade-Insecure-Requests",
        header::HeaderValue::from_static("1"),
    );

    let client = Client::builder()
        .user_agent(user_agent)
        .default_headers(headers)
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_http_client_succeeds() {
        let result = create_http_client("Mozilla/5.0 (Test Agent)");
        assert!(result.is_ok(), "Client creation should succeed");
    }

    #[test]
    fn test_http_client_with_different_user_agents() {
        let user_agents = vec![
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64)",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)",
        ];

        for ua in user_agents {
            let client = create_http_client(ua);
            assert!(client.is_ok(), "Failed to create client with user agent: {}", ua);
        }
    }
}
