use axum::http::{HeaderMap, Uri};

/// Extract a bearer token from the authorization header
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let auth_header = headers.get("Authorization")?;
    let auth_str = auth_header.to_str().ok()?;

    let (scheme, token) = auth_str.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}

/// Extract `token=<value>` from the query string
pub fn extract_query_token(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
}

/// Token presented by an agent: header first, then query string
pub fn presented_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    extract_bearer(headers)
        .map(str::to_string)
        .or_else(|| extract_query_token(uri))
}

/// Compare tokens without short-circuiting on the first differing byte
pub fn tokens_match(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer token123"));
        assert_eq!(extract_bearer(&headers), Some("token123"));

        headers.insert("Authorization", HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(extract_bearer(&headers), None);

        assert_eq!(extract_bearer(&HeaderMap::new()), None);
    }

    #[test]
    fn test_presented_token_prefers_header() {
        let uri: Uri = "/sse?token=from%20query&x=1".parse().unwrap();
        assert_eq!(extract_query_token(&uri).as_deref(), Some("from query"));
        assert_eq!(presented_token(&HeaderMap::new(), &uri).as_deref(), Some("from query"));

        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("bearer from-header"));
        assert_eq!(presented_token(&headers, &uri).as_deref(), Some("from-header"));

        let bare: Uri = "/sse".parse().unwrap();
        assert_eq!(presented_token(&HeaderMap::new(), &bare), None);
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abd"));
        assert!(!tokens_match("abc", "abcd"));
    }
}
