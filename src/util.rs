//! Small helpers shared across modules.

use axum::http::{header, HeaderMap};

/// Parse all `Cookie` headers into `(name, value)` pairs, in order.
///
/// Malformed pairs (no `=`) are skipped. Values are not percent-decoded; they
/// are replayed verbatim on the outbound hop.
pub fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut cookies = Vec::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                cookies.push((name.to_string(), value.to_string()));
            }
        }
    }
    cookies
}

/// Look up a single cookie value by name.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    parse_cookies(headers)
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v)
}

/// Format `(name, value)` pairs back into a single `Cookie` header value.
pub fn format_cookie_header(cookies: &[(String, String)]) -> String {
    cookies
        .iter()
        .map(|(n, v)| format!("{n}={v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_cookie(raw: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(raw).unwrap());
        headers
    }

    #[test]
    fn test_parse_cookies_multiple() {
        let headers = headers_with_cookie("sid=abc; theme=dark");
        assert_eq!(
            parse_cookies(&headers),
            vec![
                ("sid".to_string(), "abc".to_string()),
                ("theme".to_string(), "dark".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_cookies_skips_malformed() {
        let headers = headers_with_cookie("garbage; sid=abc");
        assert_eq!(
            parse_cookies(&headers),
            vec![("sid".to_string(), "abc".to_string())]
        );
    }

    #[test]
    fn test_cookie_value_missing() {
        let headers = headers_with_cookie("sid=abc");
        assert_eq!(cookie_value(&headers, "other"), None);
    }

    #[test]
    fn test_format_cookie_header() {
        let cookies = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ];
        assert_eq!(format_cookie_header(&cookies), "a=1; b=2");
    }
}
