//! URL helper functions used throughout the crawler

use url::Url;

/// Extract the host portion of a URL
pub fn extract_host(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|s| s.to_string()))
}

/// Normalize a parsed URL into its canonical string form.
///
/// The `url` crate already lowercases scheme and host, resolves dot segments,
/// and drops default ports on parse. On top of that this applies: collapse
/// duplicate slashes in the path, drop the fragment, sort query parameters,
/// uppercase percent-escapes, and strip a single trailing slash.
pub fn normalize_url(input: &Url) -> String {
    let mut u = input.clone();
    u.set_fragment(None);

    let path = u.path().to_string();
    if path.contains("//") {
        u.set_path(&collapse_duplicate_slashes(&path));
    }

    let query = u.query().map(|q| q.to_string());
    match query.as_deref() {
        Some("") => u.set_query(None),
        Some(_) => {
            let mut pairs: Vec<(String, String)> = u
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            pairs.sort();
            let sorted = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            u.set_query(Some(&sorted));
        }
        None => {}
    }

    // Strip the trailing slash of a non-root path before serializing; the
    // root slash can only be removed from the serialized form because the
    // url crate always re-adds it.
    let path = u.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        u.set_path(&path[..path.len() - 1]);
    }

    let mut s = uppercase_percent_escapes(u.as_str());
    if u.path() == "/" && u.query().is_none() && s.ends_with('/') {
        s.pop();
    }
    s
}

/// Parse and normalize in one step; `None` for unparseable input.
pub fn normalize_url_str(raw: &str) -> Option<String> {
    Url::parse(raw).ok().map(|u| normalize_url(&u))
}

fn collapse_duplicate_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

fn uppercase_percent_escapes(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            out.push('%');
            out.push(bytes[i + 1].to_ascii_uppercase() as char);
            out.push(bytes[i + 2].to_ascii_uppercase() as char);
            i += 3;
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_host() {
        assert_eq!(
            extract_host("https://example.com/path"),
            Some("example.com".to_string())
        );
        assert_eq!(extract_host("invalid"), None);
    }

    #[test]
    fn test_normalize_lowercases_and_sorts_query() {
        assert_eq!(
            normalize_url_str("https://Example.COM/path?b=2&a=1#frag").unwrap(),
            "https://example.com/path?a=1&b=2"
        );
    }

    #[test]
    fn test_normalize_strips_trailing_slash() {
        assert_eq!(
            normalize_url_str("https://example.com/").unwrap(),
            "https://example.com"
        );
        assert_eq!(
            normalize_url_str("https://example.com/page/").unwrap(),
            "https://example.com/page"
        );
    }

    #[test]
    fn test_normalize_removes_default_port() {
        assert_eq!(
            normalize_url_str("https://example.com:443/x").unwrap(),
            "https://example.com/x"
        );
        assert_eq!(
            normalize_url_str("http://example.com:80/x").unwrap(),
            "http://example.com/x"
        );
    }

    #[test]
    fn test_normalize_collapses_slashes_and_dot_segments() {
        assert_eq!(
            normalize_url_str("http://example.com/a//b/./c").unwrap(),
            "http://example.com/a/b/c"
        );
        assert_eq!(
            normalize_url_str("http://example.com/a/b/../c").unwrap(),
            "http://example.com/a/c"
        );
    }

    #[test]
    fn test_normalize_uppercases_escapes() {
        assert_eq!(
            normalize_url_str("https://example.com/a%2fb").unwrap(),
            "https://example.com/a%2Fb"
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let cases = [
            "https://Example.COM/path?b=2&a=1#frag",
            "https://example.com/",
            "https://example.com//a//b/",
            "https://example.com/a%2fb?q=a%20b",
            "http://example.com:80/x/./y/../z",
        ];
        for case in cases {
            let once = normalize_url_str(case).unwrap();
            let twice = normalize_url_str(&once).unwrap();
            assert_eq!(once, twice, "normalization not idempotent for {}", case);
        }
    }
}
