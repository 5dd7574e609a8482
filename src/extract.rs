//! Link extraction, text extraction, and content hashing.
//!
//! A page is parsed once. Links MUST be pulled before text, because the text
//! walk detaches `script`/`style`/`noscript`/`iframe` subtrees from the tree
//! and anchors inside them would be lost.

use std::collections::HashSet;

use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use url::Url;

use crate::url_utils;

/// SHA-256 of the raw page bytes as 64 lowercase hex characters.
pub fn content_hash(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Extract outbound URLs from every `a[href]`, resolved against `base_url`
/// and normalized. Deduplicated within the page, document order preserved.
pub fn extract_urls(doc: &Html, base_url: &str) -> Vec<String> {
    let base = match Url::parse(base_url) {
        Ok(u) => u,
        Err(_) => return Vec::new(),
    };

    let selector = Selector::parse("a[href]").unwrap();
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for element in doc.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();

        if href.is_empty()
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with('#')
        {
            continue;
        }

        let Ok(resolved) = base.join(href) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }

        let normalized = url_utils::normalize_url(&resolved);
        if seen.insert(normalized.clone()) {
            urls.push(normalized);
        }
    }

    urls
}

/// Extract the visible text of the `<body>` subtree, trimmed.
///
/// Mutates the document: non-content subtrees are detached first so their
/// text never leaks into the corpus.
pub fn extract_text(doc: &mut Html) -> String {
    let strip = Selector::parse("script, style, noscript, iframe").unwrap();
    let doomed: Vec<_> = doc.select(&strip).map(|el| el.id()).collect();
    for id in doomed {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }

    let body = Selector::parse("body").unwrap();
    doc.select(&body)
        .next()
        .map(|b| b.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_known_values() {
        // sha256 of the empty input
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        // sha256 of "hello world"
        assert_eq!(
            content_hash(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_content_hash_properties() {
        assert_eq!(content_hash(b"same"), content_hash(b"same"));
        assert_ne!(content_hash(b"input one"), content_hash(b"input two"));
        let h = content_hash(b"anything");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_extract_urls_absolute_and_relative() {
        let doc = Html::parse_document(
            r#"<html><body><a href="https://example.com/page">a</a><a href="/about">b</a></body></html>"#,
        );
        assert_eq!(
            extract_urls(&doc, "https://example.com"),
            vec![
                "https://example.com/page".to_string(),
                "https://example.com/about".to_string()
            ]
        );
    }

    #[test]
    fn test_extract_urls_filters_schemes_and_fragments() {
        let doc = Html::parse_document(
            r##"<html><body>
                <a href="javascript:void(0)">js</a>
                <a href="mailto:a@b.com">mail</a>
                <a href="tel:123">tel</a>
                <a href="#top">hash</a>
                <a href="ftp://files.example.com/data">ftp</a>
                <a href="">empty</a>
                <a href="https://ok.example.com/x">ok</a>
            </body></html>"##,
        );
        assert_eq!(
            extract_urls(&doc, "https://example.com"),
            vec!["https://ok.example.com/x".to_string()]
        );
    }

    #[test]
    fn test_extract_urls_normalizes_and_dedupes() {
        let doc = Html::parse_document(
            r#"<html><body>
                <a href="https://Example.COM/path?b=2&a=1#frag">one</a>
                <a href="https://example.com/path?a=1&b=2">dup</a>
            </body></html>"#,
        );
        assert_eq!(
            extract_urls(&doc, "https://example.com"),
            vec!["https://example.com/path?a=1&b=2".to_string()]
        );
    }

    #[test]
    fn test_extract_urls_invalid_base() {
        let doc =
            Html::parse_document(r#"<html><body><a href="/page">link</a></body></html>"#);
        assert!(extract_urls(&doc, "://invalid").is_empty());
    }

    #[test]
    fn test_extract_text_basic() {
        let mut doc = Html::parse_document(
            "<html><body><div><span>Nested</span> <b>Text</b></div></body></html>",
        );
        let text = extract_text(&mut doc);
        assert!(text.contains("Nested"));
        assert!(text.contains("Text"));
    }

    #[test]
    fn test_extract_text_strips_non_content_subtrees() {
        let mut doc = Html::parse_document(
            "<html><body><script>var secret=1;</script><style>.a{}</style>\
             <noscript>no</noscript><iframe>frame</iframe><p>Visible</p></body></html>",
        );
        let text = extract_text(&mut doc);
        assert!(text.contains("Visible"));
        assert!(!text.contains("secret"));
        assert!(!text.contains("no"), "noscript content should be stripped: {:?}", text);
        assert!(!text.contains("frame"));
    }

    #[test]
    fn test_extract_text_empty_body() {
        let mut doc = Html::parse_document("<html><body></body></html>");
        assert_eq!(extract_text(&mut doc), "");
    }

    #[test]
    fn test_links_extracted_before_text_survive_strip() {
        // The parser calls extract_urls first; anchors inside stripped
        // subtrees would vanish if the order were reversed.
        let mut doc = Html::parse_document(
            r#"<html><body><a href="/kept">k</a><script>junk</script></body></html>"#,
        );
        let urls = extract_urls(&doc, "https://example.com");
        let _ = extract_text(&mut doc);
        assert_eq!(urls, vec!["https://example.com/kept".to_string()]);
    }
}
