//! URL canonicalization and crawl-scope rules.
//!
//! A canonical URL is the stable identity of a document: no fragment, no
//! tracking query keys, no trailing slash (except for the root path).
//! [`is_allowed`] decides whether a URL is inside a source's crawl scope.
//! Both functions are pure and deterministic.

use anyhow::Result;
use serde::Deserialize;
use url::Url;

/// Path extensions that are never documentation pages.
const IGNORE_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".pdf", ".zip", ".tar", ".gz", ".mp4",
    ".mp3", ".woff", ".woff2", ".ttf", ".ico",
];

/// Per-source path scoping. Empty lists impose no constraint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UrlPolicy {
    #[serde(default)]
    pub allow_prefixes: Vec<String>,
    #[serde(default)]
    pub deny_prefixes: Vec<String>,
}

fn is_tracking_key(key: &str) -> bool {
    key.starts_with("utm_") || key == "ref" || key == "source"
}

/// Normalize a URL into its canonical form.
///
/// # Errors
///
/// Returns an error if `raw` is not an absolute URL.
pub fn canonicalize(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim())?;
    url.set_fragment(None);

    if url.query().is_some() {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let kept: Vec<&(String, String)> = pairs.iter().filter(|(k, _)| !is_tracking_key(k)).collect();

        if kept.is_empty() {
            url.set_query(None);
        } else if kept.len() != pairs.len() {
            let mut query = url.query_pairs_mut();
            query.clear();
            for (k, v) in kept {
                query.append_pair(k, v);
            }
        }
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/');
        url.set_path(if trimmed.is_empty() { "/" } else { trimmed });
    }

    Ok(url.to_string())
}

/// Decide whether `url` is inside the crawl scope of `base_url`.
///
/// Requires an http(s) scheme, the same host (and port) as the base, a path
/// under the base path, a match in `allow_prefixes` when any are given, no
/// match in `deny_prefixes`, and a non-asset extension.
pub fn is_allowed(url: &str, base_url: &str, policy: &UrlPolicy) -> bool {
    let (parsed, base) = match (Url::parse(url), Url::parse(base_url)) {
        (Ok(p), Ok(b)) => (p, b),
        _ => return false,
    };

    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }

    if parsed.host_str() != base.host_str()
        || parsed.port_or_known_default() != base.port_or_known_default()
    {
        return false;
    }

    let path = parsed.path();
    let base_path = base.path().trim_end_matches('/');
    if !base_path.is_empty() && !path.starts_with(base_path) {
        return false;
    }

    if !policy.allow_prefixes.is_empty()
        && !policy.allow_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    {
        return false;
    }

    if policy.deny_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
        return false;
    }

    let lower = path.to_ascii_lowercase();
    !IGNORE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_strips_fragment_and_tracking() {
        let c = canonicalize("https://docs.example.com/guide/?utm_source=x&ref=nav&page=2#intro")
            .unwrap();
        assert_eq!(c, "https://docs.example.com/guide?page=2");
    }

    #[test]
    fn test_canonicalize_drops_empty_query() {
        let c = canonicalize("https://docs.example.com/a?utm_medium=email&source=feed").unwrap();
        assert_eq!(c, "https://docs.example.com/a");
    }

    #[test]
    fn test_canonicalize_keeps_root_slash() {
        assert_eq!(
            canonicalize("https://docs.example.com/").unwrap(),
            "https://docs.example.com/"
        );
    }

    #[test]
    fn test_canonicalize_idempotent() {
        let inputs = [
            "https://docs.example.com/a//?utm_x=1&b=hello world#frag",
            "https://docs.example.com/api/v1/",
            "http://Docs.Example.com:80/x?q=%2Fpath&ref=1",
            "https://docs.example.com",
        ];
        for input in inputs {
            let once = canonicalize(input).unwrap();
            let twice = canonicalize(&once).unwrap();
            assert_eq!(once, twice, "not idempotent for {}", input);
        }
    }

    #[test]
    fn test_canonicalize_rejects_relative() {
        assert!(canonicalize("/docs/page").is_err());
    }

    #[test]
    fn test_is_allowed_same_host_and_base_path() {
        let policy = UrlPolicy::default();
        let base = "https://docs.example.com/docs";
        assert!(is_allowed("https://docs.example.com/docs/auth", base, &policy));
        assert!(!is_allowed("https://other.example.com/docs/auth", base, &policy));
        assert!(!is_allowed("https://docs.example.com/blog/post", base, &policy));
        assert!(!is_allowed("ftp://docs.example.com/docs/file", base, &policy));
    }

    #[test]
    fn test_is_allowed_prefix_rules() {
        let policy = UrlPolicy {
            allow_prefixes: vec!["/docs".into(), "/api".into()],
            deny_prefixes: vec!["/docs/legacy".into()],
        };
        let base = "https://stripe.example.com";
        assert!(is_allowed("https://stripe.example.com/api/charges", base, &policy));
        assert!(!is_allowed("https://stripe.example.com/pricing", base, &policy));
        assert!(!is_allowed("https://stripe.example.com/docs/legacy/v1", base, &policy));
    }

    #[test]
    fn test_is_allowed_rejects_assets() {
        let policy = UrlPolicy::default();
        let base = "https://docs.example.com";
        assert!(!is_allowed("https://docs.example.com/logo.PNG", base, &policy));
        assert!(!is_allowed("https://docs.example.com/guide.pdf", base, &policy));
        assert!(is_allowed("https://docs.example.com/guide.html", base, &policy));
    }
}
