//! HTML to structured text extraction.
//!
//! Regex-driven and best-effort: documentation sites are isolated to their
//! main content, stripped of caller-supplied noise blocks, and flattened
//! into text where headings become `## heading` markers and code blocks
//! become fenced blocks tagged with their language. Every function here is
//! total: malformed input yields a (possibly empty) result, never an error.
//!
//! Pipeline order matters:
//!
//! 1. [`extract_main_html`]: first of `<main>`, `<article>`, `<body>`, whole document.
//! 2. [`strip_html_noise`]: caller regexes for nav/aside/footer blocks.
//! 3. [`html_to_text`]: structural conversion, tag stripping, entity decoding.
//! 4. [`strip_noise_lines`]: caller regexes for boilerplate lines.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use quick_xml::events::Event;
use regex::{Captures, Regex};
use url::Url;

use crate::url_policy::{canonicalize, is_allowed, UrlPolicy};

static MAIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<main[^>]*>(.*?)</main>").unwrap());
static ARTICLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<article[^>]*>(.*?)</article>").unwrap());
static BODY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<body[^>]*>(.*?)</body>").unwrap());
static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
static TITLE_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\s*\|.*$").unwrap());

static SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script\b.*?</script>").unwrap());
static STYLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<style\b.*?</style>").unwrap());
static NOSCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<noscript\b.*?</noscript>").unwrap());
static PRE_CODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<pre[^>]*>\s*<code([^>]*)>(.*?)</code>\s*</pre>").unwrap()
});
static CODE_LANG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)class=["'][^"']*language-([a-z0-9_+-]+)[^"']*["']"#).unwrap()
});
static HEADING_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    (1..=3)
        .map(|level| Regex::new(&format!(r"(?is)<h{level}\b[^>]*>(.*?)</h{level}>")).unwrap())
        .collect()
});
static BLOCK_CLOSE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)</(p|div|li|pre|code|section|article|main|ul|ol|table|tr|td|blockquote)>",
    )
    .unwrap()
});
static BR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?\s*>").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static HREF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)href=["']([^"']+)["']"#).unwrap());

static TRAILING_WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+\n").unwrap());
static BLANK_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static SPACE_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]{2,}").unwrap());

/// Decode the fixed set of entities documentation pages commonly use.
///
/// `&amp;` is decoded last so `&amp;lt;` stays a literal `&lt;`.
pub fn decode_html_entities(value: &str) -> String {
    value
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Collapse whitespace: no `\r`, no trailing spaces, at most one blank
/// line, no runs of spaces or tabs, trimmed.
pub fn normalize_whitespace(value: &str) -> String {
    let v = value.replace('\r', "");
    let v = TRAILING_WS_RE.replace_all(&v, "\n");
    let v = BLANK_RUN_RE.replace_all(&v, "\n\n");
    let v = SPACE_RUN_RE.replace_all(&v, " ");
    v.trim().to_string()
}

fn strip_tags(value: &str) -> String {
    TAG_RE.replace_all(value, " ").into_owned()
}

/// Isolate the main content region of a page.
pub fn extract_main_html(html: &str) -> &str {
    for re in [&*MAIN_RE, &*ARTICLE_RE, &*BODY_RE] {
        if let Some(inner) = re.captures(html).and_then(|c| c.get(1)) {
            if !inner.as_str().is_empty() {
                return inner.as_str();
            }
        }
    }
    html
}

/// Page title without trailing `" | Site"` branding; `fallback_url` when absent.
pub fn extract_title(html: &str, fallback_url: &str) -> String {
    let raw = match TITLE_RE.captures(html).and_then(|c| c.get(1)) {
        Some(m) if !m.as_str().trim().is_empty() => m.as_str(),
        _ => return fallback_url.to_string(),
    };

    let decoded = decode_html_entities(raw);
    let title = normalize_whitespace(&TITLE_SUFFIX_RE.replace(&decoded, ""));
    if title.is_empty() {
        fallback_url.to_string()
    } else {
        title
    }
}

/// Remove every match of the caller's noise patterns from raw HTML.
pub fn strip_html_noise(html: &str, patterns: &[Regex]) -> String {
    let mut cleaned = html.to_string();
    for pattern in patterns {
        cleaned = pattern.replace_all(&cleaned, " ").into_owned();
    }
    cleaned
}

/// Convert HTML into structured plain text.
///
/// Fenced code keeps its entities encoded until the final decode so that
/// generics such as `Vec&lt;T&gt;` survive the last tag-stripping pass.
pub fn html_to_text(html: &str) -> String {
    let cleaned = SCRIPT_RE.replace_all(html, "");
    let cleaned = STYLE_RE.replace_all(&cleaned, "");
    let cleaned = NOSCRIPT_RE.replace_all(&cleaned, "");

    let mut cleaned = PRE_CODE_RE
        .replace_all(&cleaned, |caps: &Captures| {
            let lang = CODE_LANG_RE
                .captures(&caps[1])
                .map(|c| c[1].to_lowercase())
                .unwrap_or_default();
            let code = BR_RE.replace_all(&caps[2], "\n");
            let code = TAG_RE.replace_all(&code, "");
            let code = code.replace('\r', "");
            format!("\n\n```{}\n{}\n```\n\n", lang, code.trim())
        })
        .into_owned();

    for re in HEADING_RES.iter() {
        cleaned = re
            .replace_all(&cleaned, |caps: &Captures| {
                let heading = normalize_whitespace(&decode_html_entities(&strip_tags(&caps[1])));
                if heading.is_empty() {
                    "\n".to_string()
                } else {
                    format!("\n\n## {}\n\n", heading)
                }
            })
            .into_owned();
    }

    let cleaned = BLOCK_CLOSE_RE.replace_all(&cleaned, "$0\n");
    let cleaned = BR_RE.replace_all(&cleaned, "\n");
    let stripped = TAG_RE.replace_all(&cleaned, " ");

    normalize_whitespace(&decode_html_entities(&stripped))
}

/// Drop lines that match any boilerplate pattern after trimming.
///
/// Blank lines are kept so paragraph boundaries survive for the chunker.
pub fn strip_noise_lines(text: &str, patterns: &[Regex]) -> String {
    if patterns.is_empty() {
        return text.to_string();
    }

    let kept: Vec<&str> = text
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed.is_empty() || !patterns.iter().any(|p| p.is_match(trimmed))
        })
        .collect();

    normalize_whitespace(&kept.join("\n"))
}

/// Case-insensitive scheme prefix test.
fn has_scheme(href: &str, scheme: &str) -> bool {
    href.get(..scheme.len())
        .map_or(false, |prefix| prefix.eq_ignore_ascii_case(scheme))
}

/// Resolve, canonicalize, and dedupe every `href` on a page.
///
/// `mailto:` and `javascript:` links are skipped, as are hrefs that do not
/// resolve to an absolute URL. Order of first appearance is preserved.
pub fn extract_links(html: &str, page_url: &str) -> Vec<String> {
    let base = match Url::parse(page_url) {
        Ok(u) => u,
        Err(_) => return Vec::new(),
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for caps in HREF_RE.captures_iter(html) {
        let href = caps[1].trim();
        if href.is_empty() || has_scheme(href, "mailto:") || has_scheme(href, "javascript:") {
            continue;
        }
        let absolute = match base.join(&decode_html_entities(href)) {
            Ok(u) => u,
            Err(_) => continue,
        };
        if let Ok(canonical) = canonicalize(absolute.as_str()) {
            if seen.insert(canonical.clone()) {
                links.push(canonical);
            }
        }
    }

    links
}

/// Parse `<loc>` entries out of a sitemap and keep those in crawl scope.
///
/// Parsing stops at the first XML error; entries read up to that point
/// are still returned.
pub fn extract_sitemap_urls(xml: &str, base_url: &str, policy: &UrlPolicy) -> Vec<String> {
    let mut reader = quick_xml::Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);

    let mut locs = Vec::new();
    let mut in_loc = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                in_loc = e.local_name().as_ref() == b"loc";
            }
            Ok(Event::Text(t)) if in_loc => {
                if let Ok(text) = t.unescape() {
                    locs.push(text.trim().to_string());
                }
            }
            Ok(Event::CData(c)) if in_loc => {
                locs.push(String::from_utf8_lossy(&c).trim().to_string());
            }
            Ok(Event::End(_)) => in_loc = false,
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::debug!(error = %e, "sitemap parse stopped early");
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    let mut seen = HashSet::new();
    locs.into_iter()
        .filter(|loc| !loc.is_empty())
        .filter_map(|loc| canonicalize(&loc).ok())
        .filter(|url| is_allowed(url, base_url, policy))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}
