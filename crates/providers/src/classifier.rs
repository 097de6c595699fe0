//! Extraction and tagging of provider links from free-form text.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use crate::provider::ProviderTag;

static URL_CANDIDATE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)https?://\S+").unwrap());

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}', '>', '\'', '"'];

/// Host prefixes that do not change the resource a link points at.
const IGNORED_HOST_PREFIXES: &[&str] = &["www.", "m."];

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("invalid pattern for {provider}: {source}")]
    Pattern {
        provider: ProviderTag,
        #[source]
        source: regex::Error,
    },
    #[error("failed to read link rules: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse link rules: {0}")]
    Json(#[from] serde_json::Error),
}

/// One row of the classification table as it appears in configuration.
///
/// `pattern` is matched against `host/path` of the link after the host has
/// been lowercased and stripped of `www.`/`m.`, e.g.
/// `youtube.com/watch` or `vm.tiktok.com/ZMabc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRuleConfig {
    pub pattern: String,
    pub provider: ProviderTag,
    /// Query parameters that identify the resource and survive normalization.
    #[serde(default)]
    pub keep_query: Vec<String>,
    /// Short-link form whose expansion is left to the adapter.
    #[serde(default)]
    pub alias: bool,
}

#[derive(Debug, Clone)]
struct LinkRule {
    regex: Regex,
    provider: ProviderTag,
    keep_query: Vec<String>,
    alias: bool,
}

/// A recognised link, normalized for deduplication and fetching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ClassifiedLink {
    pub provider: ProviderTag,
    pub url: String,
    pub alias: bool,
}

struct BuiltinRule {
    pattern: &'static str,
    provider: ProviderTag,
    keep_query: &'static [&'static str],
    alias: bool,
}

macro_rules! builtin_rules {
    ( $( $provider:ident : $pattern:literal $( keep [ $($q:literal),* ] )? $( @ $alias:ident )? ),+ $(,)? ) => {
        &[
            $(
                BuiltinRule {
                    pattern: $pattern,
                    provider: ProviderTag::$provider,
                    keep_query: &[ $( $( $q ),* )? ],
                    alias: false $( || builtin_rules!(@flag $alias) )?,
                },
            )+
        ]
    };
    (@flag alias) => { true };
}

static BUILTIN_RULES: &[BuiltinRule] = builtin_rules![
    YouTube: r"^youtube\.com/watch$" keep ["v"],
    YouTube: r"^youtube\.com/(?:shorts|live)/[\w-]+",
    YouTube: r"^youtu\.be/[\w-]+" @ alias,
    TikTok: r"^tiktok\.com/@[^/]+/(?:video|photo)/\d+",
    TikTok: r"^(?:vm|vt)\.tiktok\.com/\w+" @ alias,
    TikTok: r"^tiktok\.com/t/\w+" @ alias,
    Instagram: r"^instagram\.com/(?:[\w.]+/)?(?:p|reel|reels|tv)/[\w-]+",
    Instagram: r"^instagram\.com/stories/[\w.]+",
    Reddit: r"^reddit\.com/r/\w+/(?:comments|s)/\w+",
    Reddit: r"^v\.redd\.it/\w+",
    Reddit: r"^redd\.it/\w+" @ alias,
];

/// Tags links in chat text by provider using an ordered rule table.
///
/// The first matching rule wins. Links no rule matches are dropped.
#[derive(Debug, Clone)]
pub struct LinkClassifier {
    rules: Vec<LinkRule>,
}

impl Default for LinkClassifier {
    fn default() -> Self {
        let rules = BUILTIN_RULES
            .iter()
            .map(|r| LinkRule {
                regex: Regex::new(r.pattern).unwrap(),
                provider: r.provider,
                keep_query: r.keep_query.iter().map(|q| (*q).to_owned()).collect(),
                alias: r.alias,
            })
            .collect();
        Self { rules }
    }
}

impl LinkClassifier {
    pub fn from_rules(rules: Vec<LinkRuleConfig>) -> Result<Self, ClassifierError> {
        let rules = rules
            .into_iter()
            .map(|r| {
                let regex = Regex::new(&r.pattern).map_err(|source| ClassifierError::Pattern {
                    provider: r.provider,
                    source,
                })?;
                Ok(LinkRule {
                    regex,
                    provider: r.provider,
                    keep_query: r.keep_query,
                    alias: r.alias,
                })
            })
            .collect::<Result<Vec<_>, ClassifierError>>()?;
        Ok(Self { rules })
    }

    /// Load a JSON array of [`LinkRuleConfig`] replacing the built-in table.
    pub fn from_json_file(path: &Path) -> Result<Self, ClassifierError> {
        let raw = std::fs::read_to_string(path)?;
        let rules: Vec<LinkRuleConfig> = serde_json::from_str(&raw)?;
        Self::from_rules(rules)
    }

    /// Extract, tag and normalize every supported link in `text`.
    ///
    /// Order follows first appearance; duplicates after normalization are
    /// removed. Unsupported links and plain text yield nothing.
    pub fn classify(&self, text: &str) -> Vec<ClassifiedLink> {
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for candidate in URL_CANDIDATE.find_iter(text) {
            let raw = candidate.as_str().trim_end_matches(TRAILING_PUNCTUATION);
            match self.classify_one(raw) {
                Some(link) => {
                    if seen.insert(link.url.clone()) {
                        links.push(link);
                    } else {
                        trace!(url = %link.url, "duplicate link skipped");
                    }
                }
                None => debug!(candidate = raw, "no provider matched link"),
            }
        }

        links
    }

    /// Tag a single URL.
    pub fn classify_one(&self, raw: &str) -> Option<ClassifiedLink> {
        let parsed = Url::parse(raw).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }
        let host = canonical_host(parsed.host_str()?);
        let path = parsed.path().trim_end_matches('/');
        let key = format!("{host}{path}");

        let rule = self.rules.iter().find(|r| r.regex.is_match(&key))?;

        let mut url = format!("https://{key}");
        let kept: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(k, _)| rule.keep_query.iter().any(|q| q == k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if !kept.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(kept)
                .finish();
            url.push('?');
            url.push_str(&query);
        }

        Some(ClassifiedLink {
            provider: rule.provider,
            url,
            alias: rule.alias,
        })
    }
}

fn canonical_host(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    IGNORED_HOST_PREFIXES
        .iter()
        .find_map(|p| host.strip_prefix(p))
        .map(str::to_owned)
        .unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42s", ProviderTag::YouTube, "https://youtube.com/watch?v=dQw4w9WgXcQ")]
    #[case("https://youtu.be/dQw4w9WgXcQ?si=abc", ProviderTag::YouTube, "https://youtu.be/dQw4w9WgXcQ")]
    #[case("https://m.youtube.com/shorts/abc_DEF-1/", ProviderTag::YouTube, "https://youtube.com/shorts/abc_DEF-1")]
    #[case("https://www.tiktok.com/@some.user/video/7312345678901234567?lang=en", ProviderTag::TikTok, "https://tiktok.com/@some.user/video/7312345678901234567")]
    #[case("https://vm.tiktok.com/ZMabcdef/", ProviderTag::TikTok, "https://vm.tiktok.com/ZMabcdef")]
    #[case("https://www.instagram.com/reel/C1a2b3c4d5e/?igsh=xyz", ProviderTag::Instagram, "https://instagram.com/reel/C1a2b3c4d5e")]
    #[case("HTTPS://WWW.INSTAGRAM.COM/p/ABC123/#comments", ProviderTag::Instagram, "https://instagram.com/p/ABC123")]
    #[case("https://www.reddit.com/r/rust/comments/abc123/some_title/", ProviderTag::Reddit, "https://reddit.com/r/rust/comments/abc123/some_title")]
    fn normalizes_known_links(
        #[case] input: &str,
        #[case] provider: ProviderTag,
        #[case] normalized: &str,
    ) {
        let link = LinkClassifier::default().classify_one(input).unwrap();
        assert_eq!(link.provider, provider);
        assert_eq!(link.url, normalized);
    }

    #[test]
    fn two_links_keep_submission_order() {
        let text = "look https://www.tiktok.com/@a/video/123 and also https://youtu.be/xyz!";
        let links = LinkClassifier::default().classify(text);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].provider, ProviderTag::TikTok);
        assert_eq!(links[1].provider, ProviderTag::YouTube);
        assert_eq!(links[1].url, "https://youtu.be/xyz");
    }

    #[test]
    fn upper_case_links_are_found_in_text() {
        let links = LinkClassifier::default().classify("see HTTPS://WWW.INSTAGRAM.COM/p/ABC123/ now");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].provider, ProviderTag::Instagram);
        assert_eq!(links[0].url, "https://instagram.com/p/ABC123");
    }

    #[test]
    fn duplicates_after_normalization_collapse() {
        let text = "https://www.instagram.com/p/AAA/ https://instagram.com/p/AAA?utm_source=x \
                    (https://instagram.com/p/AAA).";
        let links = LinkClassifier::default().classify(text);
        assert_eq!(links.len(), 1);
    }

    #[rstest]
    #[case("")]
    #[case("just chatting, no links here")]
    #[case("https://example.com/video/1 and ftp://youtube.com/watch?v=1")]
    #[case("https://www.youtube.com/ is the homepage")]
    fn unmatched_text_yields_nothing(#[case] text: &str) {
        assert!(LinkClassifier::default().classify(text).is_empty());
    }

    #[test]
    fn short_links_are_aliases_not_dropped() {
        let classifier = LinkClassifier::default();
        for url in ["https://vt.tiktok.com/ZSabc/", "https://redd.it/1abcd"] {
            let link = classifier.classify_one(url).unwrap();
            assert!(link.alias, "{url} should be an alias");
        }
        assert!(!classifier.classify_one("https://tiktok.com/@a/video/1").unwrap().alias);
    }

    #[test]
    fn custom_rules_replace_builtin_table() {
        let rules = vec![LinkRuleConfig {
            pattern: r"^clips\.example\.org/\d+".into(),
            provider: ProviderTag::YouTube,
            keep_query: vec![],
            alias: false,
        }];
        let classifier = LinkClassifier::from_rules(rules).unwrap();
        let links = classifier.classify("https://clips.example.org/42 https://youtu.be/abc");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url, "https://clips.example.org/42");
    }

    #[test]
    fn invalid_custom_pattern_is_rejected() {
        let rules = vec![LinkRuleConfig {
            pattern: "(".into(),
            provider: ProviderTag::Reddit,
            keep_query: vec![],
            alias: false,
        }];
        assert!(matches!(
            LinkClassifier::from_rules(rules),
            Err(ClassifierError::Pattern { .. })
        ));
    }
}
