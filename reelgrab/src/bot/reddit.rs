//! Random media post from a subreddit listing.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::utils::http_client::build_client;

const REDDIT_BASE: &str = "https://www.reddit.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const USER_AGENT: &str = concat!("reelgrab/", env!("CARGO_PKG_VERSION"), " (media bot)");

pub const ALLOWED_TIME_RANGES: [&str; 6] = ["hour", "day", "week", "month", "year", "all"];
const IMAGE_EXTENSIONS: [&str; 5] = [".jpg", ".jpeg", ".png", ".gif", ".webp"];

#[derive(Debug, Error)]
pub enum RedditError {
    #[error("Subreddit 'r/{0}' not found.")]
    NotFound(String),

    #[error("Cannot access 'r/{0}' (private/quarantined?).")]
    Forbidden(String),

    #[error("No posts found in r/{0}.")]
    Empty(String),

    #[error("Couldn't find a suitable post in r/{0}. Try a different time range or filter?")]
    NoSuitablePost(String),

    #[error("Error connecting to Reddit (Status {0}).")]
    Status(u16),

    #[error("Network error connecting to Reddit.")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaFilter {
    Image,
    Video,
    #[default]
    Both,
}

impl MediaFilter {
    fn allows_image(self) -> bool {
        matches!(self, MediaFilter::Image | MediaFilter::Both)
    }

    fn allows_video(self) -> bool {
        matches!(self, MediaFilter::Video | MediaFilter::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedditMedia {
    /// Direct image URL; Telegram fetches it.
    Image(String),
    /// Hosted video; goes through the download pipeline via the permalink.
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedditPost {
    pub title: String,
    pub permalink: String,
    pub media: RedditMedia,
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Child>,
}

#[derive(Debug, Deserialize)]
struct Child {
    kind: String,
    data: PostData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PostData {
    title: String,
    permalink: String,
    url: String,
    url_overridden_by_dest: Option<String>,
    domain: String,
    post_hint: Option<String>,
    stickied: bool,
    is_gallery: bool,
    is_video: bool,
}

#[derive(Debug, Clone)]
pub struct RedditClient {
    http: reqwest::Client,
    base: String,
}

impl RedditClient {
    pub fn new() -> Result<Self, RedditError> {
        Self::with_base(REDDIT_BASE)
    }

    pub fn with_base(base: &str) -> Result<Self, RedditError> {
        Ok(Self {
            http: build_client(USER_AGENT)?,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    /// `top` for a valid time range, `hot` otherwise.
    pub fn listing_url(&self, subreddit: &str, time_range: Option<&str>) -> String {
        match time_range.filter(|t| ALLOWED_TIME_RANGES.contains(t)) {
            Some(range) => format!("{}/r/{subreddit}/top.json?limit=100&t={range}", self.base),
            None => format!("{}/r/{subreddit}/hot.json?limit=75", self.base),
        }
    }

    pub async fn random_media(
        &self,
        subreddit: &str,
        time_range: Option<&str>,
        filter: MediaFilter,
    ) -> Result<RedditPost, RedditError> {
        let url = self.listing_url(subreddit, time_range);
        info!(subreddit, ?time_range, ?filter, "fetching reddit listing");
        let response = self.http.get(&url).timeout(REQUEST_TIMEOUT).send().await?;
        match response.status().as_u16() {
            404 => return Err(RedditError::NotFound(subreddit.to_string())),
            403 => return Err(RedditError::Forbidden(subreddit.to_string())),
            code if !response.status().is_success() => return Err(RedditError::Status(code)),
            _ => {}
        }
        let listing: Listing = response.json().await?;
        let mut posts = listing.data.children;
        if posts.is_empty() {
            warn!(subreddit, "listing is empty");
            return Err(RedditError::Empty(subreddit.to_string()));
        }
        shuffle(&mut posts);
        pick_post(posts, filter, &self.base).ok_or_else(|| RedditError::NoSuitablePost(subreddit.to_string()))
    }
}

fn shuffle<T>(items: &mut [T]) {
    for i in (1..items.len()).rev() {
        let j = (rand::random::<u64>() % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

/// First usable post in listing order.
fn pick_post(posts: Vec<Child>, filter: MediaFilter, base: &str) -> Option<RedditPost> {
    posts.into_iter().find_map(|child| {
        if child.kind != "t3" {
            return None;
        }
        let post = child.data;
        if post.stickied || post.is_gallery {
            debug!(title = %post.title, "skipping stickied or gallery post");
            return None;
        }
        let media = classify_post(&post, filter)?;
        Some(RedditPost {
            title: if post.title.is_empty() {
                "Untitled Reddit Post".to_string()
            } else {
                post.title
            },
            permalink: format!("{base}{}", post.permalink),
            media,
        })
    })
}

fn classify_post(post: &PostData, filter: MediaFilter) -> Option<RedditMedia> {
    let domain = post.domain.to_lowercase();
    let target = post.url_overridden_by_dest.as_deref().unwrap_or(&post.url);

    if filter.allows_video() && (post.is_video || domain.contains("redgifs.com")) {
        return Some(RedditMedia::Video);
    }
    if !filter.allows_image() {
        return None;
    }
    let path = url::Url::parse(target)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_default();
    let known_host = matches!(domain.as_str(), "i.redd.it" | "i.imgur.com");
    let direct_link = IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext));
    let simple_imgur = domain == "imgur.com" && !path.contains("/a/");
    let hinted = post.post_hint.as_deref() == Some("image");
    (known_host || direct_link || simple_imgur || hinted).then(|| RedditMedia::Image(target.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn post(json: serde_json::Value) -> Child {
        serde_json::from_value(serde_json::json!({"kind": "t3", "data": json})).unwrap()
    }

    #[rstest]
    #[case(None, "hot.json?limit=75")]
    #[case(Some("week"), "top.json?limit=100&t=week")]
    #[case(Some("decade"), "hot.json?limit=75")]
    fn listing_url_depends_on_time_range(#[case] range: Option<&str>, #[case] suffix: &str) {
        let client = RedditClient::with_base("https://www.reddit.com").unwrap();
        assert_eq!(
            client.listing_url("aww", range),
            format!("https://www.reddit.com/r/aww/{suffix}")
        );
    }

    #[test]
    fn skips_stickied_and_gallery_posts() {
        let posts = vec![
            post(serde_json::json!({"title": "rules", "stickied": true, "domain": "i.redd.it", "url": "https://i.redd.it/a.jpg", "permalink": "/r/x/1"})),
            post(serde_json::json!({"title": "album", "is_gallery": true, "domain": "reddit.com", "url": "https://reddit.com/gallery/2", "permalink": "/r/x/2"})),
            post(serde_json::json!({"title": "cat", "domain": "i.redd.it", "url": "https://i.redd.it/c.jpg", "permalink": "/r/x/3"})),
        ];
        let picked = pick_post(posts, MediaFilter::Both, "https://www.reddit.com").unwrap();
        assert_eq!(picked.title, "cat");
        assert_eq!(picked.media, RedditMedia::Image("https://i.redd.it/c.jpg".into()));
        assert_eq!(picked.permalink, "https://www.reddit.com/r/x/3");
    }

    #[test]
    fn video_filter_ignores_images() {
        let posts = vec![
            post(serde_json::json!({"title": "pic", "domain": "i.redd.it", "url": "https://i.redd.it/c.png", "permalink": "/r/x/1"})),
            post(serde_json::json!({"title": "clip", "domain": "v.redd.it", "is_video": true, "url": "https://v.redd.it/abc", "permalink": "/r/x/comments/2/clip/"})),
        ];
        let picked = pick_post(posts, MediaFilter::Video, "https://www.reddit.com").unwrap();
        assert_eq!(picked.media, RedditMedia::Video);
    }

    #[test]
    fn text_posts_are_not_media() {
        let posts = vec![post(serde_json::json!({"title": "discussion", "domain": "self.x", "url": "https://www.reddit.com/r/x/comments/1/", "permalink": "/r/x/1"}))];
        assert!(pick_post(posts, MediaFilter::Both, REDDIT_BASE).is_none());
    }

    #[test]
    fn shuffle_keeps_elements() {
        let mut items: Vec<u32> = (0..50).collect();
        shuffle(&mut items);
        items.sort_unstable();
        assert_eq!(items, (0..50).collect::<Vec<_>>());
    }
}
