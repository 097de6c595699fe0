use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;

use super::reddit::{ALLOWED_TIME_RANGES, MediaFilter};
use crate::orchestrator::ChatKind;
use crate::recorder::UsageStats;

static SUBREDDIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9_]+$").unwrap());
static INSTAGRAM_USER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._]{1,30}$").unwrap());

const TOP_USERS: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Stats,
    Stories { username: String },
    Reddit {
        subreddit: String,
        time_range: Option<String>,
        filter: MediaFilter,
    },
    Suggestion(String),
    /// Withdraw the link message this command replies to.
    Cancel,
    /// Recognized command with bad arguments; carries the usage text.
    Usage(&'static str),
    Unknown(String),
}

const STORIES_USAGE: &str = "Please provide an Instagram username.\nExample: <code>/stories username</code>";
const REDDIT_USAGE: &str = "Usage: <code>/reddit subreddit [hour|day|week|month|year|all] [image|video]</code>";
const SUGGESTION_USAGE: &str = "Please provide your suggestion after the command.\nUsage: <code>/suggestion Your feedback text here</code>";

impl Command {
    /// Parse a `/command@bot args` message. Returns `None` for plain text.
    pub fn parse(text: &str) -> Option<Command> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let head = parts.next()?;
        let name = head.split('@').next().unwrap_or(head).to_lowercase();
        let args: Vec<&str> = parts.collect();

        let command = match name.as_str() {
            "start" => Command::Start,
            "help" => Command::Help,
            "stats" => Command::Stats,
            "cancel" => Command::Cancel,
            "stories" => match args.first().map(|u| u.trim_start_matches('@')) {
                Some(username) if INSTAGRAM_USER.is_match(username) => Command::Stories {
                    username: username.to_string(),
                },
                _ => Command::Usage(STORIES_USAGE),
            },
            "reddit" => parse_reddit(&args),
            "suggestion" => {
                let body = args.join(" ");
                if body.is_empty() {
                    Command::Usage(SUGGESTION_USAGE)
                } else {
                    Command::Suggestion(body)
                }
            }
            other => Command::Unknown(other.to_string()),
        };
        Some(command)
    }
}

fn parse_reddit(args: &[&str]) -> Command {
    let Some(first) = args.first() else {
        return Command::Usage(REDDIT_USAGE);
    };
    let first = first.to_lowercase();
    let subreddit = first.strip_prefix("r/").unwrap_or(&first);
    if !SUBREDDIT.is_match(subreddit) {
        return Command::Usage(REDDIT_USAGE);
    }

    let mut time_range = None;
    let mut filter = MediaFilter::Both;
    for arg in &args[1..] {
        let arg = arg.to_lowercase();
        match arg.as_str() {
            "image" | "images" => filter = MediaFilter::Image,
            "video" | "videos" => filter = MediaFilter::Video,
            "both" => filter = MediaFilter::Both,
            range if ALLOWED_TIME_RANGES.contains(&range) => time_range = Some(arg.clone()),
            _ => return Command::Usage(REDDIT_USAGE),
        }
    }
    Command::Reddit {
        subreddit: subreddit.to_string(),
        time_range,
        filter,
    }
}

pub fn start_text(kind: ChatKind) -> &'static str {
    match kind {
        ChatKind::Private => {
            "Hello! Send me an Instagram post/reel, TikTok video/slideshow, YouTube Shorts or Reddit link to download.\n\n\
             Use <code>/reddit</code> to get a random post from a subreddit.\n\n\
             <b>In groups:</b> add me as an admin with the 'Delete Messages' permission. \
             I will replace supported links with the downloaded media.\n\n\
             Use <code>/help</code> for more command details."
        }
        ChatKind::Group => {
            "Hi there! I'm ready to download media from supported links (Instagram, TikTok, YouTube, Reddit).\n\
             Use <code>/help</code> to see available commands.\n\
             Please make me an administrator with 'Delete Messages' for the best experience."
        }
    }
}

pub fn help_text(suggestions_enabled: bool) -> String {
    let mut text = String::from(
        "ℹ️ <b>Bot Help</b>\n\n\
         <b>Supported links:</b> Instagram posts, reels and stories, TikTok videos and slideshows, \
         YouTube videos and Shorts, Reddit videos.\n\
         - In <b>private chats</b> I reply with the media.\n\
         - In <b>groups</b> I delete the original message and post the media.\n\n\
         <b>Commands:</b>\n\
         /start - welcome message\n\
         /help - this message\n\
         /reddit subreddit [time] [image|video] - random post, e.g. <code>/reddit cats week video</code>\n\
         /stories username - latest Instagram stories\n\
         /cancel - reply to your link message to stop its download\n",
    );
    if suggestions_enabled {
        text.push_str("/suggestion text - (private chat only) send feedback to the bot owner\n");
    }
    text.push_str("\n<i>Slideshows are converted into a video.</i>");
    text
}

/// HTML table of totals and the busiest users.
pub fn render_stats(stats: &UsageStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "📊 <b>Bot Usage Statistics</b>\n");
    let _ = writeln!(
        out,
        "👤 Users: <code>{}</code> | ▶️ Calls: <code>{}</code>",
        stats.users.len(),
        stats.total("all_calls")
    );
    let _ = writeln!(
        out,
        "   ├ Links: <code>{}</code> (P) / <code>{}</code> (G)",
        stats.total("private_link"),
        stats.total("group_link")
    );
    let _ = writeln!(
        out,
        "   ├ /reddit: <code>{}</code> (P) / <code>{}</code> (G)",
        stats.total("reddit_command_private"),
        stats.total("reddit_command_group")
    );
    let _ = writeln!(out, "   ├ /stories: <code>{}</code>", stats.total("story_command"));
    let _ = writeln!(out, "   └ /stats: <code>{}</code>\n", stats.total("stats_command"));

    if !stats.providers.is_empty() {
        let _ = writeln!(out, "📦 <b>Providers</b>");
        for (name, usage) in &stats.providers {
            let _ = writeln!(out, "   {name}: <code>{}</code> ok / <code>{}</code> failed", usage.succeeded, usage.failed);
        }
        out.push('\n');
    }

    let _ = writeln!(out, "📈 <b>Top users</b>");
    let _ = writeln!(out, "<pre>ID           Total  Link P/G  Last seen");
    for (id, user) in stats.top_users(TOP_USERS) {
        let count = |key: &str| user.contexts.get(key).copied().unwrap_or(0);
        let last_seen = user.last_seen_iso.get(..10).unwrap_or(&user.last_seen_iso);
        let _ = writeln!(
            out,
            "{id:<12} {:>5}  {:>4}/{:<4} {last_seen}",
            user.call_count,
            count("private_link"),
            count("group_link"),
        );
    }
    if stats.users.len() > TOP_USERS {
        let _ = writeln!(out, "...");
    }
    out.push_str("</pre>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::{UsageContext, UsageOutcome, UsageRecord};
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case("/start", Command::Start)]
    #[case("/help@reelgrab_bot", Command::Help)]
    #[case("/stories @nasa", Command::Stories { username: "nasa".into() })]
    #[case("/stories", Command::Usage(STORIES_USAGE))]
    #[case("/reddit r/Aww week video", Command::Reddit { subreddit: "aww".into(), time_range: Some("week".into()), filter: MediaFilter::Video })]
    #[case("/reddit cats", Command::Reddit { subreddit: "cats".into(), time_range: None, filter: MediaFilter::Both })]
    #[case("/reddit cats decade", Command::Usage(REDDIT_USAGE))]
    #[case("/reddit", Command::Usage(REDDIT_USAGE))]
    #[case("/suggestion more providers please", Command::Suggestion("more providers please".into()))]
    #[case("/frobnicate", Command::Unknown("frobnicate".into()))]
    fn parses_commands(#[case] text: &str, #[case] expected: Command) {
        assert_eq!(Command::parse(text), Some(expected));
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(Command::parse("https://youtu.be/abc"), None);
        assert_eq!(Command::parse("/"), None);
    }

    #[test]
    fn help_mentions_suggestion_only_when_enabled() {
        assert!(help_text(true).contains("/suggestion"));
        assert!(!help_text(false).contains("/suggestion"));
    }

    #[test]
    fn stats_lists_users_and_totals() {
        let mut stats = UsageStats::default();
        for user in [7, 7, 8] {
            stats.apply(&UsageRecord {
                chat_id: 1,
                user_id: Some(user),
                context: UsageContext::PrivateLink,
                provider: None,
                outcome: UsageOutcome::Handled,
                duration: Duration::ZERO,
            });
        }
        let text = render_stats(&stats);
        assert!(text.contains("Users: <code>2</code>"));
        assert!(text.contains("Calls: <code>3</code>"));
        let seven = text.find("\n7 ").unwrap();
        let eight = text.find("\n8 ").unwrap();
        assert!(seven < eight);
    }
}
