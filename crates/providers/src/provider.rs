use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// External content source a link belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTag {
    YouTube,
    TikTok,
    Instagram,
    Reddit,
}

impl ProviderTag {
    pub const ALL: [ProviderTag; 4] = [
        ProviderTag::YouTube,
        ProviderTag::TikTok,
        ProviderTag::Instagram,
        ProviderTag::Reddit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderTag::YouTube => "youtube",
            ProviderTag::TikTok => "tiktok",
            ProviderTag::Instagram => "instagram",
            ProviderTag::Reddit => "reddit",
        }
    }

    /// Human-readable name for chat messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderTag::YouTube => "YouTube",
            ProviderTag::TikTok => "TikTok",
            ProviderTag::Instagram => "Instagram",
            ProviderTag::Reddit => "Reddit",
        }
    }
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "youtube" => Ok(ProviderTag::YouTube),
            "tiktok" => Ok(ProviderTag::TikTok),
            "instagram" => Ok(ProviderTag::Instagram),
            "reddit" => Ok(ProviderTag::Reddit),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}
