//! Platform emote catalogs.
//!
//! Global catalogs cache for 30 days, per-channel catalogs for 1 day. Fetch
//! failures degrade to an empty catalog so the preservation pass keeps
//! working without emote awareness.

use crate::config::TranslationConfig;
use crate::Platform;

use moka::future::Cache;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// A handful of Twitch globals that exist regardless of catalog fetches.
const TWITCH_BUILTIN: &[&str] = &[
    "Kappa", "PogChamp", "LUL", "BibleThump", "Kreygasm", "4Head", "DansGame",
    "SwiftRage", "ResidentSleeper", "HeyGuys", "VoHiYo", "NotLikeThis",
];

pub struct EmoteCatalog {
    http: reqwest::Client,
    global: Cache<String, Arc<Vec<String>>>,
    channel: Cache<String, Arc<Vec<String>>>,
}

impl EmoteCatalog {
    pub fn new(config: &TranslationConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_millis(config.emote_fetch_timeout_ms))
                .build()
                .expect("reqwest client with static config"),
            global: crate::cache::emote_cache(config.emote_global_ttl_secs),
            channel: crate::cache::emote_cache(config.emote_channel_ttl_secs),
        }
    }

    /// The emote codes active on `(platform, channel)`: builtins + global
    /// catalog + channel catalog.
    pub async fn for_channel(&self, platform: Platform, channel_id: &str) -> HashSet<String> {
        let mut emotes: HashSet<String> =
            TWITCH_BUILTIN.iter().map(|s| s.to_string()).collect();

        let global_key = platform.as_str().to_string();
        let global = self
            .global
            .get_with(global_key, async {
                Arc::new(self.fetch_global(platform).await)
            })
            .await;
        emotes.extend(global.iter().cloned());

        let channel_key = format!("{platform}:{channel_id}");
        let channel = self
            .channel
            .get_with(channel_key, async {
                Arc::new(self.fetch_channel(platform, channel_id).await)
            })
            .await;
        emotes.extend(channel.iter().cloned());

        emotes
    }

    /// Global third-party catalogs (BTTV + 7TV cover the platforms that
    /// share emote culture; others have none).
    async fn fetch_global(&self, platform: Platform) -> Vec<String> {
        let mut codes = Vec::new();
        if platform != Platform::Twitch && platform != Platform::Kick {
            return codes;
        }

        match self
            .get_json("https://api.betterttv.net/3/cached/emotes/global")
            .await
        {
            Some(body) => {
                if let Some(list) = body.as_array() {
                    codes.extend(
                        list.iter()
                            .filter_map(|e| e.get("code").and_then(|v| v.as_str()))
                            .map(str::to_string),
                    );
                }
            }
            None => tracing::debug!("bttv global emote fetch failed"),
        }

        match self.get_json("https://7tv.io/v3/emote-sets/global").await {
            Some(body) => {
                if let Some(list) = body.get("emotes").and_then(|v| v.as_array()) {
                    codes.extend(
                        list.iter()
                            .filter_map(|e| e.get("name").and_then(|v| v.as_str()))
                            .map(str::to_string),
                    );
                }
            }
            None => tracing::debug!("7tv global emote fetch failed"),
        }

        codes
    }

    async fn fetch_channel(&self, platform: Platform, channel_id: &str) -> Vec<String> {
        if platform != Platform::Twitch {
            return Vec::new();
        }

        let url = format!("https://api.betterttv.net/3/cached/users/twitch/{channel_id}");
        let Some(body) = self.get_json(&url).await else {
            tracing::debug!(channel_id, "bttv channel emote fetch failed");
            return Vec::new();
        };

        let mut codes = Vec::new();
        for key in ["channelEmotes", "sharedEmotes"] {
            if let Some(list) = body.get(key).and_then(|v| v.as_array()) {
                codes.extend(
                    list.iter()
                        .filter_map(|e| e.get("code").and_then(|v| v.as_str()))
                        .map(str::to_string),
                );
            }
        }
        codes
    }

    async fn get_json(&self, url: &str) -> Option<serde_json::Value> {
        let response = self.http.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_the_usual_suspects() {
        assert!(TWITCH_BUILTIN.contains(&"Kappa"));
        assert!(TWITCH_BUILTIN.contains(&"LUL"));
    }
}
