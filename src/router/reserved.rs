//! Platform-reserved command tables.
//!
//! Static data compiled into the binary: one entry per (platform, command).
//! A command that conflicts with the owning platform's table is never routed
//! to modules; the platform's own action may still apply.

use crate::Platform;

const TWITCH: &[&str] = &[
    "/ban", "/unban", "/timeout", "/untimeout", "/slow", "/slowoff",
    "/followers", "/followersoff", "/subscribers", "/subscribersoff",
    "/clear", "/uniquechat", "/uniquechatoff", "/emoteonly", "/emoteonlyoff",
    "/commercial", "/host", "/unhost", "/raid", "/unraid", "/marker",
    "/mod", "/unmod", "/vip", "/unvip", "/block", "/unblock", "/color",
    "/disconnect", "/help", "/me", "/mods", "/vips", "/vote", "/w",
];

const DISCORD: &[&str] = &[
    "/ban", "/kick", "/timeout", "/mute", "/unmute", "/deafen", "/undeafen",
    "/move", "/nick", "/role", "/slowmode", "/purge", "/lock", "/unlock",
];

const SLACK: &[&str] = &[
    "/archive", "/call", "/collapse", "/dnd", "/expand", "/feed", "/invite",
    "/invite_people", "/kick", "/leave", "/me", "/msg", "/mute", "/open",
    "/prefs", "/remind", "/remove", "/rename", "/search", "/shrug",
    "/shortcuts", "/star", "/status", "/topic", "/who",
];

const YOUTUBE: &[&str] = &[
    "/ban", "/unban", "/slow", "/slowoff", "/membersonly", "/membersonlyoff",
];

const KICK: &[&str] = &[
    "/ban", "/unban", "/timeout", "/untimeout", "/slow", "/slowoff",
    "/clear", "/mod", "/unmod", "/vip", "/unvip",
];

fn table(platform: Platform) -> &'static [&'static str] {
    match platform {
        Platform::Twitch => TWITCH,
        Platform::Discord => DISCORD,
        Platform::Slack => SLACK,
        Platform::Youtube => YOUTUBE,
        Platform::Kick => KICK,
        Platform::Unknown => &[],
    }
}

/// Whether a bare command name (no prefix) collides with a command the
/// platform owns.
pub fn is_reserved(platform: Platform, command: &str) -> bool {
    let slashed = format!("/{}", command.trim_start_matches(['/', '!', '#']));
    table(platform).contains(&slashed.as_str())
}

/// Platforms on which the command is reserved. Empty when unreserved
/// everywhere.
pub fn conflicting_platforms(command: &str) -> Vec<Platform> {
    [
        Platform::Twitch,
        Platform::Discord,
        Platform::Slack,
        Platform::Youtube,
        Platform::Kick,
    ]
    .into_iter()
    .filter(|platform| is_reserved(*platform, command))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_is_reserved_on_most_platforms() {
        assert!(is_reserved(Platform::Twitch, "ban"));
        assert!(is_reserved(Platform::Discord, "/ban"));
        assert!(is_reserved(Platform::Kick, "!ban"));
        assert!(!is_reserved(Platform::Slack, "ban"));
        assert_eq!(
            conflicting_platforms("ban"),
            vec![
                Platform::Twitch,
                Platform::Discord,
                Platform::Youtube,
                Platform::Kick
            ]
        );
    }

    #[test]
    fn custom_commands_are_unreserved() {
        assert!(!is_reserved(Platform::Twitch, "quote"));
        assert!(conflicting_platforms("quote").is_empty());
    }

    #[test]
    fn me_conflicts_per_original_tables() {
        assert_eq!(
            conflicting_platforms("me"),
            vec![Platform::Twitch, Platform::Slack]
        );
    }
}
