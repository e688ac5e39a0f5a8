//! Token preservation.
//!
//! Mentions, commands, emails, URLs, and platform emotes are replaced with
//! fixed non-linguistic placeholders before detection/translation and
//! restored byte-for-byte afterwards.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Types of tokens to preserve during translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Mention,
    Command,
    Email,
    Url,
    Emote,
    Uncertain,
}

/// One preserved token.
#[derive(Debug, Clone)]
pub struct PreservedToken {
    pub token_type: TokenType,
    pub original: String,
    pub placeholder: String,
    pub start: usize,
    pub end: usize,
}

/// Result of the preservation pass.
#[derive(Debug, Clone)]
pub struct PreservedText {
    pub processed: String,
    pub tokens: Vec<PreservedToken>,
    pub original: String,
}

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s]+").expect("static regex"));
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static regex")
});
static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@\w+").expect("static regex"));
static COMMAND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[!#][A-Za-z0-9_]+").expect("static regex"));

/// Replace every preservable token with a placeholder.
///
/// Scanning priority (URL > email > mention > command > emote) prevents the
/// mention pattern from eating the domain half of an email, and emote lookup
/// runs on whitespace-delimited words against the catalog set.
pub fn preserve(text: &str, emotes: &HashSet<String>) -> PreservedText {
    let mut spans: Vec<(usize, usize, TokenType)> = Vec::new();

    for (regex, token_type) in [
        (&*URL_RE, TokenType::Url),
        (&*EMAIL_RE, TokenType::Email),
        (&*MENTION_RE, TokenType::Mention),
        (&*COMMAND_RE, TokenType::Command),
    ] {
        for m in regex.find_iter(text) {
            if !overlaps(&spans, m.start(), m.end()) {
                spans.push((m.start(), m.end(), token_type));
            }
        }
    }

    if !emotes.is_empty() {
        let mut offset = 0;
        for word in text.split_whitespace() {
            let start = text[offset..].find(word).map(|i| i + offset).unwrap_or(offset);
            let end = start + word.len();
            offset = end;
            if emotes.contains(word) && !overlaps(&spans, start, end) {
                spans.push((start, end, TokenType::Emote));
            }
        }
    }

    spans.sort_by_key(|(start, _, _)| *start);

    let mut processed = String::with_capacity(text.len());
    let mut tokens = Vec::with_capacity(spans.len());
    let mut cursor = 0;
    for (index, (start, end, token_type)) in spans.into_iter().enumerate() {
        processed.push_str(&text[cursor..start]);
        let placeholder = placeholder_for(index);
        processed.push_str(&placeholder);
        tokens.push(PreservedToken {
            token_type,
            original: text[start..end].to_string(),
            placeholder,
            start,
            end,
        });
        cursor = end;
    }
    processed.push_str(&text[cursor..]);

    PreservedText {
        processed,
        tokens,
        original: text.to_string(),
    }
}

/// Put the original tokens back. Placeholders are unique per request, so a
/// straight replace suffices and emote codes survive byte-for-byte.
pub fn restore(translated: &str, tokens: &[PreservedToken]) -> String {
    let mut restored = translated.to_string();
    for token in tokens {
        restored = restored.replace(&token.placeholder, &token.original);
    }
    restored
}

/// Fixed non-linguistic placeholder shape: mathematical white brackets
/// around the token index. No detector treats them as language material.
fn placeholder_for(index: usize) -> String {
    format!("\u{27E6}{index}\u{27E7}")
}

fn overlaps(spans: &[(usize, usize, TokenType)], start: usize, end: usize) -> bool {
    spans.iter().any(|(s, e, _)| start < *e && *s < end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_emotes() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn mentions_commands_urls_emails_are_preserved() {
        let text = "@alice try !help or mail bob@example.com, docs at https://example.com/x";
        let preserved = preserve(text, &no_emotes());

        let types: Vec<TokenType> = preserved.tokens.iter().map(|t| t.token_type).collect();
        assert!(types.contains(&TokenType::Mention));
        assert!(types.contains(&TokenType::Command));
        assert!(types.contains(&TokenType::Email));
        assert!(types.contains(&TokenType::Url));

        assert!(!preserved.processed.contains("@alice"));
        assert!(!preserved.processed.contains("!help"));
        assert!(!preserved.processed.contains("bob@example.com"));
        assert!(!preserved.processed.contains("https://"));
    }

    #[test]
    fn email_wins_over_mention() {
        let preserved = preserve("contact bob@example.com now", &no_emotes());
        assert_eq!(preserved.tokens.len(), 1);
        assert_eq!(preserved.tokens[0].token_type, TokenType::Email);
        assert_eq!(preserved.tokens[0].original, "bob@example.com");
    }

    #[test]
    fn round_trip_restores_exactly() {
        let mut emotes = HashSet::new();
        emotes.insert("Kappa".to_string());
        emotes.insert("PogChamp".to_string());

        let text = "@bob Kappa check https://a.io !go PogChamp";
        let preserved = preserve(text, &emotes);
        let restored = restore(&preserved.processed, &preserved.tokens);
        assert_eq!(restored, text);
    }

    #[test]
    fn restoration_survives_translation_reordering() {
        let mut emotes = HashSet::new();
        emotes.insert("Kappa".to_string());

        let preserved = preserve("hola Kappa amigo @juan", &emotes);
        // A translator may move placeholders around; restoration only cares
        // that each placeholder maps back to its original bytes.
        let translated = format!(
            "{} friend {} hello",
            preserved.tokens[1].placeholder, preserved.tokens[0].placeholder
        );
        let restored = restore(&translated, &preserved.tokens);
        assert_eq!(restored, "@juan friend Kappa hello");
    }

    #[test]
    fn emote_codes_match_byte_for_byte() {
        let mut emotes = HashSet::new();
        emotes.insert("LUL".to_string());

        let preserved = preserve("that was LUL funny", &emotes);
        let restored = restore(&preserved.processed, &preserved.tokens);
        assert!(restored.contains("LUL"));
        assert_eq!(restored.as_bytes(), b"that was LUL funny");
    }

    #[test]
    fn repeated_words_preserve_each_occurrence() {
        let mut emotes = HashSet::new();
        emotes.insert("Kappa".to_string());

        let text = "Kappa Kappa Kappa";
        let preserved = preserve(text, &emotes);
        assert_eq!(preserved.tokens.len(), 3);
        assert_eq!(restore(&preserved.processed, &preserved.tokens), text);
    }

    #[test]
    fn plain_text_is_untouched() {
        let preserved = preserve("just a normal sentence", &no_emotes());
        assert!(preserved.tokens.is_empty());
        assert_eq!(preserved.processed, "just a normal sentence");
    }
}
