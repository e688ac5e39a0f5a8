//! Webhook verification primitives shared by the receiver HTTP surface.
//!
//! Signatures are HMAC-SHA256 over the raw body bytes (with the platform's
//! prescribed base-string variations), compared in constant time. Invalid
//! deliveries are rejected with 401 and produce no side-effects.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq as _;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `message` with `secret`.
pub fn sign(secret: &str, message: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Generic platform signature check: raw body, hex digest, optional
/// `sha256=` prefix.
pub fn verify_signature(secret: &str, body: &[u8], presented: &str) -> bool {
    let presented = presented.strip_prefix("sha256=").unwrap_or(presented);
    let expected = sign(secret, body);
    constant_time_eq(expected.as_bytes(), presented.as_bytes())
}

/// Twitch EventSub: HMAC over `message_id + timestamp + body`, header value
/// carries the `sha256=` prefix.
pub fn verify_twitch_signature(
    secret: &str,
    message_id: &str,
    timestamp: &str,
    body: &[u8],
    presented: &str,
) -> bool {
    let mut message = Vec::with_capacity(message_id.len() + timestamp.len() + body.len());
    message.extend_from_slice(message_id.as_bytes());
    message.extend_from_slice(timestamp.as_bytes());
    message.extend_from_slice(body);
    verify_signature(secret, &message, presented)
}

/// Slack request signing: base string `v0:<timestamp>:<body>`, signature
/// `v0=<hex>`, with a replay window on the timestamp.
pub fn verify_slack_signature(
    secret: &str,
    timestamp: &str,
    body: &[u8],
    presented: &str,
    now_epoch: i64,
) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    if (now_epoch - ts).abs() > 300 {
        return false;
    }

    let mut base = format!("v0:{timestamp}:").into_bytes();
    base.extend_from_slice(body);
    let expected = format!("v0={}", sign(secret, &base));
    constant_time_eq(expected.as_bytes(), presented.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// WebSub (PubSubHubbub) subscription verification: echo the challenge only
/// for a valid mode and a verifiable YouTube topic URL.
pub fn websub_challenge<'a>(
    mode: &str,
    topic: &str,
    challenge: &'a str,
) -> Option<&'a str> {
    if !matches!(mode, "subscribe" | "unsubscribe") {
        return None;
    }
    if !topic.contains("youtube.com/xml/feeds/videos.xml") {
        return None;
    }
    websub_channel_id(topic)?;
    Some(challenge)
}

/// Extract the channel id from a WebSub topic URL.
pub fn websub_channel_id(topic: &str) -> Option<&str> {
    let (_, query) = topic.split_once('?')?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("channel_id="))
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_signature_round_trips() {
        let body = br#"{"event":"follow"}"#;
        let signature = sign("shh", body);
        assert!(verify_signature("shh", body, &signature));
        assert!(verify_signature("shh", body, &format!("sha256={signature}")));
        assert!(!verify_signature("shh", body, "deadbeef"));
        assert!(!verify_signature("wrong", body, &signature));
    }

    #[test]
    fn tampered_body_fails() {
        let signature = sign("shh", b"original");
        assert!(!verify_signature("shh", b"tampered", &signature));
    }

    #[test]
    fn twitch_signature_binds_id_and_timestamp() {
        let body = br#"{"subscription":{}}"#;
        let good = format!(
            "sha256={}",
            sign("secret", b"msg-1_2023-01-01T00:00:00Z_".as_slice())
        );
        // Signature computed over different message parts must not verify.
        assert!(!verify_twitch_signature(
            "secret",
            "msg-2",
            "2023-01-01T00:00:00Z",
            body,
            &good
        ));

        let mut message = b"msg-1".to_vec();
        message.extend_from_slice(b"2023-01-01T00:00:00Z");
        message.extend_from_slice(body);
        let signature = format!("sha256={}", sign("secret", &message));
        assert!(verify_twitch_signature(
            "secret",
            "msg-1",
            "2023-01-01T00:00:00Z",
            body,
            &signature
        ));
    }

    #[test]
    fn slack_signature_rejects_stale_timestamps() {
        let body = b"payload=1";
        let now = 1_700_000_000;
        let ts = now.to_string();

        let mut base = format!("v0:{ts}:").into_bytes();
        base.extend_from_slice(body);
        let signature = format!("v0={}", sign("slack-secret", &base));

        assert!(verify_slack_signature(
            "slack-secret",
            &ts,
            body,
            &signature,
            now
        ));
        assert!(!verify_slack_signature(
            "slack-secret",
            &ts,
            body,
            &signature,
            now + 3_600
        ));
        assert!(!verify_slack_signature(
            "slack-secret",
            "not-a-number",
            body,
            &signature,
            now
        ));
    }

    #[test]
    fn websub_echo_requires_valid_topic() {
        let topic = "https://www.youtube.com/xml/feeds/videos.xml?channel_id=UC123";
        assert_eq!(websub_challenge("subscribe", topic, "abc"), Some("abc"));
        assert_eq!(websub_challenge("unsubscribe", topic, "abc"), Some("abc"));
        assert_eq!(websub_challenge("publish", topic, "abc"), None);
        assert_eq!(
            websub_challenge("subscribe", "https://example.com/feed", "abc"),
            None
        );
        assert_eq!(websub_channel_id(topic), Some("UC123"));
    }
}
