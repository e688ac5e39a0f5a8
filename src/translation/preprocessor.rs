//! End-to-end message preprocessing:
//! preserve -> detect -> (verify) -> translate -> restore.

use crate::Platform;
use crate::config::TranslationConfig;
use crate::error::{Result, TranslateError};
use crate::translation::detect::{Detection, DetectionOutcome, EnsembleDetector};
use crate::translation::emotes::EmoteCatalog;
use crate::translation::tokens;
use crate::translation::verify::{AiVerifier, reconcile};

/// What happened to one message.
#[derive(Debug, Clone, PartialEq)]
pub enum PreprocessOutcome {
    /// Detected as a foreign language and translated, tokens restored.
    Translated {
        text: String,
        source_language: String,
        confidence: f64,
    },
    /// Already in the target language (or translation is not configured).
    NotNeeded { language: String, confidence: f64 },
    /// Detection rejected the message (too short, low confidence).
    Skipped { reason: String },
}

pub struct TranslationPreprocessor {
    config: TranslationConfig,
    detector: EnsembleDetector,
    verifier: Option<AiVerifier>,
    emotes: EmoteCatalog,
    http: reqwest::Client,
}

impl TranslationPreprocessor {
    pub fn new(config: TranslationConfig) -> Self {
        let detector = EnsembleDetector::new(config.accept_threshold, config.reject_threshold);
        let verifier = AiVerifier::new(&config);
        let emotes = EmoteCatalog::new(&config);
        Self {
            config,
            detector,
            verifier,
            emotes,
            http: reqwest::Client::new(),
        }
    }

    /// Process one chat message from `(platform, channel)`.
    pub async fn process(
        &self,
        text: &str,
        platform: Platform,
        channel_id: &str,
    ) -> Result<PreprocessOutcome> {
        let emotes = self.emotes.for_channel(platform, channel_id).await;
        let preserved = tokens::preserve(text, &emotes);

        let detection = match self.detector.classify(&preserved.processed) {
            DetectionOutcome::Accepted(detection) => detection,
            DetectionOutcome::NeedsVerification(detection) => {
                self.verify(&preserved.processed, detection).await
            }
            DetectionOutcome::Rejected { reason } => {
                return Ok(PreprocessOutcome::Skipped { reason });
            }
        };

        // Verification can drop a medium-tier detection below the floor.
        if detection.confidence < self.config.reject_threshold {
            return Ok(PreprocessOutcome::Skipped {
                reason: format!(
                    "confidence {:.2} below threshold after verification",
                    detection.confidence
                ),
            });
        }

        if detection.language == self.config.target_language {
            return Ok(PreprocessOutcome::NotNeeded {
                language: detection.language,
                confidence: detection.confidence,
            });
        }

        let Some(provider_url) = &self.config.provider_url else {
            return Ok(PreprocessOutcome::NotNeeded {
                language: detection.language,
                confidence: detection.confidence,
            });
        };

        let translated = self
            .translate(provider_url, &preserved.processed, &detection.language)
            .await?;
        let restored = tokens::restore(&translated, &preserved.tokens);

        Ok(PreprocessOutcome::Translated {
            text: restored,
            source_language: detection.language,
            confidence: detection.confidence,
        })
    }

    async fn verify(&self, text: &str, ensemble: Detection) -> Detection {
        let Some(verifier) = &self.verifier else {
            return ensemble;
        };
        let budget = verifier.budget();
        let verdict = verifier.verify(text, &ensemble, &budget).await;
        reconcile(ensemble, verdict)
    }

    /// LibreTranslate-compatible call on the placeholder-substituted text.
    async fn translate(&self, provider_url: &str, text: &str, source: &str) -> Result<String> {
        let body = serde_json::json!({
            "q": text,
            "source": source,
            "target": self.config.target_language,
            "format": "text",
        });

        let response = self
            .http
            .post(provider_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TranslateError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TranslateError::Provider(format!(
                "status {}",
                response.status()
            ))
            .into());
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TranslateError::Provider(e.to_string()))?;

        payload
            .get("translatedText")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| TranslateError::Provider("missing translatedText".into()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preprocessor() -> TranslationPreprocessor {
        TranslationPreprocessor::new(TranslationConfig {
            enabled: true,
            // Catalog fetches fail instantly offline; the pass degrades to
            // builtin emotes only.
            emote_fetch_timeout_ms: 1,
            ..TranslationConfig::default()
        })
    }

    #[tokio::test]
    async fn english_messages_need_no_translation() {
        let outcome = preprocessor()
            .process(
                "Hello everyone, how is the stream going today?",
                Platform::Twitch,
                "123",
            )
            .await
            .unwrap();
        match outcome {
            PreprocessOutcome::NotNeeded { language, .. } => assert_eq!(language, "en"),
            other => panic!("expected NotNeeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_messages_are_skipped_not_errored() {
        let outcome = preprocessor()
            .process("ok", Platform::Twitch, "123")
            .await
            .unwrap();
        assert!(matches!(outcome, PreprocessOutcome::Skipped { .. }));
    }
}
