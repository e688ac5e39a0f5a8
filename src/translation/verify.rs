//! AI verification of medium-confidence detections.
//!
//! Calls are capped per message and per-call deadline bound: unbounded
//! verification dominates end-to-end latency, so the cap is part of the
//! contract, not tuning.

use crate::config::TranslationConfig;
use crate::translation::detect::Detection;

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// The provider's opinion on a detection.
#[derive(Debug, Clone)]
pub struct AiVerdict {
    pub language: String,
    pub confidence: f64,
    pub agrees: bool,
}

pub struct AiVerifier {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    max_calls_per_message: u32,
}

impl AiVerifier {
    pub fn new(config: &TranslationConfig) -> Option<Self> {
        let endpoint = config.ai_endpoint.clone()?;
        Some(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_millis(config.ai_timeout_ms))
                .build()
                .expect("reqwest client with static config"),
            endpoint,
            model: config.ai_model.clone(),
            max_calls_per_message: config.ai_max_calls_per_message,
        })
    }

    /// A per-message budget of verification calls.
    pub fn budget(&self) -> CallBudget {
        CallBudget {
            remaining: AtomicU32::new(self.max_calls_per_message),
        }
    }

    /// Ask the provider to identify the language; `None` when the budget is
    /// spent, the call times out, or the reply is unusable.
    pub async fn verify(
        &self,
        text: &str,
        ensemble: &Detection,
        budget: &CallBudget,
    ) -> Option<AiVerdict> {
        if !budget.try_take() {
            tracing::debug!("ai verification budget exhausted for this message");
            return None;
        }

        let prompt = format!(
            "Identify the language of the following text. Reply with only the \
             ISO 639-1 two-letter code.\n\nText: {text}"
        );
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let response = match self.http.post(&self.endpoint).json(&body).send().await {
            Ok(response) => response,
            Err(error) => {
                tracing::debug!(%error, "ai verification call failed");
                return None;
            }
        };
        let payload: serde_json::Value = response.json().await.ok()?;
        let raw = payload
            .get("response")
            .and_then(|v| v.as_str())?
            .trim()
            .to_lowercase();

        let language: String = raw.chars().filter(|c| c.is_ascii_alphabetic()).take(2).collect();
        if language.len() != 2 {
            tracing::debug!(reply = %raw, "ai verification reply unusable");
            return None;
        }

        let agrees = language == ensemble.language;
        Some(AiVerdict {
            language,
            confidence: 0.95,
            agrees,
        })
    }
}

/// Per-message call budget.
pub struct CallBudget {
    remaining: AtomicU32,
}

impl CallBudget {
    fn try_take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }
}

/// Combine the ensemble detection with the AI verdict:
/// agreement boosts to 0.95; a more confident disagreement wins; anything
/// else keeps the ensemble's answer discounted by 10%.
pub fn reconcile(ensemble: Detection, verdict: Option<AiVerdict>) -> Detection {
    match verdict {
        Some(verdict) if verdict.agrees => Detection {
            language: ensemble.language,
            confidence: 0.95,
        },
        Some(verdict) if verdict.confidence > ensemble.confidence => Detection {
            language: verdict.language,
            confidence: verdict.confidence,
        },
        Some(_) => Detection {
            language: ensemble.language,
            confidence: ensemble.confidence * 0.9,
        },
        // Verification unavailable: the ensemble answer stands.
        None => ensemble,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(language: &str, confidence: f64) -> Detection {
        Detection {
            language: language.into(),
            confidence,
        }
    }

    #[test]
    fn agreement_boosts_confidence() {
        let result = reconcile(
            detection("nl", 0.80),
            Some(AiVerdict {
                language: "nl".into(),
                confidence: 0.95,
                agrees: true,
            }),
        );
        assert_eq!(result.language, "nl");
        assert_eq!(result.confidence, 0.95);
    }

    #[test]
    fn confident_disagreement_wins() {
        let result = reconcile(
            detection("nl", 0.75),
            Some(AiVerdict {
                language: "de".into(),
                confidence: 0.95,
                agrees: false,
            }),
        );
        assert_eq!(result.language, "de");
        assert_eq!(result.confidence, 0.95);
    }

    #[test]
    fn weak_disagreement_keeps_ensemble_discounted() {
        let result = reconcile(
            detection("it", 0.88),
            Some(AiVerdict {
                language: "es".into(),
                confidence: 0.5,
                agrees: false,
            }),
        );
        assert_eq!(result.language, "it");
        assert!((result.confidence - 0.792).abs() < 1e-9);
    }

    #[test]
    fn missing_verdict_keeps_ensemble_untouched() {
        let result = reconcile(detection("pt", 0.80), None);
        assert_eq!(result.language, "pt");
        assert_eq!(result.confidence, 0.80);
    }

    #[test]
    fn budget_caps_calls() {
        let budget = CallBudget {
            remaining: AtomicU32::new(3),
        };
        assert!(budget.try_take());
        assert!(budget.try_take());
        assert!(budget.try_take());
        assert!(!budget.try_take());
        assert_eq!(budget.remaining(), 0);
    }
}
