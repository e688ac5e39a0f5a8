//! Tiered language-detection ensemble.
//!
//! Three detectors vote: lingua (accuracy), whichlang (a fast compiled
//! classifier), and whatlang (trigram statistics): and the weighted result
//! lands in one of three confidence tiers: accept, verify with AI, reject.

use std::collections::HashMap;
use std::sync::LazyLock;

/// A detected language with combined ensemble confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// ISO 639-1 code.
    pub language: String,
    pub confidence: f64,
}

/// Tier classification of a detection.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionOutcome {
    /// High tier: accept directly.
    Accepted(Detection),
    /// Medium tier: verify with the AI provider.
    NeedsVerification(Detection),
    /// Low tier or undetectable: do not translate. This is an outcome, not
    /// an error.
    Rejected { reason: String },
}

const LINGUA_WEIGHT: f64 = 0.45;
const WHATLANG_WEIGHT: f64 = 0.35;
const WHICHLANG_WEIGHT: f64 = 0.20;

/// whichlang emits a label with no score; weight it as a confident but
/// uncalibrated vote.
const WHICHLANG_ASSUMED_CONFIDENCE: f64 = 0.80;

static LINGUA: LazyLock<lingua::LanguageDetector> = LazyLock::new(|| {
    lingua::LanguageDetectorBuilder::from_all_languages()
        .with_preloaded_language_models()
        .build()
});

pub struct EnsembleDetector {
    accept_threshold: f64,
    reject_threshold: f64,
}

impl EnsembleDetector {
    pub fn new(accept_threshold: f64, reject_threshold: f64) -> Self {
        Self {
            accept_threshold,
            reject_threshold,
        }
    }

    /// Run the ensemble and combine votes. `None` when no detector produced
    /// a usable answer.
    pub fn detect(&self, text: &str) -> Option<Detection> {
        let mut votes: HashMap<String, f64> = HashMap::new();
        let mut weight_total = 0.0;

        if let Some((language, confidence)) = lingua_vote(text) {
            *votes.entry(language).or_default() += confidence * LINGUA_WEIGHT;
            weight_total += LINGUA_WEIGHT;
        }
        if let Some((language, confidence)) = whatlang_vote(text) {
            *votes.entry(language).or_default() += confidence * WHATLANG_WEIGHT;
            weight_total += WHATLANG_WEIGHT;
        }
        if let Some(language) = whichlang_vote(text) {
            *votes.entry(language).or_default() +=
                WHICHLANG_ASSUMED_CONFIDENCE * WHICHLANG_WEIGHT;
            weight_total += WHICHLANG_WEIGHT;
        }

        if weight_total == 0.0 {
            return None;
        }

        let (language, score) = votes
            .into_iter()
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        Some(Detection {
            language,
            confidence: (score / weight_total).clamp(0.0, 1.0),
        })
    }

    /// Detect and classify into a tier.
    pub fn classify(&self, text: &str) -> DetectionOutcome {
        let trimmed = text.trim();
        if trimmed.chars().filter(|c| c.is_alphabetic()).count() < 3 {
            return DetectionOutcome::Rejected {
                reason: "text too short".into(),
            };
        }

        let Some(detection) = self.detect(trimmed) else {
            return DetectionOutcome::Rejected {
                reason: "no detector produced a result".into(),
            };
        };

        if detection.confidence >= self.accept_threshold {
            DetectionOutcome::Accepted(detection)
        } else if detection.confidence >= self.reject_threshold {
            DetectionOutcome::NeedsVerification(detection)
        } else {
            DetectionOutcome::Rejected {
                reason: format!(
                    "confidence {:.2} below threshold {:.2}",
                    detection.confidence, self.reject_threshold
                ),
            }
        }
    }
}

fn lingua_vote(text: &str) -> Option<(String, f64)> {
    let values = LINGUA.compute_language_confidence_values(text);
    let (language, confidence) = values.first()?;
    Some((
        language.iso_code_639_1().to_string().to_lowercase(),
        *confidence,
    ))
}

fn whatlang_vote(text: &str) -> Option<(String, f64)> {
    let info = whatlang::detect(text)?;
    let iso = iso639_1_from_whatlang(info.lang())?;
    Some((iso.to_string(), info.confidence()))
}

fn whichlang_vote(text: &str) -> Option<String> {
    let lang = whichlang::detect_language(text);
    iso639_1_from_three_letter(lang.three_letter_code()).map(str::to_string)
}

/// whatlang speaks ISO 639-3.
fn iso639_1_from_whatlang(lang: whatlang::Lang) -> Option<&'static str> {
    iso639_1_from_three_letter(lang.code())
}

fn iso639_1_from_three_letter(code: &str) -> Option<&'static str> {
    Some(match code {
        "ara" => "ar",
        "cmn" | "zho" => "zh",
        "deu" => "de",
        "eng" => "en",
        "fra" => "fr",
        "hin" => "hi",
        "ind" => "id",
        "ita" => "it",
        "jpn" => "ja",
        "kor" => "ko",
        "nld" => "nl",
        "pol" => "pl",
        "por" => "pt",
        "rus" => "ru",
        "spa" => "es",
        "swe" => "sv",
        "tur" => "tr",
        "vie" => "vi",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> EnsembleDetector {
        EnsembleDetector::new(0.90, 0.70)
    }

    #[test]
    fn long_english_is_accepted() {
        let outcome = detector().classify(
            "Hello, how are you doing today? This is a longer English sentence.",
        );
        match outcome {
            DetectionOutcome::Accepted(detection)
            | DetectionOutcome::NeedsVerification(detection) => {
                assert_eq!(detection.language, "en");
            }
            DetectionOutcome::Rejected { reason } => {
                panic!("long English should detect, got rejection: {reason}")
            }
        }
    }

    #[test]
    fn long_french_detects_as_french() {
        let outcome = detector()
            .classify("Bonjour! J'adore ton stream, c'est vraiment magnifique et super!");
        match outcome {
            DetectionOutcome::Accepted(detection)
            | DetectionOutcome::NeedsVerification(detection) => {
                assert_eq!(detection.language, "fr");
            }
            DetectionOutcome::Rejected { reason } => {
                panic!("long French should detect, got rejection: {reason}")
            }
        }
    }

    #[test]
    fn tiny_text_is_rejected_as_outcome() {
        assert!(matches!(
            detector().classify("ok"),
            DetectionOutcome::Rejected { .. }
        ));
        assert!(matches!(
            detector().classify("!! ?? 123"),
            DetectionOutcome::Rejected { .. }
        ));
    }

    #[test]
    fn three_letter_mapping_covers_the_ensemble_languages() {
        assert_eq!(iso639_1_from_three_letter("eng"), Some("en"));
        assert_eq!(iso639_1_from_three_letter("cmn"), Some("zh"));
        assert_eq!(iso639_1_from_three_letter("xyz"), None);
    }

    #[test]
    fn confidence_is_normalized() {
        let detection = detector()
            .detect("The quick brown fox jumps over the lazy dog near the river bank.")
            .expect("detectable");
        assert!(detection.confidence > 0.0);
        assert!(detection.confidence <= 1.0);
    }
}
