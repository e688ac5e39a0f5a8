//! Score bounds and tier derivation. Pure functions, no storage.

/// Reputation band derived from a 300-850 score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Exceptional,
    VeryGood,
    Good,
    Fair,
    Poor,
}

impl Tier {
    pub fn label(&self) -> &'static str {
        match self {
            Tier::Exceptional => "exceptional",
            Tier::VeryGood => "very_good",
            Tier::Good => "good",
            Tier::Fair => "fair",
            Tier::Poor => "poor",
        }
    }

    /// Derive the tier for a score.
    pub fn for_score(score: f64) -> Tier {
        if score >= 800.0 {
            Tier::Exceptional
        } else if score >= 740.0 {
            Tier::VeryGood
        } else if score >= 670.0 {
            Tier::Good
        } else if score >= 580.0 {
            Tier::Fair
        } else {
            Tier::Poor
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Clamp a score into `[min, max]` and round to storage precision
/// (2 decimal places).
pub fn clamp_score(score: f64, min: f64, max: f64) -> f64 {
    let clamped = score.clamp(min, max);
    (clamped * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_boundaries() {
        assert_eq!(Tier::for_score(850.0), Tier::Exceptional);
        assert_eq!(Tier::for_score(800.0), Tier::Exceptional);
        assert_eq!(Tier::for_score(799.99), Tier::VeryGood);
        assert_eq!(Tier::for_score(740.0), Tier::VeryGood);
        assert_eq!(Tier::for_score(739.0), Tier::Good);
        assert_eq!(Tier::for_score(670.0), Tier::Good);
        assert_eq!(Tier::for_score(669.5), Tier::Fair);
        assert_eq!(Tier::for_score(580.0), Tier::Fair);
        assert_eq!(Tier::for_score(579.99), Tier::Poor);
        assert_eq!(Tier::for_score(300.0), Tier::Poor);
    }

    #[test]
    fn clamping_respects_bounds() {
        assert_eq!(clamp_score(900.0, 300.0, 850.0), 850.0);
        assert_eq!(clamp_score(100.0, 300.0, 850.0), 300.0);
        assert_eq!(clamp_score(600.015, 300.0, 850.0), 600.02);
    }

    #[test]
    fn rounding_kills_float_drift() {
        let mut score = 600.0;
        for _ in 0..3 {
            score = clamp_score(score + 0.01, 300.0, 850.0);
        }
        assert_eq!(score, 600.03);
    }
}
