//! Reputation tiers and their rate-limit multipliers.

use serde::{Deserialize, Serialize};

/// Lowest possible reputation score.
pub const MIN_SCORE: f64 = 0.0;
/// Highest possible reputation score.
pub const MAX_SCORE: f64 = 100.0;
/// Neutral score every new user starts at and decay pulls toward.
pub const NEUTRAL_SCORE: f64 = 50.0;

/// Clamp a score into `[MIN_SCORE, MAX_SCORE]`.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return NEUTRAL_SCORE;
    }
    score.clamp(MIN_SCORE, MAX_SCORE)
}

/// A reputation-score band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Repeated offenders.
    Restricted,
    /// Users with some recent violations.
    Caution,
    /// Default band.
    Neutral,
    /// Consistently well behaved.
    Good,
    /// Top band.
    Excellent,
}

impl Tier {
    /// All tiers from lowest to highest.
    pub const ALL: [Tier; 5] = [
        Tier::Restricted,
        Tier::Caution,
        Tier::Neutral,
        Tier::Good,
        Tier::Excellent,
    ];

    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Restricted => "restricted",
            Tier::Caution => "caution",
            Tier::Neutral => "neutral",
            Tier::Good => "good",
            Tier::Excellent => "excellent",
        }
    }

    /// The next tier up, if any.
    pub fn next(&self) -> Option<Tier> {
        match self {
            Tier::Restricted => Some(Tier::Caution),
            Tier::Caution => Some(Tier::Neutral),
            Tier::Neutral => Some(Tier::Good),
            Tier::Good => Some(Tier::Excellent),
            Tier::Excellent => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score thresholds and multipliers that define the tiers.
///
/// Each threshold is the inclusive lower bound of its tier; anything below
/// `caution_min` is `Restricted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierPolicy {
    /// Lower bound of the caution tier.
    pub caution_min: f64,
    /// Lower bound of the neutral tier.
    pub neutral_min: f64,
    /// Lower bound of the good tier.
    pub good_min: f64,
    /// Lower bound of the excellent tier.
    pub excellent_min: f64,
    /// Multiplier for restricted users.
    pub restricted_multiplier: f64,
    /// Multiplier for caution users.
    pub caution_multiplier: f64,
    /// Multiplier for neutral users.
    pub neutral_multiplier: f64,
    /// Multiplier for good users.
    pub good_multiplier: f64,
    /// Multiplier for excellent users.
    pub excellent_multiplier: f64,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            caution_min: 25.0,
            neutral_min: 50.0,
            good_min: 75.0,
            excellent_min: 90.0,
            restricted_multiplier: 0.5,
            caution_multiplier: 0.8,
            neutral_multiplier: 1.0,
            good_multiplier: 1.5,
            excellent_multiplier: 2.0,
        }
    }
}

impl TierPolicy {
    /// Map a score to its tier. Pure in `score` and the thresholds.
    pub fn tier_for(&self, score: f64) -> Tier {
        let score = clamp_score(score);
        if score >= self.excellent_min {
            Tier::Excellent
        } else if score >= self.good_min {
            Tier::Good
        } else if score >= self.neutral_min {
            Tier::Neutral
        } else if score >= self.caution_min {
            Tier::Caution
        } else {
            Tier::Restricted
        }
    }

    /// Rate-limit multiplier of a tier.
    pub fn multiplier(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Restricted => self.restricted_multiplier,
            Tier::Caution => self.caution_multiplier,
            Tier::Neutral => self.neutral_multiplier,
            Tier::Good => self.good_multiplier,
            Tier::Excellent => self.excellent_multiplier,
        }
    }

    /// Multiplier for a raw score.
    pub fn multiplier_for(&self, score: f64) -> f64 {
        self.multiplier(self.tier_for(score))
    }

    /// Lower bound score of a tier.
    pub fn lower_bound(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Restricted => MIN_SCORE,
            Tier::Caution => self.caution_min,
            Tier::Neutral => self.neutral_min,
            Tier::Good => self.good_min,
            Tier::Excellent => self.excellent_min,
        }
    }

    /// Thresholds must be strictly increasing and inside the score range.
    pub fn validate(&self) -> Result<(), String> {
        let bounds = [
            MIN_SCORE,
            self.caution_min,
            self.neutral_min,
            self.good_min,
            self.excellent_min,
        ];
        if bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err("tier thresholds must be strictly increasing".to_string());
        }
        if self.excellent_min > MAX_SCORE {
            return Err("excellent threshold exceeds maximum score".to_string());
        }
        if Tier::ALL.iter().any(|t| self.multiplier(*t) <= 0.0) {
            return Err("tier multipliers must be positive".to_string());
        }
        Ok(())
    }
}
