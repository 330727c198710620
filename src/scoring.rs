// =============================================================================
// Composite Scoring & Ranking — regime-weighted factor aggregation
// =============================================================================
//
// composite = Σ (factor contribution × weight[regime][factor]), mapped into
// [0, 100] through a logistic transform (monotone, bounded, steepness from
// config). Ties break on higher momentum_core, then lexicographic symbol.
// Top-N selection is stable and does NOT imply entry — the gate cascade
// decides that.

use serde::{Deserialize, Serialize};

use crate::config::WeightVector;
use crate::factors::{CrossSection, FACTOR_MOMENTUM, FACTOR_QUALITY, FACTOR_SOCIAL, FACTOR_TECHNICAL, FACTOR_VOLUME};

/// One factor's post-orthogonalization contribution to the composite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentContribution {
    pub factor: String,
    pub value: f64,
    pub weight: f64,
    pub weighted: f64,
}

/// The scored output for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeScore {
    pub symbol: String,
    /// Mapped into [0, 100].
    pub score: f64,
    pub components: Vec<ComponentContribution>,
    pub regime: String,
    /// Snapshot of the weight vector used, for audit.
    pub weights: WeightVector,
    pub selected: bool,
    /// Tie-break key (protected factor, pre-transform).
    pub momentum_core: f64,
}

/// Map a raw weighted sum into [0, 100]. Logistic in `raw / 10` so typical
/// factor magnitudes (±10) land on the curve's responsive band.
fn logistic_score(raw: f64, steepness: f64) -> f64 {
    100.0 / (1.0 + (-steepness * raw / 10.0).exp())
}

/// Score every set in the cross-section under the given regime weights.
pub fn score_cross_section(
    xs: &CrossSection,
    weights: &WeightVector,
    regime: &str,
    steepness: f64,
) -> Vec<CompositeScore> {
    const FACTORS: [&str; 5] = [
        FACTOR_MOMENTUM,
        FACTOR_TECHNICAL,
        FACTOR_VOLUME,
        FACTOR_QUALITY,
        FACTOR_SOCIAL,
    ];

    xs.sets()
        .iter()
        .map(|set| {
            let mut raw = 0.0;
            let components = FACTORS
                .iter()
                .map(|factor| {
                    let value = set.get(factor);
                    let weight = weights.get(factor);
                    let weighted = value * weight;
                    raw += weighted;
                    ComponentContribution {
                        factor: factor.to_string(),
                        value,
                        weight,
                        weighted,
                    }
                })
                .collect();

            CompositeScore {
                symbol: set.symbol.clone(),
                score: logistic_score(raw, steepness),
                components,
                regime: regime.to_string(),
                weights: *weights,
                selected: false,
                momentum_core: set.momentum_core,
            }
        })
        .collect()
}

/// Rank by score descending (ties: momentum_core desc, then symbol asc) and
/// mark the first `top_n` as selected. The sort is stable so equal keys keep
/// their input order.
pub fn rank_and_select(scores: &mut [CompositeScore], top_n: usize) {
    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.momentum_core
                    .partial_cmp(&a.momentum_core)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    for (i, score) in scores.iter_mut().enumerate() {
        score.selected = i < top_n;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{FactorMetadata, FactorSet};
    use chrono::Utc;

    fn weights() -> WeightVector {
        WeightVector {
            momentum_core: 0.45,
            technical_residual: 0.22,
            volume_residual: 0.18,
            quality_residual: 0.10,
            social_residual: 0.05,
        }
    }

    fn set(symbol: &str, momentum: f64) -> FactorSet {
        FactorSet {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            momentum_core: momentum,
            technical: 0.0,
            volume: 0.0,
            quality: 0.0,
            social: 0.0,
            metadata: FactorMetadata::default(),
        }
    }

    fn xs(sets: Vec<FactorSet>) -> CrossSection {
        let mut xs = CrossSection::new();
        for s in sets {
            xs.push(s).unwrap();
        }
        xs
    }

    #[test]
    fn score_is_bounded_and_monotone() {
        let xs = xs(vec![
            set("A1USD", -50.0),
            set("B2USD", 0.0),
            set("C3USD", 50.0),
        ]);
        let scores = score_cross_section(&xs, &weights(), "normal", 1.2);

        for s in &scores {
            assert!((0.0..=100.0).contains(&s.score));
        }
        assert!(scores[0].score < scores[1].score);
        assert!(scores[1].score < scores[2].score);
        // Zero raw input maps to the midpoint.
        assert!((scores[1].score - 50.0).abs() < 1e-9);
    }

    #[test]
    fn components_record_contributions() {
        let xs = xs(vec![set("BTCUSD", 10.0)]);
        let scores = score_cross_section(&xs, &weights(), "normal", 1.2);

        let momentum = scores[0]
            .components
            .iter()
            .find(|c| c.factor == FACTOR_MOMENTUM)
            .unwrap();
        assert!((momentum.weighted - 4.5).abs() < 1e-9);
        assert_eq!(scores[0].regime, "normal");
    }

    #[test]
    fn ranking_orders_by_score_then_momentum_then_symbol() {
        let mut scores = vec![
            CompositeScore {
                symbol: "ETHUSD".to_string(),
                score: 80.0,
                components: Vec::new(),
                regime: "normal".to_string(),
                weights: weights(),
                selected: false,
                momentum_core: 5.0,
            },
            CompositeScore {
                symbol: "BTCUSD".to_string(),
                score: 80.0,
                components: Vec::new(),
                regime: "normal".to_string(),
                weights: weights(),
                selected: false,
                momentum_core: 5.0,
            },
            CompositeScore {
                symbol: "SOLUSD".to_string(),
                score: 80.0,
                components: Vec::new(),
                regime: "normal".to_string(),
                weights: weights(),
                selected: false,
                momentum_core: 9.0,
            },
            CompositeScore {
                symbol: "ADAUSD".to_string(),
                score: 95.0,
                components: Vec::new(),
                regime: "normal".to_string(),
                weights: weights(),
                selected: false,
                momentum_core: 1.0,
            },
        ];

        rank_and_select(&mut scores, 2);

        let order: Vec<&str> = scores.iter().map(|s| s.symbol.as_str()).collect();
        // ADA wins on score; SOL beats the 80s on momentum; BTC < ETH lexicographic.
        assert_eq!(order, vec!["ADAUSD", "SOLUSD", "BTCUSD", "ETHUSD"]);
        assert!(scores[0].selected && scores[1].selected);
        assert!(!scores[2].selected && !scores[3].selected);
    }

    #[test]
    fn composite_reflects_capped_social_not_raw() {
        // Raw social 12.0 with a hard cap of 10: the pipeline clamps after
        // orthogonalization, so the composite sees 10.0.
        let mut section = CrossSection::new();
        let mut s = set("BTCUSD", 0.0);
        s.social = 12.0;
        section.push(s).unwrap();

        crate::factors::orthogonal::orthogonalize(
            &mut section,
            &crate::config::ScanConfig::default().orthogonalization_sequence,
            10.0,
        );

        let scores = score_cross_section(&section, &weights(), "normal", 1.2);
        let social = scores[0]
            .components
            .iter()
            .find(|c| c.factor == crate::factors::FACTOR_SOCIAL)
            .unwrap();
        assert!((social.value - 10.0).abs() < 1e-9);
        assert!((social.weighted - 0.5).abs() < 1e-9);
    }

    #[test]
    fn ranking_is_deterministic() {
        let build = || {
            vec![
                set("BTCUSD", 5.0),
                set("ETHUSD", 3.0),
                set("SOLUSD", 7.0),
                set("ADAUSD", 2.0),
            ]
        };
        let mut a = score_cross_section(&xs(build()), &weights(), "normal", 1.2);
        let mut b = score_cross_section(&xs(build()), &weights(), "normal", 1.2);
        rank_and_select(&mut a, 2);
        rank_and_select(&mut b, 2);

        let oa: Vec<_> = a.iter().map(|s| (s.symbol.clone(), s.selected)).collect();
        let ob: Vec<_> = b.iter().map(|s| (s.symbol.clone(), s.selected)).collect();
        assert_eq!(oa, ob);
    }
}
