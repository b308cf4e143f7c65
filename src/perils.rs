use rand::Rng;
use rand_distr::{Beta, Distribution};

use crate::error::{ConfigError, SimError};

/// Severities are kept off 0 and 1 so the per-contract Beta stays proper.
const SEVERITY_FLOOR: f64 = 1e-6;

/// Random inputs for one catastrophe in one category.
#[derive(Debug, Clone, PartialEq)]
pub struct PerilDraw {
    /// Category-wide severity in [0, 1).
    pub severity: f64,
    /// Per-contract damage fractions, Beta(1, 1/severity − 1) so their mean is `severity`.
    pub damages: Vec<f64>,
    /// Per-contract trigger draws; a contract is hit when below its risk factor.
    pub uniforms: Vec<f64>,
}

/// Draw a catastrophe for `affected` contracts.
///
/// Draw order is fixed: one severity, then all damages, then all
/// triggers. Replays depend on this order.
pub fn draw_peril(affected: usize, rng: &mut impl Rng) -> Result<PerilDraw, SimError> {
    let severity: f64 = rng.random();
    let damages = contract_damages(severity, affected, rng)?;
    let uniforms = (0..affected).map(|_| rng.random::<f64>()).collect();
    Ok(PerilDraw { severity, damages, uniforms })
}

/// `n` independent damage fractions around a shared category severity.
pub fn contract_damages(severity: f64, n: usize, rng: &mut impl Rng) -> Result<Vec<f64>, SimError> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let s = severity.clamp(SEVERITY_FLOOR, 1.0 - SEVERITY_FLOOR);
    let dist = Beta::new(1.0, 1.0 / s - 1.0).map_err(|e| ConfigError::InvalidBounds {
        field: "severity",
        reason: format!("{severity}: {e}"),
    })?;
    Ok((0..n).map(|_| dist.sample(rng)).collect())
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn rng() -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(42)
    }

    /// Beta(1, 1/s − 1) has mean s; 10k samples at s = 0.3 land within ±0.02.
    #[test]
    fn contract_damage_mean_tracks_severity() {
        let mut rng = rng();
        let samples = contract_damages(0.3, 10_000, &mut rng).unwrap();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((mean - 0.3).abs() < 0.02, "mean damage {mean:.4} far from severity 0.3");
        assert!(samples.iter().all(|d| (0.0..=1.0).contains(d)));
    }

    /// Higher severity shifts the whole damage distribution up.
    #[test]
    fn higher_severity_means_higher_damage() {
        let mut rng = rng();
        let low = contract_damages(0.1, 5_000, &mut rng).unwrap();
        let high = contract_damages(0.8, 5_000, &mut rng).unwrap();
        let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
        assert!(mean(&high) > mean(&low) + 0.5);
    }

    #[test]
    fn extreme_severities_are_tamed() {
        let mut rng = rng();
        assert_eq!(contract_damages(0.0, 3, &mut rng).unwrap().len(), 3);
        assert_eq!(contract_damages(1.0, 3, &mut rng).unwrap().len(), 3);
    }

    #[test]
    fn peril_draw_sizes_match_affected_contracts() {
        let draw = draw_peril(17, &mut rng()).unwrap();
        assert!((0.0..1.0).contains(&draw.severity));
        assert_eq!(draw.damages.len(), 17);
        assert_eq!(draw.uniforms.len(), 17);
    }

    /// No contracts affected still consumes exactly one draw (the severity).
    #[test]
    fn empty_peril_consumes_one_draw() {
        let mut a = rng();
        let mut b = rng();
        draw_peril(0, &mut a).unwrap();
        let _: f64 = b.random();
        assert_eq!(a.random::<u64>(), b.random::<u64>());
    }

    #[test]
    fn same_seed_same_draw() {
        assert_eq!(draw_peril(50, &mut rng()).unwrap(), draw_peril(50, &mut rng()).unwrap());
    }
}
