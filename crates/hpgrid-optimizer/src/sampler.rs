//! Search space samplers.
//!
//! A sampler yields one parameter assignment per call. Both samplers are
//! deterministic given their configuration (and seed), which is what lets
//! a resumed optimizer skip ahead to where the previous run stopped.

use hpgrid_core::config::ParameterSpec;
use hpgrid_core::{ParamValue, Parameter, ParameterKind};

use crate::error::{OptimizerError, OptimizerResult};

/// Points per numeric parameter when `num_numeric_choices` is not set.
pub const DEFAULT_NUMERIC_CHOICES: usize = 10;

pub trait Sampler: Send {
    fn name(&self) -> &'static str;

    /// Next candidate, or `None` once the search space is exhausted.
    fn generate(&mut self) -> Option<Vec<Parameter>>;

    /// Skip `n` candidates.
    fn fast_forward(&mut self, n: u64) {
        for _ in 0..n {
            if self.generate().is_none() {
                break;
            }
        }
    }

    /// Total number of candidates, if the space is finite.
    fn size(&self) -> Option<u64> {
        None
    }
}

/// Build the sampler named by `optimize.search_algorithm`.
pub fn from_name(
    name: &str,
    space: &[ParameterSpec],
    seed: Option<u64>,
) -> OptimizerResult<Box<dyn Sampler>> {
    match name.to_ascii_lowercase().as_str() {
        "random" => Ok(Box::new(RandomSampler::new(space.to_vec(), seed))),
        "grid" => Ok(Box::new(GridSampler::new(space))),
        _ => Err(OptimizerError::UnknownSampler(name.to_string())),
    }
}

fn kind_of(spec: &ParameterSpec) -> ParameterKind {
    match spec {
        ParameterSpec::UniformFloat { .. } => ParameterKind::UniformFloat,
        ParameterSpec::UniformInt { .. } => ParameterKind::UniformInt,
        ParameterSpec::Categorical { .. } => ParameterKind::Categorical,
        ParameterSpec::Ordinal { .. } => ParameterKind::Ordinal,
    }
}

fn f64_range(rng: &mut fastrand::Rng, low: f64, high: f64) -> f64 {
    low + rng.f64() * (high - low)
}

// ── Random ────────────────────────────────────────────────────────

/// Independent uniform draws per parameter, log-uniform where configured.
pub struct RandomSampler {
    space: Vec<ParameterSpec>,
    rng: fastrand::Rng,
}

impl RandomSampler {
    pub fn new(space: Vec<ParameterSpec>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Self { space, rng }
    }

    fn sample(rng: &mut fastrand::Rng, spec: &ParameterSpec) -> ParamValue {
        match spec {
            ParameterSpec::UniformFloat {
                lower, upper, log, ..
            } => {
                let value = if *log {
                    f64_range(rng, lower.ln(), upper.ln()).exp()
                } else {
                    f64_range(rng, *lower, *upper)
                };
                ParamValue::Float(value.clamp(*lower, *upper))
            }
            ParameterSpec::UniformInt {
                lower, upper, log, ..
            } => {
                let value = if *log {
                    let raw = f64_range(rng, (*lower as f64).ln(), (*upper as f64).ln()).exp();
                    (raw.round() as i64).clamp(*lower, *upper)
                } else {
                    rng.i64(*lower..=*upper)
                };
                ParamValue::Int(value)
            }
            ParameterSpec::Categorical { choices, .. } => {
                ParamValue::Str(choices[rng.usize(0..choices.len())].clone())
            }
            ParameterSpec::Ordinal { sequence, .. } => {
                ParamValue::Float(sequence[rng.usize(0..sequence.len())])
            }
        }
    }
}

impl Sampler for RandomSampler {
    fn name(&self) -> &'static str {
        "random"
    }

    fn generate(&mut self) -> Option<Vec<Parameter>> {
        let rng = &mut self.rng;
        Some(
            self.space
                .iter()
                .map(|spec| Parameter::new(spec.name(), kind_of(spec), Self::sample(rng, spec)))
                .collect(),
        )
    }
}

// ── Grid ──────────────────────────────────────────────────────────

/// Exhaustive enumeration of the discretized search space.
///
/// The last parameter varies fastest.
pub struct GridSampler {
    axes: Vec<(String, ParameterKind, Vec<ParamValue>)>,
    next: u64,
    size: u64,
}

impl GridSampler {
    pub fn new(space: &[ParameterSpec]) -> Self {
        let axes: Vec<_> = space
            .iter()
            .map(|spec| (spec.name().to_string(), kind_of(spec), grid_points(spec)))
            .collect();
        let size = axes
            .iter()
            .map(|(_, _, points)| points.len() as u64)
            .fold(1u64, u64::saturating_mul);
        Self {
            axes,
            next: 0,
            size,
        }
    }
}

impl Sampler for GridSampler {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn generate(&mut self) -> Option<Vec<Parameter>> {
        if self.next >= self.size {
            return None;
        }
        let mut rest = self.next;
        let mut params = Vec::with_capacity(self.axes.len());
        for (name, kind, points) in self.axes.iter().rev() {
            let radix = points.len() as u64;
            let value = points[(rest % radix) as usize].clone();
            rest /= radix;
            params.push(Parameter::new(name.clone(), *kind, value));
        }
        params.reverse();
        self.next += 1;
        Some(params)
    }

    fn fast_forward(&mut self, n: u64) {
        self.next = self.next.saturating_add(n).min(self.size);
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}

/// Evenly spaced points over `[lower, upper]`, in log space when `log`.
fn spaced(lower: f64, upper: f64, n: usize, log: bool) -> Vec<f64> {
    if n <= 1 || lower == upper {
        return vec![lower];
    }
    let (lo, hi) = if log {
        (lower.ln(), upper.ln())
    } else {
        (lower, upper)
    };
    let step = (hi - lo) / (n - 1) as f64;
    (0..n)
        .map(|i| match i {
            0 => lower,
            i if i == n - 1 => upper,
            i => {
                let v = lo + step * i as f64;
                let v = if log { v.exp() } else { v };
                v.clamp(lower, upper)
            }
        })
        .collect()
}

fn grid_points(spec: &ParameterSpec) -> Vec<ParamValue> {
    match spec {
        ParameterSpec::UniformFloat {
            lower,
            upper,
            log,
            num_numeric_choices,
            ..
        } => spaced(
            *lower,
            *upper,
            num_numeric_choices.unwrap_or(DEFAULT_NUMERIC_CHOICES),
            *log,
        )
        .into_iter()
        .map(ParamValue::Float)
        .collect(),
        ParameterSpec::UniformInt {
            lower,
            upper,
            log,
            num_numeric_choices,
            ..
        } => {
            let n = num_numeric_choices.unwrap_or(DEFAULT_NUMERIC_CHOICES);
            let mut points: Vec<i64> = spaced(*lower as f64, *upper as f64, n, *log)
                .into_iter()
                .map(|v| (v.round() as i64).clamp(*lower, *upper))
                .collect();
            points.dedup();
            points.into_iter().map(ParamValue::Int).collect()
        }
        ParameterSpec::Categorical { choices, .. } => {
            choices.iter().cloned().map(ParamValue::Str).collect()
        }
        ParameterSpec::Ordinal { sequence, .. } => {
            sequence.iter().copied().map(ParamValue::Float).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::UniformFloat {
                name: "lr".into(),
                lower: 1e-4,
                upper: 1e-1,
                log: true,
                num_numeric_choices: Some(4),
            },
            ParameterSpec::UniformInt {
                name: "layers".into(),
                lower: 1,
                upper: 3,
                log: false,
                num_numeric_choices: Some(3),
            },
            ParameterSpec::Categorical {
                name: "opt".into(),
                choices: vec!["adam".into(), "sgd".into()],
            },
        ]
    }

    #[test]
    fn random_respects_bounds() {
        let mut sampler = RandomSampler::new(space(), Some(3));
        for _ in 0..200 {
            let params = sampler.generate().unwrap();
            let lr = params[0].value.as_f64().unwrap();
            assert!((1e-4..=1e-1).contains(&lr));
            assert!(matches!(params[1].value, ParamValue::Int(1..=3)));
            assert!(matches!(&params[2].value, ParamValue::Str(s) if s == "adam" || s == "sgd"));
            assert_eq!(params[2].kind, ParameterKind::Categorical);
        }
    }

    #[test]
    fn seeded_random_fast_forward_matches_uninterrupted_run() {
        let mut full = RandomSampler::new(space(), Some(42));
        let sequence: Vec<_> = (0..6).map(|_| full.generate().unwrap()).collect();

        let mut resumed = RandomSampler::new(space(), Some(42));
        resumed.fast_forward(4);
        assert_eq!(resumed.generate().unwrap(), sequence[4]);
        assert_eq!(resumed.generate().unwrap(), sequence[5]);
    }

    #[test]
    fn grid_enumerates_every_combination_once() {
        let mut sampler = GridSampler::new(&space());
        assert_eq!(sampler.size(), Some(4 * 3 * 2));

        let mut seen = Vec::new();
        while let Some(params) = sampler.generate() {
            let key: Vec<String> = params.iter().map(|p| p.value.to_string()).collect();
            assert!(!seen.contains(&key));
            seen.push(key);
        }
        assert_eq!(seen.len(), 24);
        assert_eq!(seen[0], vec!["0.0001", "1", "adam"]);
        assert_eq!(seen[1], vec!["0.0001", "1", "sgd"]);
    }

    #[test]
    fn grid_fast_forward_skips_ahead() {
        let mut full = GridSampler::new(&space());
        let sequence: Vec<_> = std::iter::from_fn(|| full.generate()).collect();

        let mut resumed = GridSampler::new(&space());
        resumed.fast_forward(10);
        assert_eq!(resumed.generate().unwrap(), sequence[10]);
        resumed.fast_forward(100);
        assert!(resumed.generate().is_none());
    }

    #[test]
    fn grid_points_include_bounds() {
        let points = spaced(0.0, 1.0, 5, false);
        assert_eq!(points, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        let points = spaced(1.0, 100.0, 3, true);
        assert!((points[1] - 10.0).abs() < 1e-9);
        assert_eq!(spaced(2.0, 2.0, 4, false), vec![2.0]);
    }

    #[test]
    fn unknown_sampler_is_rejected() {
        assert!(from_name("tpe", &space(), None).is_err());
        assert_eq!(from_name("Grid", &space(), None).unwrap().name(), "grid");
    }
}
