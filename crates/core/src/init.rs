//! Seeded parameter initialisation.
//!
//! Candle's CPU backend cannot be seeded, so the init hints given to
//! `VarBuilder` are only placeholders: [`reset_parameters`] overwrites every
//! variable of a `VarMap` from an explicit [`StdRng`]. Variables are visited
//! in name order, so the same seed always produces the same weights.
//!
//! The scheme is chosen from the variable's name suffix:
//!
//! | suffix        | init                              |
//! |---------------|-----------------------------------|
//! | `bias`, `beta`| zeros                             |
//! | `gamma`       | ones                              |
//! | `embeddings`  | U(±0.02·√3) (σ = 0.02)            |
//! | anything else | U(±1/√fan_in), fan_in = last dim  |

use candle_core::{Result, Tensor, Var};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::Rng;

const EMBED_STD: f64 = 0.02;

/// How a single variable is initialised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitScheme {
    Zeros,
    Ones,
    Uniform(f64),
}

impl InitScheme {
    pub fn for_var(name: &str, dims: &[usize]) -> Self {
        let suffix = name.rsplit('.').next().unwrap_or(name);
        match suffix {
            "bias" | "beta" => Self::Zeros,
            "gamma" => Self::Ones,
            "embeddings" => Self::Uniform(EMBED_STD * 3f64.sqrt()),
            _ => {
                let fan_in = dims.last().copied().unwrap_or(1).max(1);
                Self::Uniform(1.0 / (fan_in as f64).sqrt())
            }
        }
    }

    fn sample(&self, n: usize, rng: &mut StdRng) -> Vec<f32> {
        match *self {
            Self::Zeros => vec![0.0; n],
            Self::Ones => vec![1.0; n],
            Self::Uniform(bound) => {
                let bound = bound as f32;
                (0..n).map(|_| rng.gen_range(-bound..=bound)).collect()
            }
        }
    }
}

/// Sorted `(name, var)` pairs of a `VarMap`.
pub fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("varmap lock poisoned".to_string()))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Overwrite every variable in `varmap` in place. Returns the number of
/// scalars written.
pub fn reset_parameters(varmap: &VarMap, rng: &mut StdRng) -> Result<usize> {
    let mut total = 0;
    for (name, var) in named_vars(varmap)? {
        let scheme = InitScheme::for_var(&name, var.dims());
        let n = var.elem_count();
        let values = Tensor::from_vec(scheme.sample(n, rng), var.dims(), var.device())?
            .to_dtype(var.dtype())?;
        var.set(&values)?;
        total += n;
    }
    tracing::debug!(params = total, "reset parameters");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;
    use rand::SeedableRng;

    fn build() -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        candle_nn::linear(4, 3, vb.pp("head")).unwrap();
        vb.pp("ln")
            .get_with_hints(3, "gamma", candle_nn::Init::Const(0.5))
            .unwrap();
        varmap
    }

    fn snapshot(varmap: &VarMap) -> Vec<Vec<f32>> {
        named_vars(varmap)
            .unwrap()
            .into_iter()
            .map(|(_, v)| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn scheme_by_suffix() {
        assert_eq!(InitScheme::for_var("h.0.ln1.beta", &[8]), InitScheme::Zeros);
        assert_eq!(InitScheme::for_var("head.bias", &[3]), InitScheme::Zeros);
        assert_eq!(InitScheme::for_var("ln.gamma", &[8]), InitScheme::Ones);
        assert_eq!(
            InitScheme::for_var("head.weight", &[3, 16]),
            InitScheme::Uniform(0.25)
        );
    }

    #[test]
    fn same_seed_same_weights() {
        let a = build();
        let b = build();
        reset_parameters(&a, &mut StdRng::seed_from_u64(3)).unwrap();
        reset_parameters(&b, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(snapshot(&a), snapshot(&b));

        reset_parameters(&b, &mut StdRng::seed_from_u64(4)).unwrap();
        assert_ne!(snapshot(&a), snapshot(&b));
    }

    #[test]
    fn bounds_and_constants() {
        let vm = build();
        let n = reset_parameters(&vm, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(n, 12 + 3 + 3);
        let vars = named_vars(&vm).unwrap();
        let names: Vec<&str> = vars.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["head.bias", "head.weight", "ln.gamma"]);
        let snap = snapshot(&vm);
        assert!(snap[0].iter().all(|&v| v == 0.0));
        assert!(snap[1].iter().all(|&v| v.abs() <= 0.5));
        assert!(snap[2].iter().all(|&v| v == 1.0));
    }
}
