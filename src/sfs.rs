//! Emission side of the model: conditioned site frequency spectra, block keys
//! and the per-population-count emission variants.
//!
//! One-population spectra are `3 x (n+1)` matrices indexed by `(a, b)`: `a`
//! derived alleles among the two distinguished lineages, `b` among the `n`
//! undistinguished ones. Two-population spectra are the outer layout
//! `(a1, b1) x (a2, b2)`, flattened row-major. Entries are expected branch
//! lengths; the emission matrix multiplies them by theta and puts the
//! remaining mass on the monomorphic cell.

use ndarray::{Array2, ArrayView1};

use crate::ad::Adouble;
use crate::error::{EngineError, Result};
use crate::expm::{AdMatrix, zeros};
use crate::rate::{ParameterVector, RateFunction};
use crate::utils::hypergeometric;

/// Observation columns after the span, i.e. `(a, b, nb)` per population.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockKey(pub Vec<i32>);

impl BlockKey {
    pub fn from_row(row: &[i32]) -> Self {
        Self(row[1..].to_vec())
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }
}

impl std::fmt::Display for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        write!(f, "({})", parts.join(","))
    }
}

/// Supplies one conditioned spectrum per hidden state.
pub trait ConditionedSfs: Send + Sync {
    fn sample_size(&self) -> usize;

    fn compute(&self, eta: &RateFunction, hidden_states: &[f64]) -> Result<Vec<AdMatrix>>;
}

/// Spectrum driven by the distinguished pair's coalescence time.
///
/// The pair is heterozygous with expected branch length `2 E[T | state]`;
/// undistinguished lineages follow the neutral `2 E[T] / b` spectrum.
#[derive(Debug, Clone)]
pub struct PairwiseSfs {
    n: usize,
}

impl PairwiseSfs {
    pub fn new(n: usize) -> Self {
        Self { n }
    }
}

impl ConditionedSfs for PairwiseSfs {
    fn sample_size(&self) -> usize {
        self.n
    }

    fn compute(&self, eta: &RateFunction, hidden_states: &[f64]) -> Result<Vec<AdMatrix>> {
        let overall = eta.mean_coalescence_time(0.0, f64::INFINITY)?;
        let mut out = Vec::with_capacity(hidden_states.len().saturating_sub(1));
        for w in hidden_states.windows(2) {
            let mean = eta.mean_coalescence_time(w[0], w[1])?;
            let mut m = zeros(3, self.n + 1);
            m[(1, 0)] = &mean * 2.0;
            for b in 1..=self.n {
                m[(0, b)] = &overall * (2.0 / b as f64);
            }
            out.push(m);
        }
        Ok(out)
    }
}

pub enum EmissionModel {
    OnePop {
        n: usize,
        csfs: Box<dyn ConditionedSfs>,
    },
    TwoPop {
        n1: usize,
        n2: usize,
        /// One `3(n1+1) x 3(n2+1)` table per hidden state.
        tables: Option<Vec<Array2<f64>>>,
    },
}

impl std::fmt::Debug for EmissionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmissionModel::OnePop { n, .. } => f.debug_struct("OnePop").field("n", n).finish(),
            EmissionModel::TwoPop { n1, n2, tables } => f
                .debug_struct("TwoPop")
                .field("n1", n1)
                .field("n2", n2)
                .field("tables", &tables.as_ref().map(Vec::len))
                .finish(),
        }
    }
}

impl EmissionModel {
    pub fn one_pop(n: usize) -> Self {
        Self::OnePop {
            n,
            csfs: Box::new(PairwiseSfs::new(n)),
        }
    }

    pub fn one_pop_with(csfs: Box<dyn ConditionedSfs>) -> Self {
        Self::OnePop {
            n: csfs.sample_size(),
            csfs,
        }
    }

    pub fn two_pop(n1: usize, n2: usize) -> Self {
        Self::TwoPop {
            n1,
            n2,
            tables: None,
        }
    }

    pub fn npop(&self) -> usize {
        match self {
            EmissionModel::OnePop { .. } => 1,
            EmissionModel::TwoPop { .. } => 2,
        }
    }

    pub fn sample_sizes(&self) -> Vec<usize> {
        match self {
            EmissionModel::OnePop { n, .. } => vec![*n],
            EmissionModel::TwoPop { n1, n2, .. } => vec![*n1, *n2],
        }
    }

    pub fn sfs_dim(&self) -> usize {
        self.sample_sizes().iter().map(|n| 3 * (n + 1)).product()
    }

    /// Columns per observation row: span plus `(a, b, nb)` per population.
    pub fn n_cols(&self) -> usize {
        1 + 3 * self.npop()
    }

    pub fn validate_key(&self, key: &[i32]) -> std::result::Result<(), String> {
        if key.len() != 3 * self.npop() {
            return Err(format!(
                "block key has {} entries, expected {}",
                key.len(),
                3 * self.npop()
            ));
        }
        for (p, n) in self.sample_sizes().into_iter().enumerate() {
            let (a, b, nb) = (key[3 * p], key[3 * p + 1], key[3 * p + 2]);
            if !(-1..=2).contains(&a) {
                return Err(format!("population {p}: a={a} outside -1..=2"));
            }
            if nb < 0 || nb as usize > n {
                return Err(format!("population {p}: nb={nb} outside 0..={n}"));
            }
            if b < 0 || b > nb {
                return Err(format!("population {p}: b={b} outside 0..={nb}"));
            }
        }
        Ok(())
    }

    pub fn set_tables(&mut self, new_tables: Vec<Array2<f64>>) -> Result<()> {
        match self {
            EmissionModel::TwoPop { n1, n2, tables } => {
                let shape = (3 * (*n1 + 1), 3 * (*n2 + 1));
                for (k, t) in new_tables.iter().enumerate() {
                    if t.dim() != shape {
                        return Err(EngineError::invalid_parameters(format!(
                            "emission table {k} has shape {:?}, expected {:?}",
                            t.dim(),
                            shape
                        )));
                    }
                }
                *tables = Some(new_tables);
                Ok(())
            }
            EmissionModel::OnePop { .. } => Err(EngineError::invalid_config(
                "emission tables can only be supplied to a two-population model",
            )),
        }
    }

    /// M x sfs_dim emission matrix for the given rate function and theta.
    pub fn recompute_emission(
        &self,
        eta: &RateFunction,
        hidden_states: &[f64],
        theta: f64,
    ) -> Result<AdMatrix> {
        let m = hidden_states.len() - 1;
        let spectra: Vec<Vec<Adouble>> = match self {
            EmissionModel::OnePop { n, csfs } => {
                let per_state = csfs.compute(eta, hidden_states)?;
                if per_state.len() != m {
                    return Err(EngineError::invalid_config(format!(
                        "conditioned SFS returned {} spectra for {} hidden states",
                        per_state.len(),
                        m
                    )));
                }
                let mut flat = Vec::with_capacity(m);
                for (k, s) in per_state.into_iter().enumerate() {
                    if s.dim() != (3, n + 1) {
                        return Err(EngineError::invalid_config(format!(
                            "conditioned SFS {k} has shape {:?}, expected (3, {})",
                            s.dim(),
                            n + 1
                        )));
                    }
                    flat.push(s.iter().cloned().collect());
                }
                flat
            }
            EmissionModel::TwoPop { tables, .. } => {
                let tables = tables.as_ref().ok_or(EngineError::MissingEmissionTables)?;
                if tables.len() != m {
                    return Err(EngineError::invalid_parameters(format!(
                        "{} emission tables supplied for {} hidden states",
                        tables.len(),
                        m
                    )));
                }
                tables
                    .iter()
                    .map(|t| t.iter().map(|&v| Adouble::constant(v)).collect())
                    .collect()
            }
        };

        let dim = self.sfs_dim();
        let mut emission = zeros(m, dim);
        for (k, spectrum) in spectra.iter().enumerate() {
            let mut polymorphic = Adouble::zero();
            for (idx, v) in spectrum.iter().enumerate().skip(1) {
                let scaled = v * theta;
                polymorphic += &scaled;
                emission[(k, idx)] = scaled;
            }
            emission[(k, 0)] = 1.0 - &polymorphic;
        }
        if !emission.iter().all(Adouble::is_finite) {
            return Err(EngineError::NonFinite(
                "emission matrix contains non-finite entries".to_string(),
            ));
        }
        if let Some(((k, idx), v)) = emission
            .indexed_iter()
            .find(|(_, v)| !(0.0..=1.0).contains(&v.value()))
        {
            return Err(EngineError::invalid_parameters(format!(
                "emission probability {} for hidden state {k}, cell {idx} is outside [0, 1] (theta={theta})",
                v.value()
            )));
        }
        Ok(emission)
    }

    /// Probability of `key` under one hidden state's emission row,
    /// marginalizing missing and subsampled columns.
    pub fn emission_prob(&self, row: ArrayView1<'_, Adouble>, key: &BlockKey) -> Adouble {
        let key = key.as_slice();
        match self {
            EmissionModel::OnePop { n, .. } => {
                let mut p = Adouble::zero();
                for (idx, w) in marginal_weights(key[0], key[1], key[2], *n) {
                    p += &row[idx] * w;
                }
                p
            }
            EmissionModel::TwoPop { n1, n2, .. } => {
                let stride = 3 * (n2 + 1);
                let outer = marginal_weights(key[0], key[1], key[2], *n1);
                let inner = marginal_weights(key[3], key[4], key[5], *n2);
                let mut p = Adouble::zero();
                for &(i1, w1) in &outer {
                    for &(i2, w2) in &inner {
                        p += &row[i1 * stride + i2] * (w1 * w2);
                    }
                }
                p
            }
        }
    }
}

/// Flat `(a, B)` cells and weights contributing to an observed `(a, b, nb)`.
fn marginal_weights(a: i32, b: i32, nb: i32, n: usize) -> Vec<(usize, f64)> {
    let alleles: Vec<usize> = if a < 0 { vec![0, 1, 2] } else { vec![a as usize] };
    let (b, nb) = (b as usize, nb as usize);
    let mut out = Vec::new();
    for a in alleles {
        for total in 0..=n {
            let w = hypergeometric(b, nb, total, n);
            if w > 0.0 {
                out.push((a * (n + 1) + total, w));
            }
        }
    }
    out
}

/// Theta-scaled spectrum of a sample with `n` undistinguished lineages under
/// `params`, marginal over all coalescence times.
///
/// The marginal spectrum does not depend on `rho`; it is validated only so
/// that callers passing a full parameter set get consistent errors.
pub fn sfs(
    n: usize,
    params: &ParameterVector,
    rho: f64,
    theta: f64,
    folded: bool,
) -> Result<AdMatrix> {
    if !(rho.is_finite() && rho >= 0.0) {
        return Err(EngineError::invalid_parameters(format!(
            "rho={rho} must be finite and non-negative"
        )));
    }
    if !(theta.is_finite() && theta >= 0.0) {
        return Err(EngineError::invalid_parameters(format!(
            "theta={theta} must be finite and non-negative"
        )));
    }
    let eta = RateFunction::new(params)?;
    let model = EmissionModel::one_pop(n);
    let flat = model.recompute_emission(&eta, &[0.0, f64::INFINITY], theta)?;
    let mut out = zeros(3, n + 1);
    for a in 0..3 {
        for b in 0..=n {
            out[(a, b)] = flat[(0, a * (n + 1) + b)].clone();
        }
    }
    if folded {
        fold(&mut out);
    }
    Ok(out)
}

/// Moves every cell whose derived count exceeds half the sample onto its
/// complement `(2 - a, n - b)`.
fn fold(spectrum: &mut AdMatrix) {
    let n = spectrum.ncols() - 1;
    let total = n + 2;
    for a in 0..3 {
        for b in 0..=n {
            if 2 * (a + b) > total {
                let v = std::mem::take(&mut spectrum[(a, b)]);
                spectrum[(2 - a, n - b)] += v;
            }
        }
    }
}
