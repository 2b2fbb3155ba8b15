//! Per-sequence forward-backward.
//!
//! [`InferenceBundle`] holds the matrices every sequence shares during one
//! E-step: initial distribution, transition, emission and the emission
//! probabilities of each observed block key. It is built once by the
//! coordinator and only read afterwards. Each [`Hmm`] owns one sequence's
//! run-length rows and the [`HmmStats`] of its last successful E-step.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::{Array1, Array2};

use crate::ad::Adouble;
use crate::error::{EngineError, Result};
use crate::expm::{AdMatrix, values};
use crate::sfs::BlockKey;

/// Matrices shared read-only by every sequence during one E-step.
#[derive(Debug, Clone, Default)]
pub struct InferenceBundle {
    pi: Array1<Adouble>,
    transition: AdMatrix,
    emission: AdMatrix,
    emission_probs: BTreeMap<BlockKey, Array1<Adouble>>,

    pi_values: Vec<f64>,
    // row-major and column-major copies of the transition values
    a_row: Vec<f64>,
    a_col: Vec<f64>,
    emission_values: BTreeMap<BlockKey, Vec<f64>>,
}

impl InferenceBundle {
    pub fn n_states(&self) -> usize {
        self.pi.len()
    }

    pub fn pi(&self) -> &Array1<Adouble> {
        &self.pi
    }

    pub fn transition(&self) -> &AdMatrix {
        &self.transition
    }

    pub fn emission(&self) -> &AdMatrix {
        &self.emission
    }

    pub fn emission_probs(&self) -> &BTreeMap<BlockKey, Array1<Adouble>> {
        &self.emission_probs
    }

    pub fn set_pi(&mut self, pi: Array1<Adouble>) {
        self.pi_values = pi.iter().map(Adouble::value).collect();
        self.pi = pi;
    }

    pub fn set_transition(&mut self, transition: AdMatrix) {
        let n = transition.nrows();
        let v = values(&transition);
        self.a_row = v.iter().copied().collect();
        self.a_col = v.t().iter().copied().collect();
        debug_assert_eq!(self.a_col.len(), n * n);
        self.transition = transition;
    }

    pub fn set_emission(
        &mut self,
        emission: AdMatrix,
        emission_probs: BTreeMap<BlockKey, Array1<Adouble>>,
    ) {
        self.emission_values = emission_probs
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().map(Adouble::value).collect()))
            .collect();
        self.emission = emission;
        self.emission_probs = emission_probs;
    }
}

/// Posterior statistics of one sequence from its last successful E-step.
#[derive(Debug, Clone)]
pub struct HmmStats {
    pub loglik: f64,
    pub xisum: Arc<Array2<f64>>,
    /// Posterior over hidden states at the first site.
    pub gamma0: Vec<f64>,
    pub gamma_sums: Arc<BTreeMap<BlockKey, Vec<f64>>>,
    /// M x rows posterior at the last site of each row, when requested.
    pub gamma: Option<Arc<Array2<f64>>>,
}

#[derive(Debug)]
pub struct Hmm {
    index: usize,
    spans: Vec<usize>,
    keys: Vec<BlockKey>,
    stats: Option<HmmStats>,
}

fn alpha_cache_budget_bytes() -> usize {
    // SMCPP_ALPHA_CACHE_MB=0 forces per-row recomputation in the backward pass.
    const DEFAULT_MB: usize = 256;
    let mb = std::env::var("SMCPP_ALPHA_CACHE_MB")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MB);
    mb.saturating_mul(1024).saturating_mul(1024)
}

struct ForwardCtx<'a> {
    pi: &'a [f64],
    a_col: &'a [f64],
    n_states: usize,
}

impl ForwardCtx<'_> {
    /// Scaled forward recursion over `span` sites emitting `em`.
    fn fill_row(
        &self,
        em: &[f64],
        span: usize,
        start_prev: Option<&[f64]>,
        alpha_row: &mut [f64],
        c_norm: &mut [f64],
        tmp: &mut [f64],
    ) -> std::result::Result<(), String> {
        let n = self.n_states;
        for t in 0..span {
            let prev = if t == 0 {
                start_prev
            } else {
                Some(&alpha_row[(t - 1) * n..t * n])
            };
            let mut norm = 0.0;
            match prev {
                None => {
                    for k in 0..n {
                        let v = self.pi[k] * em[k];
                        tmp[k] = v;
                        norm += v;
                    }
                }
                Some(prev) => {
                    for k in 0..n {
                        let a_col_k = &self.a_col[k * n..(k + 1) * n];
                        let mut dot = 0.0;
                        for i in 0..n {
                            dot += prev[i] * a_col_k[i];
                        }
                        let v = dot * em[k];
                        tmp[k] = v;
                        norm += v;
                    }
                }
            }
            if !(norm > 0.0) || !norm.is_finite() {
                return Err(format!("normalization factor is {norm} in forward pass"));
            }
            c_norm[t] = norm;
            let alpha_t = &mut alpha_row[t * n..(t + 1) * n];
            for k in 0..n {
                alpha_t[k] = tmp[k] / norm;
            }
        }
        Ok(())
    }
}

impl Hmm {
    /// `obs` rows are `span` followed by the block key columns.
    pub fn new(index: usize, obs: &Array2<i32>) -> Self {
        let mut spans = Vec::with_capacity(obs.nrows());
        let mut keys = Vec::with_capacity(obs.nrows());
        for row in obs.rows() {
            let row = row.to_vec();
            spans.push(row[0].max(0) as usize);
            keys.push(BlockKey::from_row(&row));
        }
        Self {
            index,
            spans,
            keys,
            stats: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn n_rows(&self) -> usize {
        self.spans.len()
    }

    pub fn n_sites(&self) -> usize {
        self.spans.iter().sum()
    }

    pub fn keys(&self) -> &[BlockKey] {
        &self.keys
    }

    pub fn stats(&self) -> Option<&HmmStats> {
        self.stats.as_ref()
    }

    fn require_stats(&self) -> Result<&HmmStats> {
        self.stats
            .as_ref()
            .ok_or(EngineError::NoStatistics(self.index))
    }

    pub fn loglik(&self) -> Result<f64> {
        Ok(self.require_stats()?.loglik)
    }

    /// Runs forward-backward against `bundle`; statistics are replaced only
    /// on success.
    pub fn e_step(&mut self, bundle: &InferenceBundle, save_gamma: bool) -> Result<()> {
        let stats = self
            .forward_backward(bundle, save_gamma)
            .map_err(|message| EngineError::instance(self.index, message))?;
        self.stats = Some(stats);
        Ok(())
    }

    fn forward_backward(
        &self,
        bundle: &InferenceBundle,
        save_gamma: bool,
    ) -> std::result::Result<HmmStats, String> {
        let n = bundle.n_states();
        let n_rows = self.n_rows();
        if n == 0 {
            return Err("inference bundle is empty".to_string());
        }
        if bundle.a_row.len() != n * n {
            return Err("transition matrix shape mismatch".to_string());
        }
        if n_rows == 0 {
            return Err("empty observation sequence".to_string());
        }
        if let Some(r) = self.spans.iter().position(|&s| s == 0) {
            return Err(format!("row {r} has zero span"));
        }

        let mut row_em: Vec<&[f64]> = Vec::with_capacity(n_rows);
        for key in &self.keys {
            let em = bundle
                .emission_values
                .get(key)
                .ok_or_else(|| format!("no emission probabilities for block key {key}"))?;
            row_em.push(em.as_slice());
        }

        let ctx = ForwardCtx {
            pi: &bundle.pi_values,
            a_col: &bundle.a_col,
            n_states: n,
        };

        let max_span = self.spans.iter().copied().max().unwrap_or(0);
        let mut alpha_buf = vec![0.0f64; max_span * n];
        let mut c_norm_buf = vec![0.0f64; max_span];
        let mut tmp = vec![0.0f64; n];

        let total_bytes = (self.n_sites() * (n + 1)).saturating_mul(std::mem::size_of::<f64>());
        let enable_cache = total_bytes <= alpha_cache_budget_bytes();
        let mut row_cache: Vec<Option<(Vec<f64>, Vec<f64>)>> = vec![None; n_rows];

        // alpha entering each row; None for the first row
        let mut row_prev: Vec<Option<Vec<f64>>> = vec![None; n_rows];
        let mut loglik = 0.0;
        for r in 0..n_rows {
            let span = self.spans[r];
            let alpha_row = &mut alpha_buf[..span * n];
            let c_norm = &mut c_norm_buf[..span];
            ctx.fill_row(row_em[r], span, row_prev[r].as_deref(), alpha_row, c_norm, &mut tmp)
                .map_err(|e| format!("row {r}: {e}"))?;
            for c in c_norm.iter() {
                loglik += c.ln();
            }
            if r + 1 < n_rows {
                row_prev[r + 1] = Some(alpha_row[(span - 1) * n..span * n].to_vec());
            }
            if enable_cache {
                row_cache[r] = Some((alpha_row.to_vec(), c_norm.to_vec()));
            }
        }

        let mut xi_flat = vec![0.0f64; n * n];
        let mut gamma_sums: BTreeMap<BlockKey, Vec<f64>> = BTreeMap::new();
        let mut gamma = if save_gamma {
            Some(Array2::<f64>::zeros((n, n_rows)))
        } else {
            None
        };
        let mut gamma0 = vec![0.0f64; n];
        let mut beta = vec![1.0f64; n];
        let mut beta_new = vec![0.0f64; n];
        let mut em_beta = vec![0.0f64; n];

        for r in (0..n_rows).rev() {
            let span = self.spans[r];
            let em = row_em[r];
            let (alpha_row, c_norm): (&[f64], &[f64]) = match row_cache[r].as_ref() {
                Some((a, c)) => (a, c),
                None => {
                    let alpha_row = &mut alpha_buf[..span * n];
                    let c_norm = &mut c_norm_buf[..span];
                    ctx.fill_row(em, span, row_prev[r].as_deref(), alpha_row, c_norm, &mut tmp)
                        .map_err(|e| format!("row {r}: {e}"))?;
                    (alpha_row, c_norm)
                }
            };
            let sums = gamma_sums
                .entry(self.keys[r].clone())
                .or_insert_with(|| vec![0.0; n]);

            for t in (0..span).rev() {
                let alpha_t = &alpha_row[t * n..(t + 1) * n];
                for k in 0..n {
                    sums[k] += alpha_t[k] * beta[k];
                }
                if t + 1 == span {
                    if let Some(g) = gamma.as_mut() {
                        for k in 0..n {
                            g[(k, r)] = alpha_t[k] * beta[k];
                        }
                    }
                }
                if t == 0 && r == 0 {
                    for k in 0..n {
                        gamma0[k] = alpha_t[k] * beta[k];
                    }
                    continue;
                }

                let alpha_prev = if t > 0 {
                    &alpha_row[(t - 1) * n..t * n]
                } else {
                    row_prev[r]
                        .as_deref()
                        .ok_or_else(|| format!("missing boundary state for row {r}"))?
                };
                let inv_norm = 1.0 / c_norm[t];
                for j in 0..n {
                    em_beta[j] = em[j] * beta[j];
                }
                for i in 0..n {
                    let a_i = &bundle.a_row[i * n..(i + 1) * n];
                    let xi_i = &mut xi_flat[i * n..(i + 1) * n];
                    let scale = alpha_prev[i] * inv_norm;
                    let mut acc = 0.0;
                    for j in 0..n {
                        let w = a_i[j] * em_beta[j];
                        xi_i[j] += scale * w;
                        acc += w;
                    }
                    beta_new[i] = acc * inv_norm;
                }
                std::mem::swap(&mut beta, &mut beta_new);
            }
        }

        let xisum = Array2::from_shape_vec((n, n), xi_flat).map_err(|e| e.to_string())?;
        Ok(HmmStats {
            loglik,
            xisum: Arc::new(xisum),
            gamma0,
            gamma_sums: Arc::new(gamma_sums),
            gamma: gamma.map(Arc::new),
        })
    }

    /// This sequence's `[initial, transition, emission]` terms of the
    /// expected complete-data log-likelihood.
    pub fn q(&self, bundle: &InferenceBundle) -> Result<Vec<Adouble>> {
        let stats = self.require_stats()?;
        let n = bundle.n_states();

        let mut q_pi = Adouble::zero();
        for (k, &w) in stats.gamma0.iter().enumerate() {
            if w != 0.0 {
                q_pi += bundle.pi[k].ln() * w;
            }
        }

        let mut q_trans = Adouble::zero();
        for i in 0..n {
            for j in 0..n {
                let w = stats.xisum[(i, j)];
                if w != 0.0 {
                    q_trans += bundle.transition[(i, j)].ln() * w;
                }
            }
        }

        let mut q_emis = Adouble::zero();
        for (key, sums) in stats.gamma_sums.iter() {
            let probs = bundle.emission_probs.get(key).ok_or_else(|| {
                EngineError::instance(self.index, format!("no emission probabilities for {key}"))
            })?;
            for (k, &w) in sums.iter().enumerate() {
                if w != 0.0 {
                    q_emis += probs[k].ln() * w;
                }
            }
        }

        Ok(vec![q_pi, q_trans, q_emis])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_state_bundle() -> InferenceBundle {
        let mut b = InferenceBundle::default();
        b.set_pi(array![Adouble::constant(0.6), Adouble::constant(0.4)]);
        b.set_transition(array![
            [Adouble::constant(0.9), Adouble::constant(0.1)],
            [Adouble::constant(0.2), Adouble::constant(0.8)]
        ]);
        let mut probs = BTreeMap::new();
        probs.insert(
            BlockKey(vec![0, 0, 0]),
            array![Adouble::constant(0.95), Adouble::constant(0.7)],
        );
        probs.insert(
            BlockKey(vec![1, 0, 0]),
            array![Adouble::constant(0.05), Adouble::constant(0.3)],
        );
        b.set_emission(crate::expm::zeros(2, 3), probs);
        b
    }

    #[test]
    fn posterior_mass_matches_site_and_transition_counts() {
        let obs = array![[3, 0, 0, 0], [1, 1, 0, 0], [4, 0, 0, 0], [1, 1, 0, 0]];
        let mut hmm = Hmm::new(0, &obs);
        hmm.e_step(&two_state_bundle(), true).unwrap();
        let stats = hmm.stats().unwrap();

        let total: f64 = stats.gamma_sums.values().flat_map(|v| v.iter()).sum();
        assert!((total - 9.0).abs() < 1e-9);
        assert!((stats.xisum.sum() - 8.0).abs() < 1e-9);
        assert!((stats.gamma0.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        let gamma = stats.gamma.as_ref().unwrap();
        assert_eq!(gamma.dim(), (2, 4));
        for r in 0..4 {
            assert!((gamma.column(r).sum() - 1.0).abs() < 1e-9);
        }
        assert!(stats.loglik < 0.0);
    }

    #[test]
    fn row_layout_does_not_change_likelihood() {
        let bundle = two_state_bundle();
        let split = array![[2, 0, 0, 0], [1, 0, 0, 0], [1, 1, 0, 0]];
        let merged = array![[3, 0, 0, 0], [1, 1, 0, 0]];
        let mut a = Hmm::new(0, &split);
        let mut b = Hmm::new(1, &merged);
        a.e_step(&bundle, false).unwrap();
        b.e_step(&bundle, false).unwrap();
        assert!((a.loglik().unwrap() - b.loglik().unwrap()).abs() < 1e-12);
        assert!(a.stats().unwrap().gamma.is_none());
    }

    #[test]
    fn unknown_key_is_an_instance_error() {
        let obs = array![[1, 2, 0, 0]];
        let mut hmm = Hmm::new(3, &obs);
        let err = hmm.e_step(&two_state_bundle(), false).unwrap_err();
        assert!(matches!(err, EngineError::InstanceComputation { index: 3, .. }));
        assert!(hmm.stats().is_none());
    }
}
