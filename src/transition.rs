//! Hidden-state transition matrix from a two-locus continuous-time process.
//!
//! Walking back in time from the present, the lineage pairs at two adjacent
//! loci occupy one of six states:
//!
//! | state      | meaning                                          |
//! |------------|--------------------------------------------------|
//! | `LINKED`   | no recombination yet, neither locus coalesced    |
//! | `SPLIT`    | recombined, neither locus coalesced              |
//! | `A_DONE`   | recombined, only the left locus coalesced        |
//! | `B_DONE`   | recombined, only the right locus coalesced       |
//! | `BOTH`     | recombined, both loci coalesced                  |
//! | `JOINT`    | coalesced before any recombination               |
//!
//! Over a stretch where the coalescence rate `eta` is constant, the
//! propagator is `expm(G * d)`. `E(i, j)` is the propagator from hidden-state
//! boundary `i` to boundary `j`, memoized per `(i, j)` for the lifetime of one
//! builder, i.e. for one `(eta, rho)` pair.
//!
//! The joint probability that the left locus coalesces in interval `i` and
//! the right one in interval `j`, summing over `s` in {`LINKED`, `SPLIT`}:
//!
//! - `i < j`: `E(0,i)[0,s] E(i,i+1)[s,A] E(i+1,j)[A,A] E(j,j+1)[A,BOTH]`
//! - `i > j`: `E(0,j)[0,s] E(j,j+1)[s,B] E(j+1,i)[B,B] E(i,i+1)[B,BOTH]`
//! - `i = j`: `E(0,i)[0,s] (E(i,i+1)[s,BOTH] + E(i,i+1)[s,JOINT])`
//!
//! Dividing by the marginal `pi_i` gives the transition row.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::ad::Adouble;
use crate::error::{EngineError, Result};
use crate::expm::{AdMatrix, expm, identity, matmul, zeros};
use crate::rate::RateFunction;

const N_STATES: usize = 6;
const LINKED: usize = 0;
const SPLIT: usize = 1;
const A_DONE: usize = 2;
const B_DONE: usize = 3;
const BOTH: usize = 4;
const JOINT: usize = 5;

pub struct TransitionBuilder {
    eta: Arc<RateFunction>,
    hidden_states: Arc<[f64]>,
    rho: f64,
    m: usize,
    expm_memo: HashMap<(usize, usize), AdMatrix>,
    expm_evaluations: usize,
    matrix: Option<AdMatrix>,
}

impl TransitionBuilder {
    pub fn new(eta: Arc<RateFunction>, hidden_states: Arc<[f64]>, rho: f64) -> Result<Self> {
        if hidden_states.len() < 2 {
            return Err(EngineError::invalid_config(
                "need at least two hidden-state boundaries",
            ));
        }
        if !(rho.is_finite() && rho >= 0.0) {
            return Err(EngineError::invalid_parameters(format!(
                "rho={rho} must be finite and non-negative"
            )));
        }
        let m = hidden_states.len() - 1;
        Ok(Self {
            eta,
            hidden_states,
            rho,
            m,
            expm_memo: HashMap::new(),
            expm_evaluations: 0,
            matrix: None,
        })
    }

    pub fn n_states(&self) -> usize {
        self.m
    }

    pub fn rho(&self) -> f64 {
        self.rho
    }

    /// Number of propagators computed so far (memo misses).
    pub fn expm_evaluations(&self) -> usize {
        self.expm_evaluations
    }

    fn generator(&self, piece: usize) -> AdMatrix {
        let lam = self.eta.rate(piece);
        let rho = Adouble::constant(self.rho);
        let mut g = zeros(N_STATES, N_STATES);
        g[(LINKED, LINKED)] = -(lam + &rho);
        g[(LINKED, SPLIT)] = rho;
        g[(LINKED, JOINT)] = lam.clone();
        g[(SPLIT, SPLIT)] = lam * -2.0;
        g[(SPLIT, A_DONE)] = lam.clone();
        g[(SPLIT, B_DONE)] = lam.clone();
        g[(A_DONE, A_DONE)] = -lam;
        g[(A_DONE, BOTH)] = lam.clone();
        g[(B_DONE, B_DONE)] = -lam;
        g[(B_DONE, BOTH)] = lam.clone();
        g
    }

    /// Absorption probabilities over an unbounded constant-rate tail.
    fn tail_limit(&self, piece: usize) -> AdMatrix {
        let lam = self.eta.rate(piece);
        let total = lam + self.rho;
        let mut l = zeros(N_STATES, N_STATES);
        l[(LINKED, JOINT)] = lam / &total;
        l[(LINKED, BOTH)] = self.rho / &total;
        for s in [SPLIT, A_DONE, B_DONE, BOTH] {
            l[(s, BOTH)] = Adouble::one();
        }
        l[(JOINT, JOINT)] = Adouble::one();
        l
    }

    fn adjacent(&self, i: usize) -> Result<AdMatrix> {
        let (x, y) = (self.hidden_states[i], self.hidden_states[i + 1]);
        let mut out = identity(N_STATES);
        for seg in self.eta.segments(x, y) {
            let step = if seg.end.is_infinite() {
                self.tail_limit(seg.piece)
            } else {
                let g = self.generator(seg.piece);
                expm(&g.map(|v| v * (seg.end - seg.start)))?
            };
            out = matmul(&out, &step);
        }
        Ok(out)
    }

    /// Propagator from boundary `i` to boundary `j` (`i <= j`).
    pub fn expm(&mut self, i: usize, j: usize) -> Result<AdMatrix> {
        if i > j || j > self.m {
            return Err(EngineError::invalid_config(format!(
                "propagator ({i}, {j}) out of range for {} hidden states",
                self.m
            )));
        }
        if i == j {
            return Ok(identity(N_STATES));
        }
        if let Some(hit) = self.expm_memo.get(&(i, j)) {
            return Ok(hit.clone());
        }
        let value = if j == i + 1 {
            self.adjacent(i)?
        } else {
            let head = self.expm(i, j - 1)?;
            let last = self.expm(j - 1, j)?;
            matmul(&head, &last)
        };
        self.expm_evaluations += 1;
        self.expm_memo.insert((i, j), value.clone());
        Ok(value)
    }

    pub fn compute(&mut self) -> Result<&AdMatrix> {
        let m = self.m;
        let mut from_zero = Vec::with_capacity(m);
        let mut within = Vec::with_capacity(m);
        for k in 0..m {
            from_zero.push(self.expm(0, k)?);
            within.push(self.expm(k, k + 1)?);
        }

        let mut t = zeros(m, m);
        for i in 0..m {
            let pi_i = &self.eta.survival(self.hidden_states[i])
                - &self.eta.survival(self.hidden_states[i + 1]);
            if !(pi_i.value() > 0.0) {
                return Err(EngineError::NonFinite(format!(
                    "hidden state {i} has no coalescence mass"
                )));
            }
            for j in 0..m {
                let joint = if i == j {
                    let mut acc = Adouble::zero();
                    for s in [LINKED, SPLIT] {
                        let exit = &within[i][(s, BOTH)] + &within[i][(s, JOINT)];
                        acc += &from_zero[i][(LINKED, s)] * &exit;
                    }
                    acc
                } else {
                    let (lo, hi, done) = if i < j { (i, j, A_DONE) } else { (j, i, B_DONE) };
                    let mut enter = Adouble::zero();
                    for s in [LINKED, SPLIT] {
                        enter += &from_zero[lo][(LINKED, s)] * &within[lo][(s, done)];
                    }
                    let wait = self.expm(lo + 1, hi)?;
                    &(&enter * &wait[(done, done)]) * &within[hi][(done, BOTH)]
                };
                t[(i, j)] = &joint / &pi_i;
            }
        }

        if !t.iter().all(Adouble::is_finite) {
            return Err(EngineError::NonFinite(
                "transition matrix contains non-finite entries".to_string(),
            ));
        }
        debug!(
            n_states = m,
            rho = self.rho,
            expm_evaluations = self.expm_evaluations,
            "transition matrix computed"
        );
        Ok(self.matrix.insert(t))
    }

    pub fn matrix(&self) -> Option<&AdMatrix> {
        self.matrix.as_ref()
    }

    /// Writes values (row-major, `M*M`) and derivatives (`M*M*n_free`) into
    /// caller buffers.
    pub fn store_results(&self, values: &mut [f64], derivatives: &mut [f64]) -> Result<()> {
        let t = self
            .matrix
            .as_ref()
            .ok_or_else(|| EngineError::invalid_config("transition matrix not computed"))?;
        let n_free = self.eta.n_free();
        let mm = self.m * self.m;
        if values.len() != mm || derivatives.len() != mm * n_free {
            return Err(EngineError::invalid_config(format!(
                "store_results buffers must hold {} values and {} derivatives, got {} and {}",
                mm,
                mm * n_free,
                values.len(),
                derivatives.len()
            )));
        }
        for (idx, entry) in t.iter().enumerate() {
            values[idx] = entry.value();
            for p in 0..n_free {
                derivatives[idx * n_free + p] = entry.derivative(p);
            }
        }
        Ok(())
    }
}
