//! The inference coordinator.
//!
//! [`InferenceManager`] owns one [`Hmm`] per observed sequence and the matrices
//! they share. Parameter setters only mark [`DirtyFlags`]; the expensive
//! rebuilds happen lazily at the start of [`InferenceManager::e_step`]:
//!
//! | flag set       | rebuilt                                  |
//! |----------------|------------------------------------------|
//! | `eta`          | initial distribution                     |
//! | `rho` or `eta` | transition matrix                        |
//! | `theta` or `eta` | emission matrix and emission probabilities |
//!
//! A flag is cleared only once everything that depends on it has been
//! rebuilt, so a failed rebuild is retried by the next E-step. While `eta`
//! stays set, the steps already rebuilt for the current parameters are
//! remembered and skipped on the retry. The transition
//! builder, and with it the propagator memo, is discarded whenever `rho` or
//! `eta` actually changes.
//!
//! Matrices are written by the caller's thread before dispatch and only read
//! by workers afterwards. Concurrent E-steps on one manager are not supported;
//! `&mut self` enforces that.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ndarray::{Array1, Array2};
use serde::Serialize;
use tracing::{debug, info_span};

use crate::ad::Adouble;
use crate::error::{EngineError, Result};
use crate::expm::AdMatrix;
use crate::hmm::{Hmm, InferenceBundle};
use crate::io::obs::from_raw_buffers;
use crate::pool::WorkerPool;
use crate::rate::{ParameterVector, RateFunction};
use crate::sfs::{BlockKey, EmissionModel};
use crate::transition::TransitionBuilder;

/// Which derived quantities are stale relative to the current parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyFlags {
    pub theta: bool,
    pub rho: bool,
    pub eta: bool,
    // steps already rebuilt for the current eta
    eta_initial_done: bool,
    eta_transition_done: bool,
}

impl DirtyFlags {
    pub fn all() -> Self {
        Self {
            theta: true,
            rho: true,
            eta: true,
            eta_initial_done: false,
            eta_transition_done: false,
        }
    }

    fn mark_eta(&mut self) {
        self.eta = true;
        self.eta_initial_done = false;
        self.eta_transition_done = false;
    }

    pub fn is_clean(&self) -> bool {
        !(self.theta || self.rho || self.eta)
    }

    pub fn needs_initial(&self) -> bool {
        self.eta && !self.eta_initial_done
    }

    pub fn needs_transition(&self) -> bool {
        self.rho || (self.eta && !self.eta_transition_done)
    }

    pub fn needs_emission(&self) -> bool {
        self.theta || self.eta
    }
}

/// How many times each shared quantity has been rebuilt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecomputeCounts {
    pub initial: usize,
    pub transition: usize,
    pub emission: usize,
}

pub struct InferenceManager {
    pool: Arc<WorkerPool>,
    model: EmissionModel,
    hidden_states: Arc<[f64]>,
    hmms: Vec<Arc<Mutex<Hmm>>>,
    targets: BTreeSet<(usize, BlockKey)>,

    theta: f64,
    rho: f64,
    params: Option<ParameterVector>,
    eta: Option<Arc<RateFunction>>,
    transition_builder: Option<TransitionBuilder>,

    bundle: Arc<InferenceBundle>,
    dirty: DirtyFlags,
    counts: RecomputeCounts,
}

fn lock(hmm: &Mutex<Hmm>) -> MutexGuard<'_, Hmm> {
    // An instance only replaces its statistics after a successful E-step,
    // so a panic mid-task leaves it consistent.
    hmm.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_rate(name: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value >= 0.0) {
        return Err(EngineError::invalid_parameters(format!(
            "{name}={value} must be finite and non-negative"
        )));
    }
    Ok(())
}

fn validate_hidden_states(hs: &[f64]) -> Result<()> {
    if hs.len() < 2 {
        return Err(EngineError::invalid_config(format!(
            "need at least two hidden-state boundaries, got {}",
            hs.len()
        )));
    }
    if hs[0] != 0.0 {
        return Err(EngineError::invalid_config(format!(
            "first hidden-state boundary must be 0, got {}",
            hs[0]
        )));
    }
    if hs[hs.len() - 1] != f64::INFINITY {
        return Err(EngineError::invalid_config(
            "last hidden-state boundary must be +infinity",
        ));
    }
    for (i, w) in hs.windows(2).enumerate() {
        if !(w[1] > w[0]) || w[0].is_infinite() {
            return Err(EngineError::invalid_config(format!(
                "hidden-state boundaries must strictly increase (index {i}: {} -> {})",
                w[0], w[1]
            )));
        }
    }
    Ok(())
}

impl InferenceManager {
    /// `observations[i]` holds one row per block: span, then `(a, b, nb)` per
    /// population. `hidden_states` runs from 0 to +infinity.
    pub fn new(
        model: EmissionModel,
        observations: Vec<Array2<i32>>,
        hidden_states: Vec<f64>,
        pool: Arc<WorkerPool>,
    ) -> Result<Self> {
        validate_hidden_states(&hidden_states)?;
        if observations.is_empty() {
            return Err(EngineError::invalid_config("no observation sequences"));
        }
        let n_cols = model.n_cols();
        for (i, obs) in observations.iter().enumerate() {
            if obs.nrows() == 0 {
                return Err(EngineError::invalid_config(format!("sequence {i} is empty")));
            }
            if obs.ncols() != n_cols {
                return Err(EngineError::invalid_config(format!(
                    "sequence {i} has {} columns, expected {} for {} population(s)",
                    obs.ncols(),
                    n_cols,
                    model.npop()
                )));
            }
            for (r, row) in obs.rows().into_iter().enumerate() {
                if row[0] < 1 {
                    return Err(EngineError::invalid_config(format!(
                        "sequence {i} row {r}: span {} must be >= 1",
                        row[0]
                    )));
                }
                let key: Vec<i32> = row.iter().skip(1).copied().collect();
                model.validate_key(&key).map_err(|e| {
                    EngineError::invalid_config(format!("sequence {i} row {r}: {e}"))
                })?;
            }
        }

        let hmms: Vec<Arc<Mutex<Hmm>>> = observations
            .iter()
            .enumerate()
            .map(|(i, obs)| Arc::new(Mutex::new(Hmm::new(i, obs))))
            .collect();
        let m = hidden_states.len() - 1;
        let targets = fill_targets(&hmms, m);
        debug!(
            sequences = hmms.len(),
            hidden_states = m,
            targets = targets.len(),
            "inference manager constructed"
        );

        Ok(Self {
            pool,
            model,
            hidden_states: Arc::from(hidden_states),
            hmms,
            targets,
            theta: 0.0,
            rho: 0.0,
            params: None,
            eta: None,
            transition_builder: None,
            bundle: Arc::new(InferenceBundle::default()),
            dirty: DirtyFlags::all(),
            counts: RecomputeCounts::default(),
        })
    }

    /// Construction from flat row-major buffers, one per sequence, holding
    /// `lengths[i]` rows each.
    pub fn from_raw(
        model: EmissionModel,
        lengths: &[usize],
        buffers: &[&[i32]],
        hidden_states: Vec<f64>,
        pool: Arc<WorkerPool>,
    ) -> Result<Self> {
        let observations = from_raw_buffers(lengths, buffers, model.n_cols())?;
        Self::new(model, observations, hidden_states, pool)
    }

    pub fn n_sequences(&self) -> usize {
        self.hmms.len()
    }

    pub fn n_states(&self) -> usize {
        self.hidden_states.len() - 1
    }

    pub fn npop(&self) -> usize {
        self.model.npop()
    }

    pub fn hidden_states(&self) -> &[f64] {
        &self.hidden_states
    }

    pub fn targets(&self) -> &BTreeSet<(usize, BlockKey)> {
        &self.targets
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn rho(&self) -> f64 {
        self.rho
    }

    pub fn params(&self) -> Option<&ParameterVector> {
        self.params.as_ref()
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    pub fn recompute_counts(&self) -> RecomputeCounts {
        self.counts
    }

    /// Propagators computed by the current transition builder.
    pub fn expm_evaluations(&self) -> usize {
        self.transition_builder
            .as_ref()
            .map(TransitionBuilder::expm_evaluations)
            .unwrap_or(0)
    }

    pub fn set_rho(&mut self, rho: f64) -> Result<()> {
        check_rate("rho", rho)?;
        if rho != self.rho {
            self.rho = rho;
            self.dirty.rho = true;
            self.transition_builder = None;
        }
        Ok(())
    }

    pub fn set_theta(&mut self, theta: f64) -> Result<()> {
        check_rate("theta", theta)?;
        if theta != self.theta {
            self.theta = theta;
            self.dirty.theta = true;
        }
        Ok(())
    }

    pub fn set_params(&mut self, params: &ParameterVector) -> Result<()> {
        let eta = RateFunction::new(params)?;
        self.eta = Some(Arc::new(eta));
        self.params = Some(params.clone());
        self.dirty.mark_eta();
        self.transition_builder = None;
        Ok(())
    }

    /// Two-population variant: replaces the per-state emission tables along
    /// with the parameters.
    pub fn set_params_with_sfs(
        &mut self,
        params: &ParameterVector,
        tables: Vec<Array2<f64>>,
    ) -> Result<()> {
        if tables.len() != self.n_states() {
            return Err(EngineError::invalid_parameters(format!(
                "{} emission tables supplied for {} hidden states",
                tables.len(),
                self.n_states()
            )));
        }
        let eta = RateFunction::new(params)?;
        self.model.set_tables(tables)?;
        self.eta = Some(Arc::new(eta));
        self.params = Some(params.clone());
        self.dirty.mark_eta();
        self.transition_builder = None;
        Ok(())
    }

    fn recompute_initial_distribution(&mut self, eta: &RateFunction) -> Result<()> {
        let hs = &self.hidden_states;
        let pi: Array1<Adouble> = hs
            .windows(2)
            .map(|w| &eta.survival(w[0]) - &eta.survival(w[1]))
            .collect();
        if let Some(k) = pi.iter().position(|p| !(p.value() > 0.0) || !p.is_finite()) {
            return Err(EngineError::NonFinite(format!(
                "initial probability of hidden state {k} is {}",
                pi[k].value()
            )));
        }
        Arc::make_mut(&mut self.bundle).set_pi(pi);
        self.counts.initial += 1;
        Ok(())
    }

    fn recompute_transition(&mut self, eta: &Arc<RateFunction>) -> Result<()> {
        let builder = match self.transition_builder.take() {
            Some(b) => b,
            None => TransitionBuilder::new(
                Arc::clone(eta),
                Arc::clone(&self.hidden_states),
                self.rho,
            )?,
        };
        let builder = self.transition_builder.insert(builder);
        let transition = builder.compute()?.clone();
        Arc::make_mut(&mut self.bundle).set_transition(transition);
        self.counts.transition += 1;
        Ok(())
    }

    fn recompute_emission_probs(&mut self, eta: &RateFunction) -> Result<()> {
        let emission = self
            .model
            .recompute_emission(eta, &self.hidden_states, self.theta)?;
        let probs = self.populate_emission_probs(&emission);
        Arc::make_mut(&mut self.bundle).set_emission(emission, probs);
        self.counts.emission += 1;
        Ok(())
    }

    /// Emission probabilities for the observed `(state, key)` targets only.
    fn populate_emission_probs(&self, emission: &AdMatrix) -> BTreeMap<BlockKey, Array1<Adouble>> {
        let m = self.n_states();
        let mut probs: BTreeMap<BlockKey, Array1<Adouble>> = BTreeMap::new();
        for (k, key) in &self.targets {
            let entry = probs
                .entry(key.clone())
                .or_insert_with(|| Array1::from_elem(m, Adouble::zero()));
            entry[*k] = self.model.emission_prob(emission.row(*k), key);
        }
        probs
    }

    fn do_dirty_work(&mut self) -> Result<()> {
        let eta = self.eta.clone().ok_or(EngineError::ParamsNotSet)?;
        if self.dirty.is_clean() {
            debug!("parameters unchanged; reusing shared matrices");
            return Ok(());
        }
        if self.dirty.needs_initial() {
            self.recompute_initial_distribution(&eta)?;
            self.dirty.eta_initial_done = true;
        }
        if self.dirty.needs_transition() {
            self.recompute_transition(&eta)?;
            self.dirty.rho = false;
            self.dirty.eta_transition_done = self.dirty.eta;
            debug!(
                expm_evaluations = self.expm_evaluations(),
                rho = self.rho,
                "transition recomputed"
            );
        }
        // eta always needs an emission rebuild, so it is only cleared here
        if self.dirty.needs_emission() {
            self.recompute_emission_probs(&eta)?;
            self.dirty.theta = false;
            self.dirty.eta = false;
            debug!(theta = self.theta, keys = self.bundle.emission_probs().len(), "emission recomputed");
        }
        Ok(())
    }

    /// Rebuilds stale matrices, then runs every sequence's forward-backward on
    /// the worker pool and blocks until all of them finished. The first
    /// failure in sequence order is returned; the other sequences still get
    /// fresh statistics.
    pub fn e_step(&mut self, recompute_gamma: bool) -> Result<()> {
        let _span = info_span!("e_step", sequences = self.hmms.len()).entered();
        self.do_dirty_work()?;
        let bundle = Arc::clone(&self.bundle);
        debug!(recompute_gamma, "dispatching forward-backward");
        self.parallel_do(move |hmm| hmm.e_step(&bundle, recompute_gamma))
    }

    /// Applies `f` to every sequence on the pool, for side effects only.
    pub fn parallel_do<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&mut Hmm) -> Result<()> + Send + Sync + 'static,
    {
        self.parallel_select(f).map(|_| ())
    }

    /// Applies `f` to every sequence on the pool; results are in sequence
    /// order regardless of completion order.
    pub fn parallel_select<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(&mut Hmm) -> Result<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut handles = Vec::with_capacity(self.hmms.len());
        let mut first_err = None;
        for hmm in &self.hmms {
            let hmm = Arc::clone(hmm);
            let f = Arc::clone(&f);
            match self.pool.enqueue(move || {
                let mut guard = lock(&hmm);
                (*f)(&mut *guard)
            }) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    first_err = Some(e);
                    break;
                }
            }
        }
        drop(f);

        let mut results = Vec::with_capacity(handles.len());
        let mut task_err = None;
        for handle in handles {
            match handle.wait().and_then(|r| r) {
                Ok(v) => results.push(v),
                Err(e) => {
                    if task_err.is_none() {
                        task_err = Some(e);
                    }
                }
            }
        }
        match task_err.or(first_err) {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// `[initial, transition, emission]` terms of the expected complete-data
    /// log-likelihood, summed over sequences in order.
    pub fn q(&self) -> Result<Vec<Adouble>> {
        let bundle = Arc::clone(&self.bundle);
        let per_sequence = self.parallel_select(move |hmm| hmm.q(&bundle))?;
        let mut total = vec![Adouble::zero(); 3];
        for contribution in &per_sequence {
            for (acc, term) in total.iter_mut().zip(contribution) {
                *acc += term;
            }
        }
        Ok(total)
    }

    pub fn loglik(&self) -> Result<Vec<f64>> {
        self.parallel_select(|hmm| hmm.loglik())
    }

    pub fn pi(&self) -> &Array1<Adouble> {
        self.bundle.pi()
    }

    pub fn transition(&self) -> &AdMatrix {
        self.bundle.transition()
    }

    pub fn emission(&self) -> &AdMatrix {
        self.bundle.emission()
    }

    pub fn emission_probs(&self) -> &BTreeMap<BlockKey, Array1<Adouble>> {
        self.bundle.emission_probs()
    }

    /// Per-sequence xi sums; `None` for sequences without statistics.
    pub fn xisums(&self) -> Vec<Option<Arc<Array2<f64>>>> {
        self.hmms
            .iter()
            .map(|h| lock(h).stats().map(|s| Arc::clone(&s.xisum)))
            .collect()
    }

    /// Per-row posteriors; `None` unless the last E-step saved them.
    pub fn gammas(&self) -> Vec<Option<Arc<Array2<f64>>>> {
        self.hmms
            .iter()
            .map(|h| lock(h).stats().and_then(|s| s.gamma.clone()))
            .collect()
    }

    pub fn gamma_sums(&self) -> Vec<Option<Arc<BTreeMap<BlockKey, Vec<f64>>>>> {
        self.hmms
            .iter()
            .map(|h| lock(h).stats().map(|s| Arc::clone(&s.gamma_sums)))
            .collect()
    }
}

/// Every `(hidden state, block key)` pair the loaded sequences can ask for.
fn fill_targets(hmms: &[Arc<Mutex<Hmm>>], m: usize) -> BTreeSet<(usize, BlockKey)> {
    let mut targets = BTreeSet::new();
    for hmm in hmms {
        let hmm = lock(hmm);
        for key in hmm.keys() {
            for k in 0..m {
                targets.insert((k, key.clone()));
            }
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_flag_dependencies() {
        let mut d = DirtyFlags::all();
        assert!(d.needs_initial() && d.needs_transition() && d.needs_emission());
        d.eta = false;
        d.rho = false;
        assert!(!d.needs_initial());
        assert!(!d.needs_transition());
        assert!(d.needs_emission());
        d.theta = false;
        assert!(d.is_clean());
    }

    #[test]
    fn finished_eta_steps_are_skipped_until_eta_changes() {
        let mut d = DirtyFlags::all();
        d.rho = false;
        d.eta_initial_done = true;
        d.eta_transition_done = true;
        assert!(!d.needs_initial());
        assert!(!d.needs_transition());
        assert!(d.needs_emission());

        d.rho = true;
        assert!(d.needs_transition());
        assert!(!d.needs_initial());

        d.mark_eta();
        assert!(d.needs_initial());
        d.rho = false;
        assert!(d.needs_transition());
    }

    #[test]
    fn rates_must_be_finite_and_non_negative() {
        assert!(check_rate("theta", 0.0).is_ok());
        assert!(check_rate("theta", 1e-3).is_ok());
        assert!(matches!(
            check_rate("theta", -0.01),
            Err(EngineError::InvalidParameters(_))
        ));
        assert!(check_rate("rho", f64::NAN).is_err());
        assert!(check_rate("rho", f64::INFINITY).is_err());
    }

    #[test]
    fn hidden_states_must_span_zero_to_infinity() {
        assert!(validate_hidden_states(&[0.0, 1.0, f64::INFINITY]).is_ok());
        assert!(validate_hidden_states(&[0.0, 1.0]).is_err());
        assert!(validate_hidden_states(&[0.1, f64::INFINITY]).is_err());
        assert!(validate_hidden_states(&[0.0, 2.0, 1.0, f64::INFINITY]).is_err());
        assert!(validate_hidden_states(&[0.0]).is_err());
    }
}
