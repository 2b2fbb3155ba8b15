//! Piecewise-constant coalescence rate function.
//!
//! Piece `k` has relative population size `a[k]`, hence coalescence rate
//! `1 / a[k]`, and starts at `s[0] + .. + s[k-1]`. The last piece is unbounded.
//! Every derived quantity is an [`Adouble`] differentiated with respect to the
//! sizes `a`.

use serde::{Deserialize, Serialize};

use crate::ad::Adouble;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterVector {
    pub a: Vec<f64>,
    pub s: Vec<f64>,
}

impl ParameterVector {
    pub fn new(a: Vec<f64>, s: Vec<f64>) -> Self {
        Self { a, s }
    }

    /// A single unbounded piece of size `a`.
    pub fn constant(a: f64) -> Self {
        Self {
            a: vec![a],
            s: vec![1.0],
        }
    }

    pub fn n_free(&self) -> usize {
        self.a.len()
    }
}

/// A constant-rate stretch `[start, end)` of piece `piece`; `end` may be infinite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub piece: usize,
}

#[derive(Debug, Clone)]
pub struct RateFunction {
    starts: Vec<f64>,
    rates: Vec<Adouble>,
    // cumulative hazard at each piece start
    hazard_at_start: Vec<Adouble>,
    n_free: usize,
}

impl RateFunction {
    pub fn new(params: &ParameterVector) -> Result<Self> {
        let k = params.a.len();
        if k == 0 {
            return Err(EngineError::invalid_parameters("parameter vector is empty"));
        }
        if params.s.len() != k {
            return Err(EngineError::invalid_parameters(format!(
                "size vector has {} pieces but span vector has {}",
                k,
                params.s.len()
            )));
        }
        for (i, (&a, &s)) in params.a.iter().zip(params.s.iter()).enumerate() {
            if !(a.is_finite() && a > 0.0) {
                return Err(EngineError::invalid_parameters(format!(
                    "size a[{i}]={a} must be finite and positive"
                )));
            }
            if !(s.is_finite() && s > 0.0) {
                return Err(EngineError::invalid_parameters(format!(
                    "span s[{i}]={s} must be finite and positive"
                )));
            }
        }

        let rates: Vec<Adouble> = params
            .a
            .iter()
            .enumerate()
            .map(|(i, &a)| Adouble::variable(a, i, k).recip())
            .collect();

        let mut starts = Vec::with_capacity(k);
        let mut hazard_at_start = Vec::with_capacity(k);
        let mut t = 0.0;
        let mut hazard = Adouble::zero();
        for i in 0..k {
            starts.push(t);
            hazard_at_start.push(hazard.clone());
            hazard += &rates[i] * params.s[i];
            t += params.s[i];
        }

        Ok(Self {
            starts,
            rates,
            hazard_at_start,
            n_free: k,
        })
    }

    pub fn n_free(&self) -> usize {
        self.n_free
    }

    pub fn n_pieces(&self) -> usize {
        self.rates.len()
    }

    pub fn rate(&self, piece: usize) -> &Adouble {
        &self.rates[piece]
    }

    pub fn piece_at(&self, t: f64) -> usize {
        self.starts.partition_point(|&s| s <= t).saturating_sub(1)
    }

    /// Cumulative hazard R(t) for finite `t`.
    pub fn hazard(&self, t: f64) -> Adouble {
        let k = self.piece_at(t);
        &self.hazard_at_start[k] + &(&self.rates[k] * (t - self.starts[k]))
    }

    /// P(T > t) = exp(-R(t)); zero at infinity.
    pub fn survival(&self, t: f64) -> Adouble {
        if t.is_infinite() {
            return Adouble::zero();
        }
        (-self.hazard(t)).exp()
    }

    /// Constant-rate segments covering `[x, y)`.
    pub fn segments(&self, x: f64, y: f64) -> Vec<Segment> {
        let mut out = Vec::new();
        if !(y > x) {
            return out;
        }
        let mut start = x;
        let mut piece = self.piece_at(x);
        loop {
            let piece_end = self.starts.get(piece + 1).copied().unwrap_or(f64::INFINITY);
            let end = piece_end.min(y);
            out.push(Segment { start, end, piece });
            if end >= y {
                break;
            }
            start = end;
            piece += 1;
        }
        out
    }

    /// E[T | x <= T < y] under the coalescent with this rate function.
    pub fn mean_coalescence_time(&self, x: f64, y: f64) -> Result<Adouble> {
        let mass = &self.survival(x) - &self.survival(y);
        if !(mass.value() > 0.0) {
            return Err(EngineError::NonFinite(format!(
                "no coalescence mass in [{x}, {y})"
            )));
        }
        let mut moment = Adouble::zero();
        for seg in self.segments(x, y) {
            let lam = &self.rates[seg.piece];
            let inv = lam.recip();
            let s0 = self.survival(seg.start);
            let head = &inv + seg.start;
            let part = if seg.end.is_infinite() {
                &s0 * &head
            } else {
                let decay = (-(lam * (seg.end - seg.start))).exp();
                let tail = &(&inv + seg.end) * &decay;
                &s0 * &(&head - &tail)
            };
            moment += part;
        }
        Ok(&moment / &mass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_size_matches_exponential() {
        let eta = RateFunction::new(&ParameterVector::constant(2.0)).unwrap();
        let s = eta.survival(1.0);
        assert!((s.value() - (-0.5f64).exp()).abs() < 1e-14);
        // dS/da = S * t / a^2
        assert!((s.derivative(0) - (-0.5f64).exp() * 0.25).abs() < 1e-14);
        let mean = eta.mean_coalescence_time(0.0, f64::INFINITY).unwrap();
        assert!((mean.value() - 2.0).abs() < 1e-12);
        assert!((mean.derivative(0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn segments_split_at_piece_boundaries() {
        let eta = RateFunction::new(&ParameterVector::new(vec![1.0, 2.0, 3.0], vec![0.5, 1.0, 1.0]))
            .unwrap();
        let segs = eta.segments(0.25, 2.0);
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0], Segment { start: 0.25, end: 0.5, piece: 0 });
        assert_eq!(segs[1], Segment { start: 0.5, end: 1.5, piece: 1 });
        assert_eq!(segs[2], Segment { start: 1.5, end: 2.0, piece: 2 });
        let tail = eta.segments(1.0, f64::INFINITY);
        assert_eq!(tail.last().unwrap().end, f64::INFINITY);
        assert!((eta.hazard(1.5).value() - (0.5 + 0.5)).abs() < 1e-14);
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(RateFunction::new(&ParameterVector::new(vec![], vec![])).is_err());
        assert!(RateFunction::new(&ParameterVector::new(vec![1.0, -1.0], vec![1.0, 1.0])).is_err());
        assert!(RateFunction::new(&ParameterVector::new(vec![1.0], vec![1.0, 2.0])).is_err());
    }
}
