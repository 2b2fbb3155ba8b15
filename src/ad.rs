//! Forward-mode automatic differentiation.
//!
//! An [`Adouble`] carries a value and its gradient with respect to the free
//! model parameters. An empty gradient stands for a constant, so plain numbers
//! (rho, theta, supplied SFS tables) mix with parameter-dependent quantities
//! without allocating zero vectors.

use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Adouble {
    value: f64,
    grad: Vec<f64>,
}

impl Adouble {
    pub fn constant(value: f64) -> Self {
        Self {
            value,
            grad: Vec::new(),
        }
    }

    /// Independent variable `index` out of `n` free parameters.
    pub fn variable(value: f64, index: usize, n: usize) -> Self {
        let mut grad = vec![0.0; n];
        if index < n {
            grad[index] = 1.0;
        }
        Self { value, grad }
    }

    pub fn from_parts(value: f64, grad: Vec<f64>) -> Self {
        Self { value, grad }
    }

    pub fn zero() -> Self {
        Self::constant(0.0)
    }

    pub fn one() -> Self {
        Self::constant(1.0)
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn grad(&self) -> &[f64] {
        &self.grad
    }

    pub fn derivative(&self, index: usize) -> f64 {
        self.grad.get(index).copied().unwrap_or(0.0)
    }

    pub fn n_derivatives(&self) -> usize {
        self.grad.len()
    }

    pub fn is_constant(&self) -> bool {
        self.grad.iter().all(|d| *d == 0.0)
    }

    pub fn is_finite(&self) -> bool {
        self.value.is_finite() && self.grad.iter().all(|d| d.is_finite())
    }

    /// f(self) where f(x) = `value` and f'(x) = `slope`.
    fn chain(&self, value: f64, slope: f64) -> Self {
        Self {
            value,
            grad: self.grad.iter().map(|d| d * slope).collect(),
        }
    }

    pub fn exp(&self) -> Self {
        let v = self.value.exp();
        self.chain(v, v)
    }

    pub fn ln(&self) -> Self {
        self.chain(self.value.ln(), 1.0 / self.value)
    }

    pub fn recip(&self) -> Self {
        let v = 1.0 / self.value;
        self.chain(v, -v * v)
    }

    pub fn powi(&self, n: i32) -> Self {
        let v = self.value.powi(n);
        let slope = if n == 0 {
            0.0
        } else {
            n as f64 * self.value.powi(n - 1)
        };
        self.chain(v, slope)
    }

    pub fn sqrt(&self) -> Self {
        let v = self.value.sqrt();
        self.chain(v, 0.5 / v)
    }

    pub fn abs(&self) -> Self {
        if self.value < 0.0 { -self } else { self.clone() }
    }
}

/// `ca * a + cb * b`, treating missing trailing entries as zero.
fn combine(a: &[f64], ca: f64, b: &[f64], cb: f64) -> Vec<f64> {
    let n = a.len().max(b.len());
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let x = a.get(i).copied().unwrap_or(0.0);
        let y = b.get(i).copied().unwrap_or(0.0);
        out.push(ca * x + cb * y);
    }
    out
}

impl From<f64> for Adouble {
    fn from(value: f64) -> Self {
        Self::constant(value)
    }
}

impl Add<&Adouble> for &Adouble {
    type Output = Adouble;
    fn add(self, rhs: &Adouble) -> Adouble {
        Adouble {
            value: self.value + rhs.value,
            grad: combine(&self.grad, 1.0, &rhs.grad, 1.0),
        }
    }
}

impl Sub<&Adouble> for &Adouble {
    type Output = Adouble;
    fn sub(self, rhs: &Adouble) -> Adouble {
        Adouble {
            value: self.value - rhs.value,
            grad: combine(&self.grad, 1.0, &rhs.grad, -1.0),
        }
    }
}

impl Mul<&Adouble> for &Adouble {
    type Output = Adouble;
    fn mul(self, rhs: &Adouble) -> Adouble {
        Adouble {
            value: self.value * rhs.value,
            grad: combine(&self.grad, rhs.value, &rhs.grad, self.value),
        }
    }
}

impl Div<&Adouble> for &Adouble {
    type Output = Adouble;
    fn div(self, rhs: &Adouble) -> Adouble {
        let inv = 1.0 / rhs.value;
        Adouble {
            value: self.value * inv,
            grad: combine(&self.grad, inv, &rhs.grad, -self.value * inv * inv),
        }
    }
}

impl Add<f64> for &Adouble {
    type Output = Adouble;
    fn add(self, rhs: f64) -> Adouble {
        Adouble {
            value: self.value + rhs,
            grad: self.grad.clone(),
        }
    }
}

impl Sub<f64> for &Adouble {
    type Output = Adouble;
    fn sub(self, rhs: f64) -> Adouble {
        Adouble {
            value: self.value - rhs,
            grad: self.grad.clone(),
        }
    }
}

impl Mul<f64> for &Adouble {
    type Output = Adouble;
    fn mul(self, rhs: f64) -> Adouble {
        self.chain(self.value * rhs, rhs)
    }
}

impl Div<f64> for &Adouble {
    type Output = Adouble;
    fn div(self, rhs: f64) -> Adouble {
        self.chain(self.value / rhs, 1.0 / rhs)
    }
}

impl Add<&Adouble> for f64 {
    type Output = Adouble;
    fn add(self, rhs: &Adouble) -> Adouble {
        rhs + self
    }
}

impl Sub<&Adouble> for f64 {
    type Output = Adouble;
    fn sub(self, rhs: &Adouble) -> Adouble {
        rhs.chain(self - rhs.value, -1.0)
    }
}

impl Mul<&Adouble> for f64 {
    type Output = Adouble;
    fn mul(self, rhs: &Adouble) -> Adouble {
        rhs * self
    }
}

impl Div<&Adouble> for f64 {
    type Output = Adouble;
    fn div(self, rhs: &Adouble) -> Adouble {
        let v = self / rhs.value;
        rhs.chain(v, -v / rhs.value)
    }
}

macro_rules! forward_binop {
    ($imp:ident, $method:ident) => {
        impl $imp<Adouble> for Adouble {
            type Output = Adouble;
            fn $method(self, rhs: Adouble) -> Adouble {
                $imp::$method(&self, &rhs)
            }
        }

        impl $imp<&Adouble> for Adouble {
            type Output = Adouble;
            fn $method(self, rhs: &Adouble) -> Adouble {
                $imp::$method(&self, rhs)
            }
        }

        impl $imp<Adouble> for &Adouble {
            type Output = Adouble;
            fn $method(self, rhs: Adouble) -> Adouble {
                $imp::$method(self, &rhs)
            }
        }

        impl $imp<f64> for Adouble {
            type Output = Adouble;
            fn $method(self, rhs: f64) -> Adouble {
                $imp::$method(&self, rhs)
            }
        }

        impl $imp<Adouble> for f64 {
            type Output = Adouble;
            fn $method(self, rhs: Adouble) -> Adouble {
                $imp::$method(self, &rhs)
            }
        }
    };
}

forward_binop!(Add, add);
forward_binop!(Sub, sub);
forward_binop!(Mul, mul);
forward_binop!(Div, div);

impl Neg for &Adouble {
    type Output = Adouble;
    fn neg(self) -> Adouble {
        self.chain(-self.value, -1.0)
    }
}

impl Neg for Adouble {
    type Output = Adouble;
    fn neg(self) -> Adouble {
        -&self
    }
}

impl AddAssign<&Adouble> for Adouble {
    fn add_assign(&mut self, rhs: &Adouble) {
        *self = &*self + rhs;
    }
}

impl AddAssign<Adouble> for Adouble {
    fn add_assign(&mut self, rhs: Adouble) {
        *self = &*self + &rhs;
    }
}

impl SubAssign<&Adouble> for Adouble {
    fn sub_assign(&mut self, rhs: &Adouble) {
        *self = &*self - rhs;
    }
}

impl MulAssign<&Adouble> for Adouble {
    fn mul_assign(&mut self, rhs: &Adouble) {
        *self = &*self * rhs;
    }
}

impl MulAssign<f64> for Adouble {
    fn mul_assign(&mut self, rhs: f64) {
        *self = &*self * rhs;
    }
}

impl Sum for Adouble {
    fn sum<I: Iterator<Item = Adouble>>(iter: I) -> Self {
        iter.fold(Adouble::zero(), |acc, x| acc + x)
    }
}

impl<'a> Sum<&'a Adouble> for Adouble {
    fn sum<I: Iterator<Item = &'a Adouble>>(iter: I) -> Self {
        iter.fold(Adouble::zero(), |acc, x| acc + x)
    }
}
