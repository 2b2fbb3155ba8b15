pub fn binomial(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    let mut out = 1.0;
    for i in 0..k {
        out = out * (n - i) as f64 / (i + 1) as f64;
    }
    out
}

/// P(b derived among `nb` drawn | `total_derived` derived among `n`).
pub fn hypergeometric(b: usize, nb: usize, total_derived: usize, n: usize) -> f64 {
    if nb > n || b > nb || b > total_derived || nb - b > n - total_derived {
        return 0.0;
    }
    binomial(total_derived, b) * binomial(n - total_derived, nb - b) / binomial(n, nb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hypergeometric_sums_to_one() {
        let total: f64 = (0..=3).map(|b| hypergeometric(b, 3, 4, 10)).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert_eq!(hypergeometric(2, 2, 2, 2), 1.0);
        assert_eq!(hypergeometric(1, 2, 0, 5), 0.0);
    }

    #[test]
    fn binomial_small_values() {
        assert_eq!(binomial(5, 2), 10.0);
        assert_eq!(binomial(4, 0), 1.0);
        assert_eq!(binomial(3, 4), 0.0);
    }
}
