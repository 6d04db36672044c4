//! Scalar kernels.
//!
//! The engine never implements arithmetic itself; it schedules a
//! [`ScalarKernels`] provider. Every method works on plain slices so the same
//! provider serves both the in-thread Scalar strategy and the per-chunk work
//! of the Parallel strategy.

use ace_wasm::BinaryOp;
use std::ops::Range;

/// Single-thread implementations of the numeric kernels.
///
/// Implementations must be pure: the parallel path calls them concurrently
/// on disjoint output slices.
pub trait ScalarKernels: Send + Sync + 'static {
    /// Sum of `x`.
    fn sum(&self, x: &[f64]) -> f64;

    /// Inner product of `x` and `y`, which have equal length.
    fn dot(&self, x: &[f64], y: &[f64]) -> f64;

    /// `out[i] = a[i] op b[i]`.
    fn binary(&self, op: BinaryOp, a: &[f64], b: &[f64], out: &mut [f64]);

    /// `out[i] = a[i] * s`.
    fn scale(&self, a: &[f64], s: f64, out: &mut [f64]);

    /// Rows `rows` of the row-major product of `a` (`m x k`) and `b`
    /// (`k x n`), written to `out`, which holds exactly those rows.
    fn matmul_rows(
        &self,
        a: &[f64],
        b: &[f64],
        k: usize,
        n: usize,
        rows: Range<usize>,
        out: &mut [f64],
    );

    /// Rows `rows` of the transpose of row-major `a` (`src_rows x src_cols`),
    /// written to `out`, which holds exactly those result rows.
    fn transpose_rows(
        &self,
        a: &[f64],
        src_rows: usize,
        src_cols: usize,
        rows: Range<usize>,
        out: &mut [f64],
    );
}

/// Straightforward loops over slices.
#[derive(Debug, Clone, Copy, Default)]
pub struct PureScalar;

impl ScalarKernels for PureScalar {
    fn sum(&self, x: &[f64]) -> f64 {
        x.iter().sum()
    }

    fn dot(&self, x: &[f64], y: &[f64]) -> f64 {
        x.iter().zip(y).map(|(a, b)| a * b).sum()
    }

    fn binary(&self, op: BinaryOp, a: &[f64], b: &[f64], out: &mut [f64]) {
        let f: fn(f64, f64) -> f64 = match op {
            BinaryOp::Add => |x, y| x + y,
            BinaryOp::Sub => |x, y| x - y,
            BinaryOp::Mul => |x, y| x * y,
        };
        for ((o, x), y) in out.iter_mut().zip(a).zip(b) {
            *o = f(*x, *y);
        }
    }

    fn scale(&self, a: &[f64], s: f64, out: &mut [f64]) {
        for (o, x) in out.iter_mut().zip(a) {
            *o = x * s;
        }
    }

    fn matmul_rows(
        &self,
        a: &[f64],
        b: &[f64],
        k: usize,
        n: usize,
        rows: Range<usize>,
        out: &mut [f64],
    ) {
        for (local, i) in rows.enumerate() {
            let a_row = &a[i * k..(i + 1) * k];
            let out_row = &mut out[local * n..(local + 1) * n];
            for (j, cell) in out_row.iter_mut().enumerate() {
                let mut acc = 0.0;
                for (p, a_ip) in a_row.iter().enumerate() {
                    acc += a_ip * b[p * n + j];
                }
                *cell = acc;
            }
        }
    }

    fn transpose_rows(
        &self,
        a: &[f64],
        src_rows: usize,
        src_cols: usize,
        rows: Range<usize>,
        out: &mut [f64],
    ) {
        for (local, j) in rows.enumerate() {
            debug_assert!(j < src_cols);
            let out_row = &mut out[local * src_rows..(local + 1) * src_rows];
            for (i, cell) in out_row.iter_mut().enumerate() {
                *cell = a[i * src_cols + j];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_2x2() {
        let mut out = vec![0.0; 4];
        PureScalar.matmul_rows(&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0], 2, 2, 0..2, &mut out);
        assert_eq!(out, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_row_subset() {
        let mut out = vec![0.0; 2];
        PureScalar.matmul_rows(&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0], 2, 2, 1..2, &mut out);
        assert_eq!(out, vec![43.0, 50.0]);
    }

    #[test]
    fn test_matmul_rectangular() {
        // [1 2 3] x [1; 2; 3] = [14]
        let mut out = vec![0.0; 1];
        PureScalar.matmul_rows(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0], 3, 1, 0..1, &mut out);
        assert_eq!(out, vec![14.0]);
    }

    #[test]
    fn test_transpose_rows() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut out = vec![0.0; 6];
        PureScalar.transpose_rows(&a, 2, 3, 0..3, &mut out);
        assert_eq!(out, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

        let mut tail = vec![0.0; 2];
        PureScalar.transpose_rows(&a, 2, 3, 2..3, &mut tail);
        assert_eq!(tail, vec![3.0, 6.0]);
    }

    #[test]
    fn test_binary_and_scale() {
        let mut out = vec![0.0; 3];
        PureScalar.binary(BinaryOp::Sub, &[3.0, 2.0, 1.0], &[1.0, 1.0, 1.0], &mut out);
        assert_eq!(out, vec![2.0, 1.0, 0.0]);
        PureScalar.scale(&[1.0, -2.0, 0.5], 2.0, &mut out);
        assert_eq!(out, vec![2.0, -4.0, 1.0]);
    }

    #[test]
    fn test_sum_and_dot() {
        assert_eq!(PureScalar.sum(&[]), 0.0);
        assert_eq!(PureScalar.dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
    }
}
