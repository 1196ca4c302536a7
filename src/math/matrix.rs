use rand::Rng;
use serde::{Serialize, Deserialize};
use std::f64::consts::PI;
use std::ops::{Add, Sub, Mul};

/// Row-major dense matrix. A batch of activations is `batch × features`;
/// a weight matrix is `fan_in × fan_out`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<Vec<f64>>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Matrix {
        Matrix {
            rows,
            cols,
            data: vec![vec![0.0; cols]; rows],
        }
    }

    /// Samples a single value from N(0, 1) using the Box-Muller transform.
    fn sample_standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
        // (0, 1] on both draws keeps ln() finite.
        let u1: f64 = 1.0 - rng.gen::<f64>();
        let u2: f64 = 1.0 - rng.gen::<f64>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }

    fn normal<R: Rng + ?Sized>(rows: usize, cols: usize, std_dev: f64, rng: &mut R) -> Matrix {
        let mut res = Matrix::zeros(rows, cols);
        for row in res.data.iter_mut() {
            for x in row.iter_mut() {
                *x = Matrix::sample_standard_normal(rng) * std_dev;
            }
        }
        res
    }

    /// He initialization for a `fan_in × fan_out` weight matrix:
    /// N(0, sqrt(2 / fan_in)). Suited to rectifier-like activations.
    pub fn he<R: Rng + ?Sized>(fan_in: usize, fan_out: usize, rng: &mut R) -> Matrix {
        Matrix::normal(fan_in, fan_out, (2.0 / fan_in.max(1) as f64).sqrt(), rng)
    }

    /// Xavier (Glorot) initialization: N(0, sqrt(1 / fan_in)).
    pub fn xavier<R: Rng + ?Sized>(fan_in: usize, fan_out: usize, rng: &mut R) -> Matrix {
        Matrix::normal(fan_in, fan_out, (1.0 / fan_in.max(1) as f64).sqrt(), rng)
    }

    /// Builds a matrix from rows. An empty `data` yields a 0×0 matrix.
    pub fn from_data(data: Vec<Vec<f64>>) -> Matrix {
        Matrix {
            rows: data.len(),
            cols: data.first().map_or(0, |row| row.len()),
            data,
        }
    }

    /// Builds a `rows × cols` matrix from a row-major flat buffer.
    /// Returns `None` when the buffer length does not match the shape.
    pub fn from_flat(rows: usize, cols: usize, flat: &[f64]) -> Option<Matrix> {
        if flat.len() != rows * cols {
            return None;
        }
        let data = if cols == 0 {
            vec![Vec::new(); rows]
        } else {
            flat.chunks(cols).map(|chunk| chunk.to_vec()).collect()
        };
        Some(Matrix { rows, cols, data })
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_flat(&self) -> Vec<f64> {
        self.data.iter().flatten().copied().collect()
    }

    /// Overwrites every element from a row-major flat slice of length `len()`.
    pub fn copy_from_flat(&mut self, flat: &[f64]) {
        assert_eq!(flat.len(), self.len(), "flat buffer does not match matrix shape");
        for (row, chunk) in self.data.iter_mut().zip(flat.chunks(self.cols.max(1))) {
            row.copy_from_slice(chunk);
        }
    }

    pub fn transpose(&self) -> Matrix {
        let mut res = Matrix::zeros(self.cols, self.rows);

        for i in 0..res.rows {
            for j in 0..res.cols {
                res.data[i][j] = self.data[j][i];
            }
        }

        res
    }

    pub fn map<F>(&self, functor: F) -> Matrix
    where
        F: Fn(f64) -> f64,
    {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter()
                .map(|row| row.iter().map(|&x| functor(x)).collect())
                .collect(),
        }
    }

    pub fn map_in_place<F>(&mut self, functor: F)
    where
        F: Fn(f64) -> f64,
    {
        for x in self.data.iter_mut().flatten() {
            *x = functor(*x);
        }
    }

    /// Matrix product without consuming either operand.
    pub fn matmul(&self, rhs: &Matrix) -> Matrix {
        assert_eq!(self.cols, rhs.rows, "Matrices are of incorrect sizes");

        let mut res = Matrix::zeros(self.rows, rhs.cols);
        for (out_row, lhs_row) in res.data.iter_mut().zip(self.data.iter()) {
            for (k, &a) in lhs_row.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                for (out, &b) in out_row.iter_mut().zip(rhs.data[k].iter()) {
                    *out += a * b;
                }
            }
        }
        res
    }

    /// Adds a `1 × cols` row vector to every row (bias broadcast).
    pub fn add_row(&self, row: &Matrix) -> Matrix {
        assert_eq!(row.rows, 1);
        assert_eq!(row.cols, self.cols, "Matrices are of incorrect sizes");
        let mut res = self.clone();
        for r in res.data.iter_mut() {
            for (x, &b) in r.iter_mut().zip(row.data[0].iter()) {
                *x += b;
            }
        }
        res
    }

    /// Column sums as a `1 × cols` matrix.
    pub fn sum_rows(&self) -> Matrix {
        let mut res = Matrix::zeros(1, self.cols);
        for row in &self.data {
            for (acc, &x) in res.data[0].iter_mut().zip(row.iter()) {
                *acc += x;
            }
        }
        res
    }

    /// Element-wise (Hadamard) product of two same-shape matrices.
    pub fn hadamard(&self, other: &Matrix) -> Matrix {
        assert_eq!(self.shape(), other.shape(), "Matrices are of incorrect sizes");
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().zip(other.data.iter())
                .map(|(a, b)| a.iter().zip(b.iter()).map(|(x, y)| x * y).collect())
                .collect(),
        }
    }

    /// `self += alpha * other`, in place.
    pub fn add_scaled(&mut self, other: &Matrix, alpha: f64) {
        assert_eq!(self.shape(), other.shape(), "Matrices are of incorrect sizes");
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            for (x, &y) in a.iter_mut().zip(b.iter()) {
                *x += alpha * y;
            }
        }
    }

    pub fn scale(&mut self, factor: f64) {
        self.map_in_place(|x| x * factor);
    }

    pub fn fill(&mut self, value: f64) {
        self.map_in_place(|_| value);
    }

    pub fn sum_of_squares(&self) -> f64 {
        self.data.iter().flatten().map(|x| x * x).sum()
    }

    pub fn all_finite(&self) -> bool {
        self.data.iter().flatten().all(|x| x.is_finite())
    }

    pub fn max_abs(&self) -> f64 {
        self.data.iter().flatten().fold(0.0f64, |m, x| m.max(x.abs()))
    }
}

impl Default for Matrix {
    fn default() -> Self {
        Matrix { rows: 0, cols: 0, data: vec![] }
    }
}

impl Add for Matrix {
    type Output = Matrix;

    fn add(mut self, rhs: Self) -> Self::Output {
        self.add_scaled(&rhs, 1.0);
        self
    }
}

impl Sub for Matrix {
    type Output = Matrix;

    fn sub(mut self, rhs: Self) -> Self::Output {
        self.add_scaled(&rhs, -1.0);
        self
    }
}

impl Mul for Matrix {
    type Output = Matrix;

    fn mul(self, rhs: Self) -> Self::Output {
        self.matmul(&rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn matmul_and_broadcast() {
        let a = Matrix::from_data(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        let b = Matrix::from_data(vec![vec![1.0, 0.0, 1.0], vec![0.0, 1.0, 1.0]]);
        let c = a * b;
        assert_eq!(c.data, vec![vec![1.0, 2.0, 3.0], vec![3.0, 4.0, 7.0]]);

        let bias = Matrix::from_data(vec![vec![1.0, 1.0, -1.0]]);
        let d = c.add_row(&bias);
        assert_eq!(d.data, vec![vec![2.0, 3.0, 2.0], vec![4.0, 5.0, 6.0]]);
        assert_eq!(d.sum_rows().data, vec![vec![6.0, 8.0, 8.0]]);
    }

    #[test]
    fn flat_round_trip_rejects_bad_length() {
        let m = Matrix::from_flat(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(m.data[1], vec![4.0, 5.0, 6.0]);
        assert_eq!(m.to_flat().len(), 6);
        assert!(Matrix::from_flat(2, 3, &[1.0]).is_none());
    }

    #[test]
    fn seeded_init_is_reproducible() {
        let a = Matrix::he(4, 3, &mut StdRng::seed_from_u64(7));
        let b = Matrix::he(4, 3, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert!(a.all_finite());
    }

    #[test]
    fn norms_and_finiteness() {
        let mut m = Matrix::from_data(vec![vec![3.0, -4.0]]);
        assert_eq!(m.sum_of_squares(), 25.0);
        assert_eq!(m.max_abs(), 4.0);
        m.data[0][0] = f64::NAN;
        assert!(!m.all_finite());
    }
}
