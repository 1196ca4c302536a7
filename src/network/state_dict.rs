use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::math::matrix::Matrix;

/// A named parameter tensor as it appears on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: [usize; 2],
    pub data: Vec<f64>,
}

impl Tensor {
    pub fn from_matrix(m: &Matrix) -> Tensor {
        Tensor { shape: m.shape(), data: m.to_flat() }
    }

    /// `None` when `data` does not fill `shape`.
    pub fn to_matrix(&self) -> Option<Matrix> {
        Matrix::from_flat(self.shape[0], self.shape[1], &self.data)
    }
}

/// Parameter name → tensor, ordered so serialized files are stable.
pub type StateDict = BTreeMap<String, Tensor>;
