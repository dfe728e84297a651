use crate::error::{IoError, Result};

/// Sparse matrix in COO (coordinate/triplet) format.
///
/// This is the interchange format between the solver crate and the file
/// format. Entries keep the order in which they were pushed; duplicates are
/// allowed and left for the consumer to merge.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseTriplets {
    pub nrows: usize,
    pub ncols: usize,
    pub row_indices: Vec<usize>,
    pub col_indices: Vec<usize>,
    pub values: Vec<f64>,
}

impl SparseTriplets {
    /// Creates an empty matrix with the given dimensions.
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            row_indices: Vec::new(),
            col_indices: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Appends one zero-based entry.
    pub fn push(&mut self, row: usize, col: usize, value: f64) {
        self.row_indices.push(row);
        self.col_indices.push(col);
        self.values.push(value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.row_indices
            .iter()
            .zip(&self.col_indices)
            .zip(&self.values)
            .map(|((&r, &c), &v)| (r, c, v))
    }

    /// Checks that the three arrays agree and every index is in range.
    pub fn validate(&self) -> Result<()> {
        if self.row_indices.len() != self.values.len() || self.col_indices.len() != self.values.len()
        {
            return Err(IoError::DimensionMismatch(format!(
                "triplet arrays disagree: {} rows, {} cols, {} values",
                self.row_indices.len(),
                self.col_indices.len(),
                self.values.len()
            )));
        }
        for (r, c, _) in self.iter() {
            if r >= self.nrows || c >= self.ncols {
                return Err(IoError::InvalidData(format!(
                    "entry ({r}, {c}) outside {}x{} matrix",
                    self.nrows, self.ncols
                )));
            }
        }
        Ok(())
    }
}

/// A matrix together with its right-hand side, as stored in one system file.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseSystem {
    pub matrix: SparseTriplets,
    pub rhs: Vec<f64>,
}

impl SparseSystem {
    pub fn new(matrix: SparseTriplets, rhs: Vec<f64>) -> Result<Self> {
        if rhs.len() != matrix.nrows {
            return Err(IoError::DimensionMismatch(format!(
                "rhs has {} entries, matrix has {} rows",
                rhs.len(),
                matrix.nrows
            )));
        }
        matrix.validate()?;
        Ok(Self { matrix, rhs })
    }
}
