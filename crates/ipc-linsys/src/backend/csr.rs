//! Block CSR helpers used while building the multigrid hierarchy.

use nalgebra::DMatrix;
use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;

use super::traits::BackendError;
use crate::value_type::BlockValue;

/// Diagonal block of every row (zero where the row stores none).
pub fn diagonal<V: BlockValue>(a: &CsrMatrix<V>) -> Vec<V> {
    (0..a.nrows())
        .map(|i| {
            let row = a.row(i);
            row.col_indices()
                .binary_search(&i)
                .map(|k| row.values()[k])
                .unwrap_or_else(|_| V::zero())
        })
        .collect()
}

/// Builds a CSR matrix from per-row entry lists. Entries within a row may
/// arrive in any order and with repeated columns; repeats are summed.
pub fn assemble_rows<V: BlockValue>(
    ncols: usize,
    rows: Vec<Vec<(usize, V)>>,
) -> Result<CsrMatrix<V>, BackendError> {
    let nrows = rows.len();
    let mut offsets = Vec::with_capacity(nrows + 1);
    let mut cols = Vec::new();
    let mut vals = Vec::new();
    offsets.push(0);
    for mut row in rows {
        row.sort_unstable_by_key(|&(c, _)| c);
        let mut last = None;
        for (c, v) in row {
            if last == Some(c) {
                if let Some(acc) = vals.last_mut() {
                    *acc += v;
                }
            } else {
                cols.push(c);
                vals.push(v);
                last = Some(c);
            }
        }
        offsets.push(cols.len());
    }
    CsrMatrix::try_from_csr_data(nrows, ncols, offsets, cols, vals)
        .map_err(|e| BackendError(format!("invalid sparse structure: {e}")))
}

/// Block transpose: entry `(i, j)` moves to `(j, i)` and is itself transposed.
pub fn transpose<V: BlockValue>(a: &CsrMatrix<V>) -> Result<CsrMatrix<V>, BackendError> {
    let mut rows: Vec<Vec<(usize, V)>> = vec![Vec::new(); a.ncols()];
    for i in 0..a.nrows() {
        let row = a.row(i);
        for (&j, v) in row.col_indices().iter().zip(row.values()) {
            rows[j].push((i, v.transposed()));
        }
    }
    assemble_rows(a.nrows(), rows)
}

/// Sparse product `A B`, one rayon task per output row.
pub fn product<V: BlockValue>(
    a: &CsrMatrix<V>,
    b: &CsrMatrix<V>,
) -> Result<CsrMatrix<V>, BackendError> {
    if a.ncols() != b.nrows() {
        return Err(BackendError(format!(
            "product of {}x{} and {}x{} matrices",
            a.nrows(),
            a.ncols(),
            b.nrows(),
            b.ncols()
        )));
    }
    let rows: Vec<Vec<(usize, V)>> = (0..a.nrows())
        .into_par_iter()
        .map(|i| {
            let row = a.row(i);
            let mut out = Vec::new();
            for (&k, a_ik) in row.col_indices().iter().zip(row.values()) {
                let brow = b.row(k);
                for (&j, b_kj) in brow.col_indices().iter().zip(brow.values()) {
                    out.push((j, a_ik.mul_block(b_kj)));
                }
            }
            out
        })
        .collect();
    assemble_rows(b.ncols(), rows)
}

/// Expands a block matrix into a dense scalar matrix.
pub fn to_dense<V: BlockValue>(a: &CsrMatrix<V>) -> DMatrix<f64> {
    let b = V::BLOCK;
    let mut dense = DMatrix::zeros(a.nrows() * b, a.ncols() * b);
    for i in 0..a.nrows() {
        let row = a.row(i);
        for (&j, v) in row.col_indices().iter().zip(row.values()) {
            for r in 0..b {
                for c in 0..b {
                    dense[(i * b + r, j * b + c)] += v.entry(r, c);
                }
            }
        }
    }
    dense
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix2;

    #[test]
    fn assemble_rows_merges_repeated_columns() {
        let a = assemble_rows(3, vec![vec![(2, 1.0), (0, 2.0), (2, 3.0)], vec![]])
            .expect("valid rows");
        assert_eq!(a.nrows(), 2);
        assert_eq!(a.row(0).col_indices(), &[0, 2]);
        assert_eq!(a.row(0).values(), &[2.0, 4.0]);
        assert_eq!(a.row(1).nnz(), 0);
    }

    #[test]
    fn transpose_moves_and_transposes_blocks() {
        let block = Matrix2::new(1.0, 2.0, 3.0, 4.0);
        let a = assemble_rows(2, vec![vec![(1, block)], vec![]]).expect("valid rows");
        let t = transpose(&a).expect("transpose");
        assert_eq!(t.row(0).nnz(), 0);
        assert_eq!(t.row(1).col_indices(), &[0]);
        assert_eq!(t.row(1).values()[0], block.transpose());
    }

    #[test]
    fn product_matches_dense() {
        let a = assemble_rows(2, vec![vec![(0, 2.0), (1, -1.0)], vec![(0, -1.0), (1, 2.0)]])
            .expect("valid rows");
        let b = assemble_rows(1, vec![vec![(0, 1.0)], vec![(0, 1.0)]]).expect("valid rows");
        let ab = product(&a, &b).expect("product");
        assert_eq!(to_dense(&ab), to_dense(&a) * to_dense(&b));
        assert_eq!(diagonal(&a), vec![2.0, 2.0]);
    }
}
