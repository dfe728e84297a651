//! MatrixMarket reader and writer.
//!
//! A system file holds two sections back to back:
//!
//! ```text
//! %%MatrixMarket matrix coordinate real general
//! rows cols nnz
//! row col value          (1-based, nnz lines)
//! %%MatrixMarket matrix array real general
//! rows 1
//! value                  (rows lines)
//! ```
//!
//! Values are printed with the shortest representation that parses back to
//! the same `f64`, so a write/read cycle is bit-exact.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{IoError, Result};
use crate::triplets::{SparseSystem, SparseTriplets};

const BANNER: &str = "%%MatrixMarket";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Coordinate,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Symmetry {
    General,
    Symmetric,
}

/// Writes the coordinate section for `matrix`.
pub fn write_matrix<W: Write>(out: &mut W, matrix: &SparseTriplets) -> Result<()> {
    matrix.validate()?;
    writeln!(out, "{BANNER} matrix coordinate real general")?;
    writeln!(out, "{} {} {}", matrix.nrows, matrix.ncols, matrix.nnz())?;
    for (r, c, v) in matrix.iter() {
        writeln!(out, "{} {} {:e}", r + 1, c + 1, v)?;
    }
    Ok(())
}

/// Writes a dense column vector as an array section.
pub fn write_vector<W: Write>(out: &mut W, values: &[f64]) -> Result<()> {
    writeln!(out, "{BANNER} matrix array real general")?;
    writeln!(out, "{} 1", values.len())?;
    for v in values {
        writeln!(out, "{v:e}")?;
    }
    Ok(())
}

pub fn write_system_to<W: Write>(out: &mut W, system: &SparseSystem) -> Result<()> {
    if system.rhs.len() != system.matrix.nrows {
        return Err(IoError::DimensionMismatch(format!(
            "rhs has {} entries, matrix has {} rows",
            system.rhs.len(),
            system.matrix.nrows
        )));
    }
    write_matrix(out, &system.matrix)?;
    write_vector(out, &system.rhs)
}

/// Writes matrix and right-hand side to `path`, creating parent directories.
pub fn write_system(path: impl AsRef<Path>, system: &SparseSystem) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut out = BufWriter::new(fs::File::create(path)?);
    write_system_to(&mut out, system)?;
    out.flush()?;
    Ok(())
}

/// Reads a matrix and its right-hand side from `path`.
pub fn read_system(path: impl AsRef<Path>) -> Result<SparseSystem> {
    let text = fs::read_to_string(path)?;
    parse_system(&text)
}

/// Reads only the leading matrix section of `path`.
pub fn read_matrix(path: impl AsRef<Path>) -> Result<SparseTriplets> {
    let text = fs::read_to_string(path)?;
    let mut lines = Lines::new(&text);
    parse_coordinate(&mut lines)
}

pub fn parse_system(text: &str) -> Result<SparseSystem> {
    let mut lines = Lines::new(text);
    let matrix = parse_coordinate(&mut lines)?;
    let rhs = parse_array(&mut lines)?;
    if let Some((line, _)) = lines.next_data() {
        return Err(IoError::parse(line, "unexpected content after vector section"));
    }
    SparseSystem::new(matrix, rhs)
}

fn parse_coordinate(lines: &mut Lines<'_>) -> Result<SparseTriplets> {
    let (layout, symmetry) = lines.banner()?;
    if layout != Layout::Coordinate {
        return Err(IoError::InvalidData(
            "expected a coordinate matrix section".into(),
        ));
    }

    let (line, header) = lines.require("size line")?;
    let dims = parse_usizes(line, header, 3)?;
    let (nrows, ncols, nnz) = (dims[0], dims[1], dims[2]);

    let mut matrix = SparseTriplets::new(nrows, ncols);
    for k in 0..nnz {
        let Some((line, text)) = lines.next_entry() else {
            return Err(IoError::DimensionMismatch(format!(
                "header declares {nnz} entries, found {k}"
            )));
        };
        let mut fields = text.split_whitespace();
        let row = parse_index(line, fields.next(), nrows)?;
        let col = parse_index(line, fields.next(), ncols)?;
        let value = parse_f64(line, fields.next())?;
        if fields.next().is_some() {
            return Err(IoError::parse(line, "trailing fields in coordinate entry"));
        }
        matrix.push(row, col, value);
        if symmetry == Symmetry::Symmetric && row != col {
            matrix.push(col, row, value);
        }
    }

    if let Some((line, _)) = lines.next_entry() {
        return Err(IoError::DimensionMismatch(format!(
            "header declares {nnz} entries, extra entry at line {line}"
        )));
    }

    Ok(matrix)
}

fn parse_array(lines: &mut Lines<'_>) -> Result<Vec<f64>> {
    let (layout, _) = lines.banner()?;
    if layout != Layout::Array {
        return Err(IoError::InvalidData("expected an array vector section".into()));
    }

    let (line, header) = lines.require("size line")?;
    let dims = parse_usizes(line, header, 2)?;
    if dims[1] != 1 {
        return Err(IoError::InvalidData(format!(
            "vector section must have one column, found {}",
            dims[1]
        )));
    }

    let rows = dims[0];
    let mut values = Vec::new();
    while let Some((line, text)) = lines.next_entry() {
        let mut fields = text.split_whitespace();
        values.push(parse_f64(line, fields.next())?);
        if fields.next().is_some() {
            return Err(IoError::parse(line, "trailing fields in vector entry"));
        }
    }
    if values.len() != rows {
        return Err(IoError::DimensionMismatch(format!(
            "header declares {rows} vector entries, found {}",
            values.len()
        )));
    }
    Ok(values)
}

fn parse_usizes(line: usize, text: &str, count: usize) -> Result<Vec<usize>> {
    let values = text
        .split_whitespace()
        .map(|tok| {
            tok.parse::<usize>()
                .map_err(|_| IoError::parse(line, format!("invalid size '{tok}'")))
        })
        .collect::<Result<Vec<_>>>()?;
    if values.len() != count {
        return Err(IoError::parse(
            line,
            format!("expected {count} sizes, found {}", values.len()),
        ));
    }
    Ok(values)
}

fn parse_index(line: usize, token: Option<&str>, bound: usize) -> Result<usize> {
    let token = token.ok_or_else(|| IoError::parse(line, "missing index"))?;
    let one_based = token
        .parse::<usize>()
        .map_err(|_| IoError::parse(line, format!("invalid index '{token}'")))?;
    if one_based == 0 || one_based > bound {
        return Err(IoError::InvalidData(format!(
            "index {one_based} at line {line} outside 1..={bound}"
        )));
    }
    Ok(one_based - 1)
}

fn parse_f64(line: usize, token: Option<&str>) -> Result<f64> {
    let token = token.ok_or_else(|| IoError::parse(line, "missing value"))?;
    token
        .parse::<f64>()
        .map_err(|_| IoError::parse(line, format!("invalid value '{token}'")))
}

/// Line cursor that tracks 1-based line numbers and skips blank lines.
struct Lines<'a> {
    inner: std::iter::Peekable<std::iter::Enumerate<std::str::Lines<'a>>>,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            inner: text.lines().enumerate().peekable(),
        }
    }

    fn skip_blank(&mut self) {
        while let Some((_, text)) = self.inner.peek() {
            if text.trim().is_empty() {
                self.inner.next();
            } else {
                break;
            }
        }
    }

    fn peek_data(&mut self) -> Option<(usize, &'a str)> {
        self.skip_blank();
        self.inner.peek().map(|&(i, text)| (i + 1, text.trim()))
    }

    fn next_data(&mut self) -> Option<(usize, &'a str)> {
        self.skip_blank();
        self.inner.next().map(|(i, text)| (i + 1, text.trim()))
    }

    /// Next non-comment line that is not the start of another section.
    fn next_entry(&mut self) -> Option<(usize, &'a str)> {
        loop {
            let (_, text) = self.peek_data()?;
            if text.starts_with(BANNER) {
                return None;
            }
            let entry = self.next_data()?;
            if !entry.1.starts_with('%') {
                return Some(entry);
            }
        }
    }

    fn require(&mut self, what: &str) -> Result<(usize, &'a str)> {
        self.next_entry()
            .ok_or_else(|| IoError::InvalidData(format!("missing {what}")))
    }

    fn banner(&mut self) -> Result<(Layout, Symmetry)> {
        let (line, text) = self
            .next_data()
            .ok_or_else(|| IoError::InvalidData("missing MatrixMarket banner".into()))?;
        let fields: Vec<String> = text.split_whitespace().map(str::to_ascii_lowercase).collect();
        if fields.len() != 5 || fields[0] != BANNER.to_ascii_lowercase() || fields[1] != "matrix" {
            return Err(IoError::parse(line, format!("invalid banner '{text}'")));
        }
        let layout = match fields[2].as_str() {
            "coordinate" => Layout::Coordinate,
            "array" => Layout::Array,
            other => return Err(IoError::parse(line, format!("unsupported layout '{other}'"))),
        };
        if fields[3] != "real" {
            return Err(IoError::parse(
                line,
                format!("unsupported field '{}'", fields[3]),
            ));
        }
        let symmetry = match fields[4].as_str() {
            "general" => Symmetry::General,
            "symmetric" if layout == Layout::Coordinate => Symmetry::Symmetric,
            other => {
                return Err(IoError::parse(
                    line,
                    format!("unsupported symmetry '{other}'"),
                ));
            }
        };
        Ok((layout, symmetry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_BY_TWO: &str = "\
%%MatrixMarket matrix coordinate real general
% written by hand
2 2 4
1 1 2
1 2 -1
2 1 -1
2 2 2
%%MatrixMarket matrix array real general
2 1
1
1
";

    #[test]
    fn parses_matrix_and_vector_sections() {
        let system = parse_system(TWO_BY_TWO).expect("valid system");
        assert_eq!(system.matrix.nrows, 2);
        assert_eq!(system.matrix.nnz(), 4);
        assert_eq!(system.matrix.row_indices, vec![0, 0, 1, 1]);
        assert_eq!(system.matrix.col_indices, vec![0, 1, 0, 1]);
        assert_eq!(system.matrix.values, vec![2.0, -1.0, -1.0, 2.0]);
        assert_eq!(system.rhs, vec![1.0, 1.0]);
    }

    #[test]
    fn rejects_short_entry_list() {
        let text = TWO_BY_TWO.replace("2 2 4", "2 2 5");
        let err = parse_system(&text).expect_err("nnz disagrees with triples");
        assert!(matches!(err, IoError::DimensionMismatch(_)), "{err}");
    }

    #[test]
    fn rejects_extra_entries() {
        let text = TWO_BY_TWO.replace("2 2 4", "2 2 3");
        let err = parse_system(&text).expect_err("nnz disagrees with triples");
        assert!(matches!(err, IoError::DimensionMismatch(_)), "{err}");
    }

    #[test]
    fn rejects_vector_length_mismatch() {
        let text = TWO_BY_TWO.replace("2 1\n", "3 1\n");
        let err = parse_system(&text).expect_err("vector rows disagree");
        assert!(matches!(err, IoError::DimensionMismatch(_)), "{err}");
    }

    #[test]
    fn rejects_oversized_vector_header() {
        let text = TWO_BY_TWO.replace("2 1\n", "18446744073709551615 1\n");
        let err = parse_system(&text).expect_err("header far exceeds the entries");
        assert!(matches!(err, IoError::DimensionMismatch(_)), "{err}");
    }

    #[test]
    fn rejects_oversized_matrix_header() {
        let text = TWO_BY_TWO.replace("2 2 4", "2 2 18446744073709551615");
        let err = parse_system(&text).expect_err("header far exceeds the entries");
        assert!(matches!(err, IoError::DimensionMismatch(_)), "{err}");
    }

    #[test]
    fn rejects_garbage_value() {
        let text = TWO_BY_TWO.replace("1 2 -1", "1 2 minus-one");
        let err = parse_system(&text).expect_err("bad float");
        assert!(matches!(err, IoError::Parse { line: 5, .. }), "{err}");
    }

    #[test]
    fn rejects_zero_based_index() {
        let text = TWO_BY_TWO.replace("1 1 2", "0 1 2");
        let err = parse_system(&text).expect_err("indices are 1-based");
        assert!(matches!(err, IoError::InvalidData(_)), "{err}");
    }

    #[test]
    fn symmetric_sections_are_mirrored() {
        let text = "\
%%MatrixMarket matrix coordinate real symmetric
2 2 3
1 1 4
2 1 -1
2 2 4
%%MatrixMarket matrix array real general
2 1
0
0
";
        let system = parse_system(text).expect("valid symmetric system");
        assert_eq!(system.matrix.nnz(), 4);
        assert!(system.matrix.iter().any(|e| e == (0, 1, -1.0)));
        assert!(system.matrix.iter().any(|e| e == (1, 0, -1.0)));
    }

    #[test]
    fn written_values_parse_back_exactly() {
        let mut matrix = SparseTriplets::new(1, 1);
        matrix.push(0, 0, 0.1 + 0.2);
        let system = SparseSystem::new(matrix, vec![f64::MIN_POSITIVE / 3.0]).expect("system");

        let mut buf = Vec::new();
        write_system_to(&mut buf, &system).expect("write to memory");
        let text = String::from_utf8(buf).expect("utf8");
        let back = parse_system(&text).expect("parse back");

        assert_eq!(back.matrix.values[0].to_bits(), (0.1f64 + 0.2).to_bits());
        assert_eq!(back.rhs[0].to_bits(), (f64::MIN_POSITIVE / 3.0).to_bits());
    }
}
