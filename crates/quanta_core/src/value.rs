//! Runtime values produced by evaluating expression nodes.
//!
//! A `Value` is a scalar, a matrix (dense or sparse) or a piece of text.
//! Scalars broadcast into matrix operations; text only supports
//! concatenation and (in)equality.

use std::fmt;

use anyhow::bail;
use nalgebra::DMatrix;
use nalgebra_sparse::convert::serial::convert_csc_dense;
use nalgebra_sparse::{CooMatrix, CscMatrix, SparseEntry};

use crate::error::{Error, Result};

/// Matrix storage. Both layouts share element access and the element-wise
/// visitor; visiting always yields a dense result.
#[derive(Debug, Clone, PartialEq)]
pub enum Matrix {
    Dense(DMatrix<f64>),
    Sparse(CscMatrix<f64>),
}

impl Matrix {
    pub fn zeros(rows: usize, columns: usize) -> Self {
        Matrix::Dense(DMatrix::zeros(rows, columns))
    }

    /// Builds a sparse matrix from `(row, column, value)` triplets.
    pub fn sparse(rows: usize, columns: usize, triplets: &[(usize, usize, f64)]) -> Result<Self> {
        let mut coo = CooMatrix::new(rows, columns);
        for &(r, c, v) in triplets {
            if r >= rows || c >= columns {
                return Err(Error::Format(anyhow::anyhow!(
                    "sparse entry ({r}, {c}) outside {rows}x{columns}"
                )));
            }
            coo.push(r, c, v);
        }
        Ok(Matrix::Sparse(CscMatrix::from(&coo)))
    }

    pub fn rows(&self) -> usize {
        match self {
            Matrix::Dense(m) => m.nrows(),
            Matrix::Sparse(m) => m.nrows(),
        }
    }

    pub fn columns(&self) -> usize {
        match self {
            Matrix::Dense(m) => m.ncols(),
            Matrix::Sparse(m) => m.ncols(),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows(), self.columns())
    }

    /// Element access. Out-of-range indices read as zero.
    pub fn get(&self, row: usize, column: usize) -> f64 {
        match self {
            Matrix::Dense(m) => m.get((row, column)).copied().unwrap_or(0.0),
            Matrix::Sparse(m) => match m.get_entry(row, column) {
                Some(SparseEntry::NonZero(v)) => *v,
                _ => 0.0,
            },
        }
    }

    /// Applies `f` to every element, including the implicit zeros of a
    /// sparse matrix.
    pub fn visit(&self, f: impl Fn(f64) -> f64) -> Matrix {
        match self {
            Matrix::Dense(m) => Matrix::Dense(m.map(f)),
            Matrix::Sparse(m) => Matrix::Dense(convert_csc_dense(m).map(f)),
        }
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        match self {
            Matrix::Dense(m) => m.clone(),
            Matrix::Sparse(m) => convert_csc_dense(m),
        }
    }

    pub fn transpose(&self) -> Matrix {
        match self {
            Matrix::Dense(m) => Matrix::Dense(m.transpose()),
            Matrix::Sparse(m) => Matrix::Sparse(m.transpose()),
        }
    }

    /// Generalized element norm: `n = 0` counts non-zeros, `n = inf` is the
    /// largest magnitude.
    pub fn norm(&self, n: f64) -> f64 {
        let dense = self.to_dense();
        if n == 0.0 {
            return dense.iter().filter(|v| **v != 0.0).count() as f64;
        }
        if n.is_infinite() {
            return dense.iter().fold(0.0, |acc: f64, v| acc.max(v.abs()));
        }
        dense
            .iter()
            .map(|v| v.abs().powf(n))
            .sum::<f64>()
            .powf(1.0 / n)
    }

    fn any_nonzero(&self) -> bool {
        match self {
            Matrix::Dense(m) => m.iter().any(|v| *v != 0.0),
            Matrix::Sparse(m) => m.values().iter().any(|v| *v != 0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Matrix(Matrix),
    Text(String),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Matrix(_) => "matrix",
            Value::Text(_) => "text",
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_matrix(&self) -> Option<&Matrix> {
        match self {
            Value::Matrix(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Requires a scalar, failing with a type mismatch attributed to `op`.
    pub fn scalar(&self, op: &str) -> Result<f64> {
        match self {
            Value::Scalar(v) => Ok(*v),
            other => Err(Error::type_mismatch(op, other.kind_name())),
        }
    }

    pub fn is_true(&self) -> bool {
        match self {
            Value::Scalar(v) => *v != 0.0,
            Value::Matrix(m) => m.any_nonzero(),
            Value::Text(s) => !s.is_empty(),
        }
    }

    /// Element-wise unary map over scalars and matrices.
    pub fn map(&self, op: &str, f: impl Fn(f64) -> f64) -> Result<Value> {
        match self {
            Value::Scalar(v) => Ok(Value::Scalar(f(*v))),
            Value::Matrix(m) => Ok(Value::Matrix(m.visit(f))),
            Value::Text(_) => Err(Error::type_mismatch(op, "text")),
        }
    }

    /// Element-wise binary combination with scalar broadcasting.
    pub fn zip(&self, other: &Value, op: &str, f: impl Fn(f64, f64) -> f64) -> Result<Value> {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(f(*a, *b))),
            (Value::Scalar(a), Value::Matrix(m)) => Ok(Value::Matrix(m.visit(|b| f(*a, b)))),
            (Value::Matrix(m), Value::Scalar(b)) => Ok(Value::Matrix(m.visit(|a| f(a, *b)))),
            (Value::Matrix(a), Value::Matrix(b)) => {
                if a.shape() != b.shape() {
                    return Err(Error::DimensionMismatch {
                        op: op.to_string(),
                        left: a.shape(),
                        right: b.shape(),
                    });
                }
                let (rows, columns) = a.shape();
                Ok(Value::Matrix(Matrix::Dense(DMatrix::from_fn(
                    rows,
                    columns,
                    |r, c| f(a.get(r, c), b.get(r, c)),
                ))))
            }
            (Value::Text(_), _) | (_, Value::Text(_)) => Err(Error::type_mismatch(op, "text")),
        }
    }

    pub fn add(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Text(_), _) | (_, Value::Text(_)) => Ok(Value::Text(format!("{self}{other}"))),
            _ => self.zip(other, "+", |a, b| a + b),
        }
    }

    pub fn subtract(&self, other: &Value) -> Result<Value> {
        self.zip(other, "-", |a, b| a - b)
    }

    /// `*`: scalar scaling, or a true matrix product between two matrices.
    pub fn multiply(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Matrix(a), Value::Matrix(b)) => {
                if a.columns() != b.rows() {
                    return Err(Error::DimensionMismatch {
                        op: "*".to_string(),
                        left: a.shape(),
                        right: b.shape(),
                    });
                }
                Ok(Value::Matrix(Matrix::Dense(a.to_dense() * b.to_dense())))
            }
            _ => self.zip(other, "*", |a, b| a * b),
        }
    }

    pub fn multiply_elementwise(&self, other: &Value) -> Result<Value> {
        self.zip(other, "&", |a, b| a * b)
    }

    pub fn divide(&self, other: &Value) -> Result<Value> {
        self.zip(other, "/", |a, b| a / b)
    }

    /// Floored modulo, so the result takes the sign of the divisor.
    pub fn modulo(&self, other: &Value) -> Result<Value> {
        self.zip(other, "%", |a, b| a - b * (a / b).floor())
    }

    pub fn power(&self, other: &Value) -> Result<Value> {
        self.zip(other, "^", pow)
    }

    pub fn equal(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => Ok(truth(a == b)),
            (Value::Text(_), _) | (_, Value::Text(_)) => Ok(truth(false)),
            _ => self.zip(other, "==", |a, b| bool_f64(a == b)),
        }
    }

    pub fn not_equal(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => Ok(truth(a != b)),
            (Value::Text(_), _) | (_, Value::Text(_)) => Ok(truth(true)),
            _ => self.zip(other, "!=", |a, b| bool_f64(a != b)),
        }
    }

    pub fn negate(&self) -> Result<Value> {
        self.map("-", |v| -v)
    }

    pub fn transpose(&self) -> Result<Value> {
        match self {
            Value::Scalar(v) => Ok(Value::Scalar(*v)),
            Value::Matrix(m) => Ok(Value::Matrix(m.transpose())),
            Value::Text(_) => Err(Error::type_mismatch("'", "text")),
        }
    }
}

/// `x^0` is NaN when `x` is exactly zero.
fn pow(a: f64, b: f64) -> f64 {
    if a == 0.0 && b == 0.0 {
        f64::NAN
    } else {
        a.powf(b)
    }
}

pub(crate) fn bool_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

pub(crate) fn truth(b: bool) -> Value {
    Value::Scalar(bool_f64(b))
}

/// Parses the plain-text matrix layout shared by matrix files and literals:
/// rows separated by newlines or `;`, elements by whitespace or commas.
/// A first line `sparse <rows> <columns>` switches to `row column value`
/// triplets.
pub fn parse_matrix(text: &str) -> anyhow::Result<Matrix> {
    let mut lines = text
        .split(|c| c == '\n' || c == ';')
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'));

    let first = match lines.next() {
        Some(line) => line,
        None => return Ok(Matrix::zeros(0, 0)),
    };

    let fields = |line: &str| -> Vec<String> {
        line.split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    };

    let header = fields(first);
    if header.first().map(|s| s.eq_ignore_ascii_case("sparse")) == Some(true) {
        if header.len() != 3 {
            bail!("sparse header must be `sparse <rows> <columns>`");
        }
        let rows: usize = header[1].parse()?;
        let columns: usize = header[2].parse()?;
        let mut triplets = Vec::new();
        for line in lines {
            let f = fields(line);
            if f.len() != 3 {
                bail!("sparse entry must be `row column value`: {line}");
            }
            let row: usize = f[0].parse()?;
            let column: usize = f[1].parse()?;
            let value: f64 = f[2].parse()?;
            triplets.push((row, column, value));
        }
        return Matrix::sparse(rows, columns, &triplets).map_err(|e| anyhow::anyhow!("{e}"));
    }

    let mut data: Vec<Vec<f64>> = Vec::new();
    for line in std::iter::once(first).chain(lines) {
        let row = fields(line)
            .iter()
            .map(|s| s.parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        data.push(row);
    }
    let rows = data.len();
    let columns = data.iter().map(Vec::len).max().unwrap_or(0);
    Ok(Matrix::Dense(DMatrix::from_fn(rows, columns, |r, c| {
        data[r].get(c).copied().unwrap_or(0.0)
    })))
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for r in 0..self.rows() {
            if r > 0 {
                write!(f, ";")?;
            }
            for c in 0..self.columns() {
                if c > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", self.get(r, c))?;
            }
        }
        write!(f, "]")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(v) => write!(f, "{v}"),
            Value::Matrix(m) => write!(f, "{m}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Scalar(value)
    }
}

impl From<DMatrix<f64>> for Value {
    fn from(value: DMatrix<f64>) -> Self {
        Value::Matrix(Matrix::Dense(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}
