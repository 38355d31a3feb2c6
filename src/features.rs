//! Column classification and per-column encoders for the feature merger.
//!
//! A column is symbolic (finite vocabulary), integer (numeric range) or
//! continuous. Symbolic and small-range integer columns become embedding
//! indices; continuous and large-range integer columns are min-max scaled.
//! The merged feature vector is the concatenation of every column's
//! contribution in schema order.
use crate::datasets::Table;
use crate::error::{NetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Integer columns with fewer distinct values than this are embedded.
pub const SMALL_INTEGER_LIMIT: i64 = 8096;
/// Upper bound on the embedding width of a symbolic column.
pub const MAX_SYMBOLIC_WIDTH: usize = 7;
/// Upper bound on the embedding width of a small-range integer column.
pub const MAX_INTEGER_WIDTH: usize = 5;

fn ceil_log2(n: u128) -> usize {
    if n <= 1 {
        0
    } else {
        (u128::BITS - (n - 1).leading_zeros()) as usize
    }
}

/// `min(7, ceil(log2 V))`, at least 1.
pub fn symbolic_width(vocabulary: usize) -> usize {
    ceil_log2(vocabulary as u128).min(MAX_SYMBOLIC_WIDTH).max(1)
}

/// `min(5, ceil(log2 R))`, at least 1. `R` may exceed the `i64` span.
pub fn integer_width(range: u128) -> usize {
    ceil_log2(range).min(MAX_INTEGER_WIDTH).max(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureKind {
    Symbolic { vocabulary: Vec<String> },
    Integer { min: i64, max: i64 },
    Continuous,
}

/// How a column enters the merged vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Embedded { vocabulary: usize, width: usize },
    Scaled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub kind: FeatureKind,
}

impl FeatureDescriptor {
    pub fn symbolic<S: Into<String>>(name: &str, vocabulary: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.to_string(),
            kind: FeatureKind::Symbolic {
                vocabulary: vocabulary.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn integer(name: &str, min: i64, max: i64) -> Self {
        Self {
            name: name.to_string(),
            kind: FeatureKind::Integer { min, max },
        }
    }

    pub fn continuous(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FeatureKind::Continuous,
        }
    }

    pub fn role(&self) -> ColumnRole {
        match &self.kind {
            FeatureKind::Symbolic { vocabulary } => ColumnRole::Embedded {
                vocabulary: vocabulary.len(),
                width: symbolic_width(vocabulary.len()),
            },
            FeatureKind::Integer { min, max } => {
                // i128 holds the span of any i64 pair
                let range = i128::from(*max) - i128::from(*min) + 1;
                if range < i128::from(SMALL_INTEGER_LIMIT) {
                    ColumnRole::Embedded {
                        vocabulary: range as usize,
                        width: integer_width(range as u128),
                    }
                } else {
                    ColumnRole::Scaled
                }
            }
            FeatureKind::Continuous => ColumnRole::Scaled,
        }
    }

    /// Contribution of this column to the merged vector.
    pub fn width(&self) -> usize {
        match self.role() {
            ColumnRole::Embedded { width, .. } => width,
            ColumnRole::Scaled => 1,
        }
    }

    fn validate(&self) -> Result<()> {
        match &self.kind {
            FeatureKind::Symbolic { vocabulary } if vocabulary.is_empty() => Err(NetError::Schema(format!(
                "symbolic feature `{}` has an empty vocabulary",
                self.name
            ))),
            FeatureKind::Symbolic { vocabulary } => {
                let mut seen = BTreeSet::new();
                for value in vocabulary {
                    let value = value.trim();
                    if value.is_empty() {
                        return Err(NetError::Schema(format!(
                            "symbolic feature `{}` has an empty vocabulary entry",
                            self.name
                        )));
                    }
                    if !seen.insert(value) {
                        return Err(NetError::Schema(format!(
                            "symbolic feature `{}` lists `{}` twice",
                            self.name, value
                        )));
                    }
                }
                Ok(())
            }
            FeatureKind::Integer { min, max } if max < min => Err(NetError::Schema(format!(
                "integer feature `{}` has max {} below min {}",
                self.name, max, min
            ))),
            _ => Ok(()),
        }
    }
}

/// Column descriptors in merge order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturePlan {
    pub descriptors: Vec<FeatureDescriptor>,
}

impl FeaturePlan {
    pub fn new(descriptors: Vec<FeatureDescriptor>) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(NetError::Schema("no features declared".to_string()));
        }
        let mut seen = BTreeSet::new();
        for d in &descriptors {
            d.validate()?;
            if !seen.insert(d.name.as_str()) {
                return Err(NetError::Schema(format!("feature `{}` declared twice", d.name)));
            }
        }
        Ok(Self { descriptors })
    }

    /// Width of the merged feature vector.
    pub fn merged_width(&self) -> usize {
        self.descriptors.iter().map(FeatureDescriptor::width).sum()
    }

    /// Fit the scalers on `train`; category/offset encoders come from the schema.
    pub fn fit(&self, train: &Table) -> Result<FittedPlan> {
        let encoders = self
            .descriptors
            .iter()
            .map(|d| ColumnEncoder::fit(d, train))
            .collect::<Result<Vec<_>>>()?;
        Ok(FittedPlan {
            plan: self.clone(),
            encoders,
        })
    }
}

/// Label encoder over a fixed vocabulary; codes follow sorted value order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryEncoder {
    pub column: String,
    classes: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl CategoryEncoder {
    pub fn fit<S: AsRef<str>>(column: &str, values: impl IntoIterator<Item = S>) -> Self {
        let classes: Vec<String> = values
            .into_iter()
            .map(|v| v.as_ref().trim().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut enc = Self {
            column: column.to_string(),
            classes,
            index: HashMap::new(),
        };
        enc.rebuild_index();
        enc
    }

    fn rebuild_index(&mut self) {
        self.index = self.classes.iter().enumerate().map(|(i, c)| (c.clone(), i)).collect();
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn transform<S: AsRef<str>>(&self, values: &[S]) -> Result<Vec<usize>> {
        values
            .iter()
            .map(|v| {
                let key = v.as_ref().trim();
                self.index.get(key).copied().ok_or_else(|| NetError::UnknownCategory {
                    column: self.column.clone(),
                    value: key.to_string(),
                })
            })
            .collect()
    }

    pub fn inverse_transform(&self, codes: &[usize]) -> Result<Vec<String>> {
        codes
            .iter()
            .map(|&c| {
                self.classes.get(c).cloned().ok_or_else(|| NetError::UnknownCategory {
                    column: self.column.clone(),
                    value: c.to_string(),
                })
            })
            .collect()
    }
}

/// Shifts a small-range integer column to `0..range`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegerEncoder {
    pub column: String,
    pub min: i64,
    pub max: i64,
}

impl IntegerEncoder {
    pub fn transform(&self, values: &[f64]) -> Result<Vec<usize>> {
        values
            .iter()
            .map(|&v| {
                let i = v as i64;
                if v.fract() != 0.0 || i < self.min || i > self.max {
                    return Err(NetError::UnknownCategory {
                        column: self.column.clone(),
                        value: v.to_string(),
                    });
                }
                Ok((i - self.min) as usize)
            })
            .collect()
    }
}

/// Linear rescaling to [0, 1] using the fitted minimum and maximum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    pub column: String,
    pub min: f64,
    pub max: f64,
}

impl MinMaxScaler {
    pub fn fit(column: &str, values: &[f64]) -> Result<Self> {
        if values.is_empty() {
            return Err(NetError::EmptyDataset(format!("cannot fit scaler for `{column}`")));
        }
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        Ok(Self {
            column: column.to_string(),
            min,
            max,
        })
    }

    fn range(&self) -> f64 {
        self.max - self.min
    }

    pub fn transform(&self, values: &[f64]) -> Vec<f64> {
        let range = self.range();
        values
            .iter()
            .map(|&v| if range > 0.0 { (v - self.min) / range } else { 0.0 })
            .collect()
    }

    pub fn inverse_transform(&self, scaled: &[f64]) -> Vec<f64> {
        let range = self.range();
        scaled.iter().map(|&s| s * range + self.min).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoder", rename_all = "snake_case")]
pub enum ColumnEncoder {
    Category(CategoryEncoder),
    Offset(IntegerEncoder),
    Scale(MinMaxScaler),
}

impl ColumnEncoder {
    fn fit(descriptor: &FeatureDescriptor, train: &Table) -> Result<Self> {
        let name = descriptor.name.as_str();
        Ok(match (&descriptor.kind, descriptor.role()) {
            (FeatureKind::Symbolic { vocabulary }, _) => ColumnEncoder::Category(CategoryEncoder::fit(name, vocabulary)),
            (FeatureKind::Integer { min, max }, ColumnRole::Embedded { .. }) => ColumnEncoder::Offset(IntegerEncoder {
                column: name.to_string(),
                min: *min,
                max: *max,
            }),
            _ => ColumnEncoder::Scale(MinMaxScaler::fit(name, &train.numeric_column(name)?)?),
        })
    }

    fn encode(&self, name: &str, table: &Table) -> Result<EncodedColumn> {
        match self {
            ColumnEncoder::Category(enc) => Ok(EncodedColumn::Indices(enc.transform(table.column(name)?)?)),
            ColumnEncoder::Offset(enc) => Ok(EncodedColumn::Indices(enc.transform(&table.numeric_column(name)?)?)),
            ColumnEncoder::Scale(enc) => Ok(EncodedColumn::Scaled(enc.transform(&table.numeric_column(name)?))),
        }
    }
}

/// Feature plan plus the encoders fit for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPlan {
    pub plan: FeaturePlan,
    pub encoders: Vec<ColumnEncoder>,
}

impl FittedPlan {
    pub fn encode(&self, table: &Table) -> Result<EncodedTable> {
        let columns = self
            .plan
            .descriptors
            .iter()
            .zip(&self.encoders)
            .map(|(d, enc)| enc.encode(&d.name, table))
            .collect::<Result<Vec<_>>>()?;
        Ok(EncodedTable {
            rows: table.num_rows(),
            columns,
        })
    }

    /// Restore lookup indices after deserialization.
    pub(crate) fn rebuild(&mut self) {
        for enc in &mut self.encoders {
            if let ColumnEncoder::Category(c) = enc {
                c.rebuild_index();
            }
        }
    }
}

/// A raw column after transformation.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedColumn {
    Indices(Vec<usize>),
    Scaled(Vec<f64>),
}

impl EncodedColumn {
    fn select(&self, rows: &[usize]) -> Self {
        match self {
            EncodedColumn::Indices(v) => EncodedColumn::Indices(rows.iter().map(|&r| v[r]).collect()),
            EncodedColumn::Scaled(v) => EncodedColumn::Scaled(rows.iter().map(|&r| v[r]).collect()),
        }
    }
}

/// Column-major encoded dataset, one entry per feature in plan order.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedTable {
    pub rows: usize,
    pub columns: Vec<EncodedColumn>,
}

impl EncodedTable {
    pub fn select(&self, rows: &[usize]) -> Self {
        Self {
            rows: rows.len(),
            columns: self.columns.iter().map(|c| c.select(rows)).collect(),
        }
    }
}
