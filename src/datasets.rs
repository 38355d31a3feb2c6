//! Dataset loading: tabular CSV with a feature schema, MNIST IDX images, and
//! plain numeric CSV matrices.
use crate::error::{NetError, Result};
use crate::features::{FeatureDescriptor, FeatureKind};
use crate::layers::Matrix;
use byteorder::{BigEndian, ReadBytesExt};
use csv::ReaderBuilder;
use flate2::read::GzDecoder;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

/// Column-major table of raw string cells with a named header.
#[derive(Debug, Clone, Default)]
pub struct Table {
    headers: Vec<String>,
    columns: Vec<Vec<String>>,
    index: HashMap<String, usize>,
}

impl Table {
    pub fn from_columns<S: Into<String>>(columns: Vec<(S, Vec<String>)>) -> Result<Self> {
        let mut table = Table::default();
        let mut rows = None;
        for (name, cells) in columns {
            let name = name.into();
            if let Some(n) = rows {
                if n != cells.len() {
                    return Err(NetError::shape(format!("rows in column `{name}`"), n, cells.len()));
                }
            }
            rows = Some(cells.len());
            table.index.insert(name.clone(), table.headers.len());
            table.headers.push(name);
            table.columns.push(cells);
        }
        Ok(table)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    pub fn column(&self, name: &str) -> Result<&[String]> {
        self.index
            .get(name)
            .map(|&i| self.columns[i].as_slice())
            .ok_or_else(|| NetError::MissingColumn(name.to_string()))
    }

    pub fn numeric_column(&self, name: &str) -> Result<Vec<f64>> {
        self.column(name)?
            .iter()
            .enumerate()
            .map(|(row, cell)| {
                parse_finite(cell).ok_or_else(|| NetError::MalformedValue {
                    column: name.to_string(),
                    row,
                    value: cell.clone(),
                })
            })
            .collect()
    }

    /// Binary labels; anything other than 0 or 1 is malformed.
    pub fn labels(&self, name: &str) -> Result<Vec<f64>> {
        let values = self.numeric_column(name)?;
        for (row, &v) in values.iter().enumerate() {
            if v != 0.0 && v != 1.0 {
                return Err(NetError::MalformedValue {
                    column: name.to_string(),
                    row,
                    value: v.to_string(),
                });
            }
        }
        Ok(values)
    }
}

/// Numeric cell; `nan` and `inf` count as malformed.
fn parse_finite(cell: &str) -> Option<f64> {
    cell.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Load a CSV with a header row, dropping the named columns.
pub fn load_table<P: AsRef<Path>>(path: P, drop: &[&str]) -> Result<Table> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(file);
    let headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
    let mut columns: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
    for result in rdr.records() {
        let record = result?;
        for (col, cell) in columns.iter_mut().zip(record.iter()) {
            col.push(cell.to_string());
        }
    }
    if columns.first().map_or(true, Vec::is_empty) {
        return Err(NetError::EmptyDataset(path.display().to_string()));
    }
    for name in drop {
        if !headers.iter().any(|h| h == name) {
            return Err(NetError::MissingColumn(name.to_string()));
        }
    }
    Table::from_columns(
        headers
            .into_iter()
            .zip(columns)
            .filter(|(h, _)| !drop.contains(&h.as_str()))
            .collect(),
    )
}

/// One row of the feature schema file before vocabulary discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaEntry {
    pub name: String,
    pub kind: String,
    pub values: Option<String>,
}

/// Read a `name,kind,values` schema file.
pub fn load_schema<P: AsRef<Path>>(path: P) -> Result<Vec<SchemaEntry>> {
    let file = File::open(path)?;
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);
    let mut entries = Vec::new();
    for (row, result) in rdr.records().enumerate() {
        let record = result?;
        let name = record.get(0).unwrap_or_default();
        let kind = record.get(1).unwrap_or_default();
        if name.is_empty() || kind.is_empty() {
            return Err(NetError::Schema(format!("row {row}: expected `name,kind[,values]`")));
        }
        let kind = kind.to_lowercase();
        if !matches!(kind.as_str(), "symbolic" | "integer" | "continuous") {
            return Err(NetError::Schema(format!("row {row}: feature `{name}` has unknown kind `{kind}`")));
        }
        entries.push(SchemaEntry {
            name: name.to_string(),
            kind,
            values: record.get(2).filter(|v| !v.is_empty()).map(str::to_string),
        });
    }
    Ok(entries)
}

/// Turn schema entries into descriptors. Symbolic vocabularies and integer
/// ranges left blank in the schema are discovered across all `tables`.
pub fn resolve_schema(entries: &[SchemaEntry], tables: &[&Table]) -> Result<Vec<FeatureDescriptor>> {
    entries
        .iter()
        .map(|e| match e.kind.as_str() {
            "symbolic" => {
                let vocabulary: Vec<String> = match &e.values {
                    Some(v) => v.split(';').map(|s| s.trim().to_string()).collect(),
                    None => {
                        let mut seen = BTreeSet::new();
                        for t in tables {
                            seen.extend(t.column(&e.name)?.iter().map(|c| c.trim().to_string()));
                        }
                        seen.into_iter().collect()
                    }
                };
                Ok(FeatureDescriptor {
                    name: e.name.clone(),
                    kind: FeatureKind::Symbolic { vocabulary },
                })
            }
            "integer" => {
                let (min, max) = match &e.values {
                    Some(v) => parse_range(&e.name, v)?,
                    None => discover_range(&e.name, tables)?,
                };
                Ok(FeatureDescriptor::integer(&e.name, min, max))
            }
            "continuous" => Ok(FeatureDescriptor::continuous(&e.name)),
            other => Err(NetError::Schema(format!("feature `{}` has unknown kind `{other}`", e.name))),
        })
        .collect()
}

fn parse_range(name: &str, text: &str) -> Result<(i64, i64)> {
    let bad = || NetError::Schema(format!("feature `{name}`: range `{text}` is not `min:max`"));
    let (lo, hi) = text.split_once(':').ok_or_else(bad)?;
    let min = lo.trim().parse().map_err(|_| bad())?;
    let max = hi.trim().parse().map_err(|_| bad())?;
    Ok((min, max))
}

fn discover_range(name: &str, tables: &[&Table]) -> Result<(i64, i64)> {
    let mut range: Option<(i64, i64)> = None;
    for t in tables {
        for v in t.numeric_column(name)? {
            let v = v as i64;
            range = Some(match range {
                Some((lo, hi)) => (lo.min(v), hi.max(v)),
                None => (v, v),
            });
        }
    }
    range.ok_or_else(|| NetError::EmptyDataset(format!("no values to discover range of `{name}`")))
}

/// Numeric CSV without a label column, one sample per row.
pub fn load_csv_matrix<P: AsRef<Path>>(path: P, has_headers: bool) -> Result<Matrix> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut rdr = ReaderBuilder::new()
        .has_headers(has_headers)
        .trim(csv::Trim::All)
        .from_reader(file);
    let mut rows = Vec::new();
    for (row, result) in rdr.records().enumerate() {
        let record = result?;
        let values = record
            .iter()
            .enumerate()
            .map(|(col, cell)| {
                parse_finite(cell).ok_or_else(|| NetError::MalformedValue {
                    column: col.to_string(),
                    row,
                    value: cell.to_string(),
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(values);
    }
    if rows.is_empty() {
        return Err(NetError::EmptyDataset(path.display().to_string()));
    }
    Ok(rows)
}

/// Parsed IDX file header and payload
#[derive(Debug)]
struct IdxData {
    sizes: Vec<i32>,
    data: Vec<u8>,
}

impl IdxData {
    fn read(contents: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(contents);
        let magic = r.read_i32::<BigEndian>()?;
        let dims = match magic {
            2049 => 1,
            2051 => 3,
            _ => return Err(NetError::Schema(format!("invalid IDX magic {magic}"))),
        };
        let mut sizes = Vec::with_capacity(dims);
        for _ in 0..dims {
            sizes.push(r.read_i32::<BigEndian>()?);
        }
        let mut data = Vec::new();
        r.read_to_end(&mut data)?;
        Ok(Self { sizes, data })
    }
}

/// MNIST-style gzipped IDX3 images scaled to [0, 1], one flattened image per row.
pub fn load_mnist_images<P: AsRef<Path>>(path: P) -> Result<Matrix> {
    let file = File::open(path)?;
    let mut contents = Vec::new();
    GzDecoder::new(file).read_to_end(&mut contents)?;
    let idx = IdxData::read(&contents)?;
    if idx.sizes.len() != 3 {
        return Err(NetError::Schema("expected an IDX3 image file".to_string()));
    }
    let [count, rows, cols] = [idx.sizes[0], idx.sizes[1], idx.sizes[2]].map(|d| d.max(0) as usize);
    let too_large = || NetError::Schema(format!("IDX header claims {count} images of {rows}x{cols}"));
    let image_size = rows.checked_mul(cols).ok_or_else(too_large)?;
    if count == 0 || image_size == 0 {
        return Err(NetError::EmptyDataset("IDX file holds no images".to_string()));
    }
    let needed = count.checked_mul(image_size).ok_or_else(too_large)?;
    if idx.data.len() < needed {
        return Err(NetError::shape("IDX image bytes", needed, idx.data.len()));
    }
    Ok(idx
        .data
        .chunks_exact(image_size)
        .take(count)
        .map(|img| img.iter().map(|&b| b as f64 / 255.0).collect())
        .collect())
}

/// Rows `[step * batch_size, (step + 1) * batch_size)` of `data`, wrapping
/// around the end so every batch is full.
pub fn next_batch(data: &Matrix, step: usize, batch_size: usize) -> Matrix {
    let n = data.len();
    if n == 0 {
        return Vec::new();
    }
    let start = ((step as u128 * batch_size as u128) % n as u128) as usize;
    (0..batch_size).map(|k| data[(start + k) % n].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeaturePlan;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn cells(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_load_table_drops_category_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.csv");
        std::fs::write(&path, "proto, dur, attack_cat, label\ntcp, 0.5, Normal, 0\nudp, 1.5, DoS, 1\n").unwrap();
        let table = load_table(&path, &["attack_cat"]).unwrap();
        assert_eq!(table.headers(), &["proto", "dur", "label"]);
        assert_eq!(table.num_rows(), 2);
        assert_eq!(table.labels("label").unwrap(), vec![0.0, 1.0]);
        assert!(matches!(table.column("attack_cat"), Err(NetError::MissingColumn(_))));
        assert!(matches!(load_table(&path, &["nope"]), Err(NetError::MissingColumn(_))));
    }

    #[test]
    fn test_malformed_value_names_column_and_row() {
        let table = Table::from_columns(vec![("dur", cells(&["1.0", "x"]))]).unwrap();
        match table.numeric_column("dur").unwrap_err() {
            NetError::MalformedValue { column, row, value } => {
                assert_eq!((column.as_str(), row, value.as_str()), ("dur", 1, "x"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_resolve_schema_discovers_missing_metadata() {
        let train = Table::from_columns(vec![
            ("proto", cells(&["tcp", "udp"])),
            ("ttl", cells(&["3", "9"])),
        ])
        .unwrap();
        let test = Table::from_columns(vec![
            ("proto", cells(&["arp"])),
            ("ttl", cells(&["1"])),
        ])
        .unwrap();
        let entries = vec![
            SchemaEntry { name: "proto".into(), kind: "symbolic".into(), values: None },
            SchemaEntry { name: "ttl".into(), kind: "integer".into(), values: None },
            SchemaEntry { name: "state".into(), kind: "symbolic".into(), values: Some("CON;FIN".into()) },
            SchemaEntry { name: "sbytes".into(), kind: "integer".into(), values: Some("0:20000".into()) },
        ];
        let descriptors = resolve_schema(&entries, &[&train, &test]).unwrap();
        assert_eq!(descriptors[0], FeatureDescriptor::symbolic("proto", ["arp", "tcp", "udp"]));
        assert_eq!(descriptors[1], FeatureDescriptor::integer("ttl", 1, 9));
        assert_eq!(descriptors[2], FeatureDescriptor::symbolic("state", ["CON", "FIN"]));
        assert_eq!(descriptors[3], FeatureDescriptor::integer("sbytes", 0, 20000));
    }

    #[test]
    fn test_unknown_schema_kind_is_rejected() {
        let entries = vec![SchemaEntry { name: "x".into(), kind: "ordinal".into(), values: None }];
        assert!(matches!(resolve_schema(&entries, &[]), Err(NetError::Schema(_))));
    }

    #[test]
    fn test_load_schema_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.csv");
        std::fs::write(&path, "name,kind,values\nproto,symbolic,tcp;udp\ndur,continuous\nttl,integer,0:255\n").unwrap();
        let entries = load_schema(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].values, None);
        assert_eq!(entries[2].values.as_deref(), Some("0:255"));
    }

    #[test]
    fn test_schema_file_with_unknown_kind_names_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.csv");
        std::fs::write(&path, "name,kind,values\nproto,symbolic,tcp;udp\nsport,ordinal,\n").unwrap();
        match load_schema(&path) {
            Err(NetError::Schema(msg)) => assert!(msg.contains("row 1") && msg.contains("sport")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_schema_file_with_repeated_vocabulary_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.csv");
        std::fs::write(&path, "name,kind,values\nproto,symbolic,tcp;tcp;udp\nstate,symbolic,CON;;FIN\n").unwrap();
        let entries = load_schema(&path).unwrap();
        let proto = resolve_schema(&entries[..1], &[]).unwrap();
        assert!(matches!(FeaturePlan::new(proto), Err(NetError::Schema(_))));
        let state = resolve_schema(&entries[1..], &[]).unwrap();
        assert!(matches!(FeaturePlan::new(state), Err(NetError::Schema(_))));
    }

    #[test]
    fn test_non_finite_cells_are_malformed() {
        let table = Table::from_columns(vec![("dur", cells(&["1.0", "NaN", "inf"]))]).unwrap();
        assert!(matches!(
            table.numeric_column("dur"),
            Err(NetError::MalformedValue { row: 1, .. })
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.csv");
        std::fs::write(&path, "0.1,0.2\n0.3,inf\n").unwrap();
        match load_csv_matrix(&path, false) {
            Err(NetError::MalformedValue { column, row, .. }) => assert_eq!((column.as_str(), row), ("1", 1)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_oversized_idx_header_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.gz");
        let mut raw = Vec::new();
        for v in [2051i32, i32::MAX, 65_535, 65_535] {
            raw.extend_from_slice(&v.to_be_bytes());
        }
        raw.extend_from_slice(&[0; 16]);
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(&raw).unwrap();
        enc.finish().unwrap();
        assert!(load_mnist_images(&path).is_err());
    }

    #[test]
    fn test_load_mnist_images_scales_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imgs.gz");
        let mut raw = Vec::new();
        for v in [2051i32, 2, 2, 2] {
            raw.extend_from_slice(&v.to_be_bytes());
        }
        raw.extend_from_slice(&[0, 255, 51, 0, 255, 255, 0, 0]);
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(&raw).unwrap();
        enc.finish().unwrap();
        let images = load_mnist_images(&path).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0], vec![0.0, 1.0, 0.2, 0.0]);
    }

    #[test]
    fn test_next_batch_wraps_around() {
        let data: Matrix = (0..5).map(|i| vec![i as f64]).collect();
        let b0 = next_batch(&data, 0, 3);
        let b1 = next_batch(&data, 1, 3);
        assert_eq!(b0, vec![vec![0.0], vec![1.0], vec![2.0]]);
        assert_eq!(b1, vec![vec![3.0], vec![4.0], vec![0.0]]);
        assert_eq!(next_batch(&data, 5, 3)[0], vec![0.0]);
    }
}
