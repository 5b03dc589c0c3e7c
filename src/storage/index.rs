//! Sortable Index Keys
//!
//! Index keys are `_`-joined columns led by the index name. Unordered columns are
//! written verbatim; ordered columns are zero-padded to a fixed width so that
//! lexicographic order equals numeric order.
//!
//! ```text
//! epoch_<partition>_<bucket>_<epoch padded>_<key>
//! epochtree_<partition>_<epoch padded>
//! item_<key>
//! ```
//!
//! The padded width is a compatibility contract: every node of a cluster must use
//! the same width, and epochs that do not fit are rejected instead of mis-sorting.

use crate::error::{ClusterError, Result};

pub const EPOCH_INDEX: &str = "epoch";
pub const EPOCH_TREE_INDEX: &str = "epochtree";
pub const ITEM_INDEX: &str = "item";

pub const DEFAULT_EPOCH_WIDTH: usize = 10;

const SEPARATOR: char = '_';

#[derive(Debug, Clone)]
enum Column {
    Unordered(String),
    Ordered { value: u64, width: usize },
}

impl Column {
    fn render(&self) -> Result<String> {
        match self {
            Column::Unordered(value) => Ok(value.clone()),
            Column::Ordered { value, width } => {
                let rendered = value.to_string();
                if rendered.len() > *width {
                    return Err(ClusterError::Encoding(format!(
                        "value {} does not fit in {} digits",
                        value, width
                    )));
                }
                Ok(format!("{:0>width$}", rendered, width = *width))
            }
        }
    }
}

/// Builder for `_`-separated index keys.
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    columns: Vec<Column>,
}

impl IndexBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            columns: vec![Column::Unordered(name.to_string())],
        }
    }

    pub fn unordered(mut self, value: impl ToString) -> Self {
        self.columns.push(Column::Unordered(value.to_string()));
        self
    }

    pub fn ordered(mut self, value: u64, width: usize) -> Self {
        self.columns.push(Column::Ordered { value, width });
        self
    }

    pub fn build(self) -> Result<String> {
        let mut out = String::new();
        for (i, column) in self.columns.iter().enumerate() {
            if i != 0 {
                out.push(SEPARATOR);
            }
            out.push_str(&column.render()?);
        }
        Ok(out)
    }
}

/// Decoded form of an epoch index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochIndexKey {
    pub partition: u32,
    pub bucket: u32,
    pub epoch: i64,
    pub key: String,
}

/// Encodes and decodes the index keys used by the record store and the Merkle engine.
#[derive(Debug, Clone, Copy)]
pub struct EpochIndexCodec {
    width: usize,
}

impl Default for EpochIndexCodec {
    fn default() -> Self {
        Self::new(DEFAULT_EPOCH_WIDTH)
    }
}

impl EpochIndexCodec {
    pub fn new(width: usize) -> Self {
        Self { width }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    fn epoch_column(epoch: i64) -> Result<u64> {
        u64::try_from(epoch)
            .map_err(|_| ClusterError::Encoding(format!("negative epoch {}", epoch)))
    }

    pub fn build_epoch_index(
        &self,
        partition: u32,
        bucket: u32,
        epoch: i64,
        key: &str,
    ) -> Result<String> {
        IndexBuilder::new(EPOCH_INDEX)
            .unordered(partition)
            .unordered(bucket)
            .ordered(Self::epoch_column(epoch)?, self.width)
            .unordered(key)
            .build()
    }

    /// Keys may contain the separator; only the first four separators are structural.
    pub fn parse_epoch_index(&self, index: &str) -> Result<EpochIndexKey> {
        let mut parts = index.splitn(5, SEPARATOR);
        let name = parts.next().unwrap_or_default();
        if name != EPOCH_INDEX {
            return Err(ClusterError::Encoding(format!(
                "expected index '{}', found '{}'",
                EPOCH_INDEX, name
            )));
        }

        let (partition, bucket, epoch, key) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(p), Some(b), Some(e), Some(k)) => (p, b, e, k),
                _ => {
                    return Err(ClusterError::Encoding(format!(
                        "epoch index '{}' has too few columns",
                        index
                    )));
                }
            };

        if epoch.len() != self.width {
            return Err(ClusterError::Encoding(format!(
                "epoch column '{}' is not {} digits",
                epoch, self.width
            )));
        }

        Ok(EpochIndexKey {
            partition: parse_number(partition, "partition")?,
            bucket: parse_number(bucket, "bucket")?,
            epoch: parse_number(epoch, "epoch")?,
            key: key.to_string(),
        })
    }

    /// Half-open scan bounds covering epochs `[lower, upper)` of one bucket.
    pub fn epoch_range(
        &self,
        partition: u32,
        bucket: u32,
        lower: i64,
        upper: i64,
    ) -> Result<(String, String)> {
        Ok((
            self.build_epoch_index(partition, bucket, lower, "")?,
            self.build_epoch_index(partition, bucket, upper, "")?,
        ))
    }

    pub fn build_epoch_tree_index(&self, partition: u32, epoch: i64) -> Result<String> {
        IndexBuilder::new(EPOCH_TREE_INDEX)
            .unordered(partition)
            .ordered(Self::epoch_column(epoch)?, self.width)
            .build()
    }

    pub fn parse_epoch_tree_index(&self, index: &str) -> Result<(u32, i64)> {
        let parts: Vec<&str> = index.split(SEPARATOR).collect();
        if parts.len() != 3 || parts[0] != EPOCH_TREE_INDEX {
            return Err(ClusterError::Encoding(format!(
                "'{}' is not an {} index",
                index, EPOCH_TREE_INDEX
            )));
        }
        Ok((
            parse_number(parts[1], "partition")?,
            parse_number(parts[2], "epoch")?,
        ))
    }

    /// Scan bounds covering every tree object of a partition.
    pub fn epoch_tree_range(&self, partition: u32) -> Result<(String, String)> {
        let start = self.build_epoch_tree_index(partition, 0)?;
        // '`' sorts right after the digits and '_', closing the partition prefix.
        let end = format!("{}{}{}`", EPOCH_TREE_INDEX, SEPARATOR, partition);
        Ok((start, end))
    }
}

pub fn item_index(key: &str) -> String {
    format!("{}{}{}", ITEM_INDEX, SEPARATOR, key)
}

fn parse_number<T: std::str::FromStr>(raw: &str, column: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| ClusterError::Encoding(format!("invalid {} column '{}'", column, raw)))
}
