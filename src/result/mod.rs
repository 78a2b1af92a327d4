//! Result items and their delivery to subscriptions.
//!
//! A task that runs SQL produces an ordered sequence of result items: update
//! outcomes and row sets. [`ResultDemux`] pairs that sequence with the
//! subscriptions the application registers, which may come before, during or
//! after the server produced the matching item.

mod demux;
mod subscription;

use std::fmt;
use std::sync::Arc;

pub use demux::{ResultDemux, RowDemand};
pub use subscription::{
    DemandSignal, PendingOutcome, RowDelivery, RowStream, SingleSink, StreamSink, Subscription,
};

use crate::error::{Error, ErrorFields, Result};
use crate::protocol::backend::{CommandComplete, DataRow, RowDescription};
use crate::protocol::types::{FormatCode, Oid};

/// The two kinds of result item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// Outcome of a statement that returns no rows.
    Update,
    /// Row metadata, rows and a terminal outcome.
    RowSet,
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultKind::Update => f.write_str("an update outcome"),
            ResultKind::RowSet => f.write_str("a row set"),
        }
    }
}

/// Outcome of one statement.
///
/// Row sets end with an outcome too, carrying the SELECT row count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// First word of the command tag (`INSERT`, `SELECT`, `CREATE`, ...)
    pub command: String,
    /// Rows affected or returned, when the tag carries a count
    pub rows_affected: Option<u64>,
    /// OID of the inserted row for a single-row INSERT into a table with OIDs
    pub inserted_oid: Option<Oid>,
    /// Notices the server sent while producing this result
    pub warnings: Vec<ErrorFields>,
    /// Whether the server is about to send more results for the same task
    pub has_more: bool,
    /// Position of this result within its task (0-based)
    pub result_index: usize,
}

impl UpdateOutcome {
    /// Build an outcome from a CommandComplete message.
    pub fn from_command_complete(
        complete: &CommandComplete<'_>,
        warnings: Vec<ErrorFields>,
        has_more: bool,
    ) -> Self {
        Self {
            command: complete.command().to_string(),
            rows_affected: complete.rows_affected(),
            inserted_oid: complete.inserted_oid(),
            warnings,
            has_more,
            result_index: 0,
        }
    }
}

/// Description of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Table OID (0 if not a table column)
    pub table_oid: Oid,
    /// Column attribute number (0 if not a table column)
    pub column_id: i16,
    /// Data type OID
    pub type_oid: Oid,
    /// Type size (-1 for variable, -2 for null-terminated)
    pub type_size: i16,
    /// Type modifier
    pub type_modifier: i32,
    /// Wire format of the values
    pub format: FormatCode,
}

/// Column metadata shared by every row of a row set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowMeta {
    columns: Vec<Column>,
}

impl RowMeta {
    /// Build metadata from a RowDescription message payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let desc = RowDescription::parse(payload)?;
        let columns = desc
            .fields()
            .iter()
            .map(|field| Column {
                name: field.name.to_string(),
                table_oid: field.tail.table_oid(),
                column_id: field.tail.column_id(),
                type_oid: field.tail.type_oid(),
                type_size: field.tail.type_size(),
                type_modifier: field.tail.type_modifier(),
                format: field.tail.format(),
            })
            .collect();
        Ok(Self { columns })
    }

    /// Build metadata from column descriptions.
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// All columns, in order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row set has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Index of the first column with the given name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// One data row, owning its column values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    meta: Arc<RowMeta>,
    data: Vec<u8>,
    /// Byte range of every non-NULL value within `data`
    ranges: Vec<Option<(usize, usize)>>,
}

impl Row {
    /// Decode a DataRow payload against the row set's metadata.
    pub fn decode(meta: Arc<RowMeta>, payload: &[u8]) -> Result<Self> {
        let row = DataRow::parse(payload)?;
        if row.len() != meta.len() {
            return Err(Error::Protocol(format!(
                "DataRow has {} columns, RowDescription has {}",
                row.len(),
                meta.len()
            )));
        }

        let mut data = Vec::with_capacity(payload.len());
        let mut ranges = Vec::with_capacity(row.len());
        for value in row.iter() {
            ranges.push(value.map(|bytes| {
                let start = data.len();
                data.extend_from_slice(bytes);
                (start, data.len())
            }));
        }
        if ranges.len() != meta.len() {
            return Err(Error::Protocol("DataRow truncated".into()));
        }

        Ok(Self { meta, data, ranges })
    }

    /// Column metadata of the row set.
    pub fn meta(&self) -> &Arc<RowMeta> {
        &self.meta
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Whether the value at `index` is NULL (or out of range).
    pub fn is_null(&self, index: usize) -> bool {
        !matches!(self.ranges.get(index), Some(Some(_)))
    }

    /// Raw value bytes; `None` for NULL or an out-of-range index.
    pub fn get_bytes(&self, index: usize) -> Option<&[u8]> {
        let (start, end) = (*self.ranges.get(index)?)?;
        self.data.get(start..end)
    }

    /// Value as text; `Ok(None)` for NULL or an out-of-range index.
    pub fn get_str(&self, index: usize) -> Result<Option<&str>> {
        self.get_bytes(index)
            .map(|bytes| {
                simdutf8::compat::from_utf8(bytes)
                    .map_err(|e| Error::Protocol(format!("column {index}: invalid UTF-8: {e}")))
            })
            .transpose()
    }

    /// Value of the named column as text.
    pub fn get_str_by_name(&self, name: &str) -> Result<Option<&str>> {
        match self.meta.index_of(name) {
            Some(index) => self.get_str(index),
            None => Err(Error::InvalidUsage(format!("no column named {name}"))),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_decode_with_null() {
        let meta = testing::meta(&["a", "b"]);
        let mut payload = vec![0, 2];
        payload.extend_from_slice(&2i32.to_be_bytes());
        payload.extend_from_slice(b"hi");
        payload.extend_from_slice(&(-1i32).to_be_bytes());

        let row = Row::decode(meta, &payload).unwrap();
        assert_eq!(row.get_str(0).unwrap(), Some("hi"));
        assert!(row.is_null(1));
        assert_eq!(row.get_bytes(1), None);
        assert_eq!(row.get_str_by_name("a").unwrap(), Some("hi"));
        assert!(row.get_str_by_name("zzz").is_err());
    }

    #[test]
    fn test_row_decode_column_count_mismatch() {
        let meta = testing::meta(&["a"]);
        assert!(Row::decode(meta, &[0, 0]).is_err());
    }

    #[test]
    fn test_outcome_from_command_complete() {
        let complete = CommandComplete { tag: "INSERT 0 4" };
        let outcome = UpdateOutcome::from_command_complete(&complete, Vec::new(), true);
        assert_eq!(outcome.command, "INSERT");
        assert_eq!(outcome.rows_affected, Some(4));
        assert!(outcome.has_more);
    }
}
