//! Query-related backend messages.

use zerocopy::byteorder::big_endian::{I16 as I16BE, I32 as I32BE, U16 as U16BE, U32 as U32BE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::read_cstr;
use crate::protocol::types::{FormatCode, Oid};

/// Fixed-size tail of a field description (18 bytes).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct FieldDescriptionTail {
    /// Table OID (0 if not a table column)
    pub table_oid: U32BE,
    /// Column attribute number (0 if not a table column)
    pub column_id: I16BE,
    /// Data type OID
    pub type_oid: U32BE,
    /// Type size (-1 for variable, -2 for null-terminated)
    pub type_size: I16BE,
    /// Type modifier (type-specific)
    pub type_modifier: I32BE,
    /// Format code (0=text, 1=binary)
    pub format: U16BE,
}

impl FieldDescriptionTail {
    /// Table OID (0 if not a table column)
    pub fn table_oid(&self) -> Oid {
        self.table_oid.get()
    }

    /// Column attribute number (0 if not a table column)
    pub fn column_id(&self) -> i16 {
        self.column_id.get()
    }

    /// Data type OID
    pub fn type_oid(&self) -> Oid {
        self.type_oid.get()
    }

    /// Type size (-1 for variable, -2 for null-terminated)
    pub fn type_size(&self) -> i16 {
        self.type_size.get()
    }

    /// Type modifier (type-specific)
    pub fn type_modifier(&self) -> i32 {
        self.type_modifier.get()
    }

    /// Format code (0=text, 1=binary)
    pub fn format(&self) -> FormatCode {
        FormatCode::from_u16(self.format.get())
    }
}

/// Field description within a RowDescription.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescription<'a> {
    /// Field name
    pub name: &'a str,
    /// Fixed-size metadata
    pub tail: &'a FieldDescriptionTail,
}

fn read_count<'a>(payload: &'a [u8], what: &str) -> Result<(usize, &'a [u8])> {
    let (count, rest) = payload
        .split_first_chunk::<2>()
        .ok_or_else(|| Error::Protocol(format!("{what}: missing field count")))?;
    Ok((u16::from_be_bytes(*count) as usize, rest))
}

/// RowDescription message - describes the columns in a result set.
#[derive(Debug)]
pub struct RowDescription<'a> {
    fields: Vec<FieldDescription<'a>>,
}

impl<'a> RowDescription<'a> {
    /// Parse a RowDescription message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (num_fields, mut data) = read_count(payload, "RowDescription")?;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let (name, rest) = read_cstr(data)?;
            let (tail, rest) = FieldDescriptionTail::ref_from_prefix(rest)
                .map_err(|e| Error::Protocol(format!("FieldDescription tail: {e:?}")))?;
            fields.push(FieldDescription { name, tail });
            data = rest;
        }

        Ok(Self { fields })
    }

    /// Get the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if there are no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Get field descriptions.
    pub fn fields(&self) -> &[FieldDescription<'a>] {
        &self.fields
    }
}

/// DataRow message - contains a single row of data.
#[derive(Debug, Clone, Copy)]
pub struct DataRow<'a> {
    num_columns: usize,
    columns_data: &'a [u8],
}

impl<'a> DataRow<'a> {
    /// Parse a DataRow message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (num_columns, columns_data) = read_count(payload, "DataRow")?;
        Ok(Self {
            num_columns,
            columns_data,
        })
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.num_columns
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.num_columns == 0
    }

    /// Create an iterator over column values.
    ///
    /// Each item is `Option<&[u8]>` where `None` represents NULL.
    pub fn iter(&self) -> DataRowIter<'a> {
        DataRowIter {
            remaining: self.columns_data,
        }
    }

    /// Get a column value by index.
    ///
    /// Returns `None` if the index is out of range, `Some(None)` for NULL.
    pub fn get(&self, index: usize) -> Option<Option<&'a [u8]>> {
        self.iter().nth(index)
    }
}

/// Iterator over column values in a DataRow.
#[derive(Debug, Clone)]
pub struct DataRowIter<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for DataRowIter<'a> {
    type Item = Option<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        let (len, rest) = self.remaining.split_first_chunk::<4>()?;
        let len = i32::from_be_bytes(*len);
        self.remaining = rest;

        if len < 0 {
            return Some(None);
        }
        let value;
        (value, self.remaining) = self.remaining.split_at_checked(len as usize)?;
        Some(Some(value))
    }
}

/// CommandComplete message - indicates successful completion of a command.
#[derive(Debug, Clone, Copy)]
pub struct CommandComplete<'a> {
    /// Command tag (e.g., "SELECT 5", "INSERT 0 1", "UPDATE 10")
    pub tag: &'a str,
}

impl<'a> CommandComplete<'a> {
    /// Parse a CommandComplete message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (tag, _) = read_cstr(payload)?;
        Ok(Self { tag })
    }

    /// Parse the number of rows affected from the command tag.
    ///
    /// Returns `Some(count)` for commands like SELECT, INSERT, UPDATE, DELETE.
    /// Returns `None` for other commands or parse failures.
    pub fn rows_affected(&self) -> Option<u64> {
        let parts: Vec<&str> = self.tag.split_whitespace().collect();

        match parts.as_slice() {
            ["INSERT", _oid, count] => count.parse().ok(),
            [
                "SELECT" | "UPDATE" | "DELETE" | "MERGE" | "COPY" | "MOVE" | "FETCH",
                count,
            ] => count.parse().ok(),
            _ => None,
        }
    }

    /// OID of the inserted row, for a single-row INSERT into a table with OIDs.
    pub fn inserted_oid(&self) -> Option<Oid> {
        let mut parts = self.tag.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("INSERT"), Some(oid)) => oid.parse().ok().filter(|&oid: &Oid| oid != 0),
            _ => None,
        }
    }

    /// Get the command name from the tag.
    pub fn command(&self) -> &str {
        self.tag.split_whitespace().next().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_description_payload() -> Vec<u8> {
        let mut payload = vec![0, 2];
        for (name, oid) in [("id", 23u32), ("name", 25u32)] {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(&16384u32.to_be_bytes());
            payload.extend_from_slice(&1i16.to_be_bytes());
            payload.extend_from_slice(&oid.to_be_bytes());
            payload.extend_from_slice(&(-1i16).to_be_bytes());
            payload.extend_from_slice(&(-1i32).to_be_bytes());
            payload.extend_from_slice(&0u16.to_be_bytes());
        }
        payload
    }

    #[test]
    fn test_row_description() {
        let payload = row_description_payload();
        let desc = RowDescription::parse(&payload).unwrap();
        assert_eq!(desc.len(), 2);
        assert_eq!(desc.fields()[0].name, "id");
        assert_eq!(desc.fields()[0].tail.type_oid(), 23);
        assert_eq!(desc.fields()[1].name, "name");
        assert_eq!(desc.fields()[1].tail.format(), FormatCode::Text);
    }

    #[test]
    fn test_row_description_truncated() {
        let payload = row_description_payload();
        assert!(RowDescription::parse(&payload[..payload.len() - 3]).is_err());
        assert!(RowDescription::parse(&[0]).is_err());
    }

    #[test]
    fn test_data_row_with_null() {
        let mut payload = vec![0, 2];
        payload.extend_from_slice(&3i32.to_be_bytes());
        payload.extend_from_slice(b"abc");
        payload.extend_from_slice(&(-1i32).to_be_bytes());

        let row = DataRow::parse(&payload).unwrap();
        assert_eq!(row.len(), 2);
        assert_eq!(row.get(0), Some(Some(&b"abc"[..])));
        assert_eq!(row.get(1), Some(None));
        assert_eq!(row.get(2), None);
    }

    #[test]
    fn test_data_row_missing_count() {
        assert!(matches!(DataRow::parse(&[0]), Err(Error::Protocol(_))));
        let row = DataRow::parse(&[0, 0]).unwrap();
        assert_eq!(row.len(), 0);
    }

    #[test]
    fn test_command_complete_tags() {
        let insert = CommandComplete { tag: "INSERT 17 1" };
        assert_eq!(insert.rows_affected(), Some(1));
        assert_eq!(insert.inserted_oid(), Some(17));
        assert_eq!(insert.command(), "INSERT");

        let insert = CommandComplete { tag: "INSERT 0 3" };
        assert_eq!(insert.inserted_oid(), None);

        let update = CommandComplete { tag: "UPDATE 5" };
        assert_eq!(update.rows_affected(), Some(5));

        let create = CommandComplete { tag: "CREATE TABLE" };
        assert_eq!(create.rows_affected(), None);
        assert_eq!(create.command(), "CREATE");
    }
}
