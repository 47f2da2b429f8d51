//! The changes-table projection.
//!
//! Rows are exchanged in a reduced shape of their table: primary keys first,
//! then every column that can be written. Read-only (computed) columns stay
//! behind because the target store produces them itself.

use crate::error::{ProtocolError, ProtocolResult};
use crate::row::SyncRow;
use crate::schema::SyncTable;
use serde::{Deserialize, Serialize};

/// Builds the changes projection of a table schema.
#[derive(Debug, Clone, Copy)]
pub struct ChangesTableBuilder<'a> {
    table: &'a SyncTable,
}

impl<'a> ChangesTableBuilder<'a> {
    /// Creates a builder for `table`.
    pub fn new(table: &'a SyncTable) -> Self {
        Self { table }
    }

    /// Builds the projected schema.
    ///
    /// Fails if the table has no usable primary key.
    pub fn build(&self) -> ProtocolResult<SyncTable> {
        self.table.ensure_primary_keys()?;

        let mut columns = Vec::with_capacity(self.table.columns.len());
        for key in &self.table.primary_keys {
            if let Some(column) = self.table.column(key) {
                columns.push(column.clone());
            }
        }
        columns.extend(
            self.table
                .columns
                .iter()
                .filter(|c| !c.is_read_only && !self.table.is_primary_key(&c.name))
                .cloned(),
        );

        Ok(SyncTable {
            name: self.table.name.clone(),
            schema: self.table.schema.clone(),
            columns,
            primary_keys: self.table.primary_keys.clone(),
            direction: self.table.direction,
        })
    }
}

/// Rows of one table in changes-table shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesTable {
    /// Projected schema.
    pub schema: SyncTable,
    /// Rows, in read order.
    pub rows: Vec<SyncRow>,
}

impl ChangesTable {
    /// Creates an empty changes table for an already projected schema.
    pub fn new(schema: SyncTable) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    /// Appends a row, checking its shape.
    pub fn push(&mut self, row: SyncRow) -> ProtocolResult<()> {
        if row.values.len() != self.schema.columns.len() {
            return Err(ProtocolError::RowShape {
                table: self.schema.full_name(),
                expected: self.schema.columns.len(),
                actual: row.values.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SyncColumn;
    use crate::value::{DataType, SyncValue};

    fn product() -> SyncTable {
        SyncTable::new("Product")
            .with_schema("catalog")
            .with_column(SyncColumn::new("name", DataType::Text))
            .with_column(SyncColumn::new("total", DataType::Float).read_only())
            .with_column(SyncColumn::new("sku", DataType::Text))
            .with_column(SyncColumn::new("price", DataType::Float).nullable())
            .with_column(SyncColumn::new("id", DataType::Integer).auto_increment())
            .with_primary_key("sku")
            .with_primary_key("id")
    }

    #[test]
    fn keys_first_then_mutable_columns() {
        let changes = ChangesTableBuilder::new(&product()).build().unwrap();
        let names: Vec<_> = changes.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["sku", "id", "name", "price"]);
        assert_eq!(changes.full_name(), "catalog.Product");
    }

    #[test]
    fn table_without_key_is_refused() {
        let table = SyncTable::new("Audit").with_column(SyncColumn::new("line", DataType::Text));
        assert!(ChangesTableBuilder::new(&table).build().is_err());
    }

    #[test]
    fn push_checks_row_shape() {
        let schema = ChangesTableBuilder::new(&product()).build().unwrap();
        let mut table = ChangesTable::new(schema);

        let row = SyncRow::modified(vec!["A".into(), 1.into(), "Lamp".into(), SyncValue::Null]);
        table.push(row).unwrap();
        assert_eq!(table.len(), 1);

        let short = SyncRow::modified(vec!["B".into()]);
        assert!(matches!(
            table.push(short),
            Err(ProtocolError::RowShape { expected: 4, actual: 1, .. })
        ));
    }
}
