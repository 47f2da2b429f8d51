//! Table schemas and relations.

use crate::error::{ProtocolError, ProtocolResult};
use crate::value::DataType;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Direction in which a table's changes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncDirection {
    /// Changes flow both ways.
    #[default]
    Bidirectional,
    /// Client changes are uploaded, server changes are never downloaded.
    UploadOnly,
    /// Server changes are downloaded, client changes are never uploaded.
    DownloadOnly,
}

impl SyncDirection {
    /// Returns true if client changes are sent to the server.
    pub fn can_upload(&self) -> bool {
        !matches!(self, SyncDirection::DownloadOnly)
    }

    /// Returns true if server changes are sent to the client.
    pub fn can_download(&self) -> bool {
        !matches!(self, SyncDirection::UploadOnly)
    }
}

/// A column of a tracked table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncColumn {
    /// Column name.
    pub name: String,
    /// Column type.
    pub data_type: DataType,
    /// Whether null is allowed.
    pub allow_null: bool,
    /// Computed or otherwise not writable.
    pub is_read_only: bool,
    /// Value generated by the store on insert.
    pub is_auto_increment: bool,
}

impl SyncColumn {
    /// Creates a non-null, writable column.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            allow_null: false,
            is_read_only: false,
            is_auto_increment: false,
        }
    }

    /// Allows null values.
    pub fn nullable(mut self) -> Self {
        self.allow_null = true;
        self
    }

    /// Marks the column read-only (computed).
    pub fn read_only(mut self) -> Self {
        self.is_read_only = true;
        self
    }

    /// Marks the column as store-generated.
    pub fn auto_increment(mut self) -> Self {
        self.is_auto_increment = true;
        self
    }
}

/// Schema of a tracked table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTable {
    /// Table name.
    pub name: String,
    /// Optional schema (namespace) name.
    pub schema: Option<String>,
    /// Columns in declared order.
    pub columns: Vec<SyncColumn>,
    /// Primary key column names in key order.
    pub primary_keys: Vec<String>,
    /// Sync direction.
    pub direction: SyncDirection,
}

impl SyncTable {
    /// Creates an empty table schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            columns: Vec::new(),
            primary_keys: Vec::new(),
            direction: SyncDirection::Bidirectional,
        }
    }

    /// Sets the schema name.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Appends a column.
    pub fn with_column(mut self, column: SyncColumn) -> Self {
        self.columns.push(column);
        self
    }

    /// Appends a primary key column name.
    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_keys.push(column.into());
        self
    }

    /// Sets the sync direction.
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Returns `schema.name`, or `name` when no schema is set.
    pub fn full_name(&self) -> String {
        match &self.schema {
            Some(schema) if !schema.is_empty() => format!("{}.{}", schema, self.name),
            _ => self.name.clone(),
        }
    }

    /// Returns true if `name` designates this table (case-insensitive).
    pub fn matches_name(&self, name: &str) -> bool {
        self.full_name().eq_ignore_ascii_case(name) || self.name.eq_ignore_ascii_case(name)
    }

    /// Finds a column by name (case-insensitive).
    pub fn column(&self, name: &str) -> Option<&SyncColumn> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Returns the position of a column (case-insensitive).
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Returns true if `column` is part of the primary key.
    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_keys
            .iter()
            .any(|k| k.eq_ignore_ascii_case(column))
    }

    /// Fails unless the table has a primary key made of existing columns.
    pub fn ensure_primary_keys(&self) -> ProtocolResult<()> {
        if self.primary_keys.is_empty() {
            return Err(ProtocolError::MissingPrimaryKey {
                table: self.full_name(),
            });
        }
        for key in &self.primary_keys {
            if self.column(key).is_none() {
                return Err(ProtocolError::UnknownColumn {
                    table: self.full_name(),
                    column: key.clone(),
                });
            }
        }
        Ok(())
    }

    /// Positions of the primary key columns, in key order.
    pub fn primary_key_indexes(&self) -> Vec<usize> {
        self.primary_keys
            .iter()
            .filter_map(|k| self.column_index(k))
            .collect()
    }
}

/// A foreign-key relation between two tracked tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRelation {
    /// Relation name.
    pub name: String,
    /// Referenced (parent) table.
    pub parent_table: String,
    /// Referenced columns.
    pub parent_columns: Vec<String>,
    /// Referencing (child) table.
    pub child_table: String,
    /// Referencing columns.
    pub child_columns: Vec<String>,
}

impl SyncRelation {
    /// Creates a single-column relation.
    pub fn new(
        name: impl Into<String>,
        parent_table: impl Into<String>,
        parent_column: impl Into<String>,
        child_table: impl Into<String>,
        child_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parent_table: parent_table.into(),
            parent_columns: vec![parent_column.into()],
            child_table: child_table.into(),
            child_columns: vec![child_column.into()],
        }
    }
}

/// The full schema of a sync scope.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncSet {
    /// Tables in setup order.
    pub tables: Vec<SyncTable>,
    /// Relations between tables.
    pub relations: Vec<SyncRelation>,
}

impl SyncSet {
    /// Creates a schema from tables and relations.
    pub fn new(tables: Vec<SyncTable>, relations: Vec<SyncRelation>) -> Self {
        Self { tables, relations }
    }

    /// Finds a table by name.
    pub fn table(&self, name: &str) -> Option<&SyncTable> {
        self.tables.iter().find(|t| t.matches_name(name))
    }

    /// Returns the tables with parents before the children that reference
    /// them.
    ///
    /// Ties keep setup order. Tables caught in a reference cycle are appended
    /// in setup order after every orderable table.
    pub fn ordered_tables(&self) -> Vec<&SyncTable> {
        let n = self.tables.len();
        let mut in_degree = vec![0usize; n];
        let mut children: HashMap<usize, Vec<usize>> = HashMap::new();

        for relation in &self.relations {
            let parent = self
                .tables
                .iter()
                .position(|t| t.matches_name(&relation.parent_table));
            let child = self
                .tables
                .iter()
                .position(|t| t.matches_name(&relation.child_table));
            if let (Some(parent), Some(child)) = (parent, child) {
                if parent != child {
                    children.entry(parent).or_default().push(child);
                    in_degree[child] += 1;
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|i| in_degree[*i] == 0).collect();
        let mut ordered = Vec::with_capacity(n);
        let mut placed = vec![false; n];

        while let Some(index) = ready.pop_front() {
            ordered.push(index);
            placed[index] = true;
            if let Some(kids) = children.get(&index) {
                let mut released: Vec<usize> = Vec::new();
                for &kid in kids {
                    in_degree[kid] -= 1;
                    if in_degree[kid] == 0 {
                        released.push(kid);
                    }
                }
                released.sort_unstable();
                ready.extend(released);
            }
        }

        ordered.extend((0..n).filter(|i| !placed[*i]));
        ordered.into_iter().map(|i| &self.tables[i]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> SyncTable {
        SyncTable::new(name)
            .with_column(SyncColumn::new("id", DataType::Integer))
            .with_primary_key("id")
    }

    #[test]
    fn full_name_with_schema() {
        let t = table("Customer").with_schema("sales");
        assert_eq!(t.full_name(), "sales.Customer");
        assert!(t.matches_name("SALES.customer"));
        assert!(t.matches_name("Customer"));
    }

    #[test]
    fn missing_primary_key_rejected() {
        let t = SyncTable::new("Log").with_column(SyncColumn::new("msg", DataType::Text));
        assert!(matches!(
            t.ensure_primary_keys(),
            Err(ProtocolError::MissingPrimaryKey { .. })
        ));

        let t = SyncTable::new("Log")
            .with_column(SyncColumn::new("msg", DataType::Text))
            .with_primary_key("id");
        assert!(matches!(
            t.ensure_primary_keys(),
            Err(ProtocolError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn parents_before_children() {
        let set = SyncSet::new(
            vec![table("OrderLine"), table("Order"), table("Customer")],
            vec![
                SyncRelation::new("fk_line_order", "Order", "id", "OrderLine", "order_id"),
                SyncRelation::new("fk_order_customer", "Customer", "id", "Order", "customer_id"),
            ],
        );

        let names: Vec<_> = set.ordered_tables().iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["Customer", "Order", "OrderLine"]);
    }

    #[test]
    fn unrelated_tables_keep_setup_order() {
        let set = SyncSet::new(vec![table("B"), table("A"), table("C")], vec![]);
        let names: Vec<_> = set.ordered_tables().iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["B", "A", "C"]);
    }

    #[test]
    fn cycles_do_not_drop_tables() {
        let set = SyncSet::new(
            vec![table("A"), table("B"), table("C")],
            vec![
                SyncRelation::new("ab", "A", "id", "B", "a_id"),
                SyncRelation::new("ba", "B", "id", "A", "b_id"),
            ],
        );
        let names: Vec<_> = set.ordered_tables().iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["C", "A", "B"]);
    }

    #[test]
    fn direction_flags() {
        assert!(SyncDirection::Bidirectional.can_upload());
        assert!(SyncDirection::Bidirectional.can_download());
        assert!(!SyncDirection::DownloadOnly.can_upload());
        assert!(!SyncDirection::UploadOnly.can_download());
    }
}
