//! What gets synchronized: tables, filters and filter parameters.

use crate::error::{ProtocolError, ProtocolResult};
use crate::schema::SyncDirection;
use crate::value::{DataType, SyncValue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A table named in a setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupTable {
    /// Table name.
    pub name: String,
    /// Optional schema name.
    pub schema: Option<String>,
    /// Sync direction.
    pub direction: SyncDirection,
}

impl SetupTable {
    /// Parses `"table"` or `"schema.table"`.
    pub fn parse(qualified: &str) -> Self {
        let qualified = qualified.trim();
        match qualified.split_once('.') {
            Some((schema, name)) if !schema.is_empty() && !name.is_empty() => Self {
                name: name.to_string(),
                schema: Some(schema.to_string()),
                direction: SyncDirection::Bidirectional,
            },
            _ => Self {
                name: qualified.to_string(),
                schema: None,
                direction: SyncDirection::Bidirectional,
            },
        }
    }

    /// Sets the sync direction.
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Returns `schema.name`, or `name`.
    pub fn full_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }
}

/// A parameter of a row filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterParameter {
    /// Parameter name supplied by the caller.
    pub name: String,
    /// Column compared against the parameter value.
    pub column: String,
    /// Parameter type.
    pub data_type: DataType,
    /// Whether the caller may omit the parameter (matches every row).
    pub allow_null: bool,
}

impl FilterParameter {
    /// Creates a required parameter filtering on the column of the same name.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            data_type,
            allow_null: false,
        }
    }

    /// Filters on a differently named column.
    pub fn on_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Allows the parameter to be omitted.
    pub fn optional(mut self) -> Self {
        self.allow_null = true;
        self
    }
}

/// Row filter for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFilter {
    /// Filtered table (as named in the setup).
    pub table: String,
    /// Parameters; a row matches when every parameter matches.
    pub parameters: Vec<FilterParameter>,
}

impl SyncFilter {
    /// Creates a filter without parameters.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            parameters: Vec::new(),
        }
    }

    /// Adds a parameter.
    pub fn with_parameter(mut self, parameter: FilterParameter) -> Self {
        self.parameters.push(parameter);
        self
    }
}

/// The tables and filters a scope synchronizes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncSetup {
    /// Tables, in setup order.
    pub tables: Vec<SetupTable>,
    /// Row filters.
    pub filters: Vec<SyncFilter>,
}

impl SyncSetup {
    /// Creates a setup from table names (`"table"` or `"schema.table"`).
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tables: tables
                .into_iter()
                .map(|t| SetupTable::parse(t.as_ref()))
                .collect(),
            filters: Vec::new(),
        }
    }

    /// Appends a table.
    pub fn with_table(mut self, table: SetupTable) -> Self {
        self.tables.push(table);
        self
    }

    /// Appends a filter.
    pub fn with_filter(mut self, filter: SyncFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Returns the filter for a table, if any.
    pub fn filter_for(&self, table: &str) -> Option<&SyncFilter> {
        self.filters.iter().find(|f| {
            f.table.eq_ignore_ascii_case(table)
                || self
                    .table(&f.table)
                    .is_some_and(|t| t.full_name().eq_ignore_ascii_case(table))
        })
    }

    /// Finds a setup table by name.
    pub fn table(&self, name: &str) -> Option<&SetupTable> {
        self.tables.iter().find(|t| {
            t.full_name().eq_ignore_ascii_case(name) || t.name.eq_ignore_ascii_case(name)
        })
    }

    /// Checks that the setup names tables, has no duplicates and only
    /// filters tables it contains.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.tables.is_empty() {
            return Err(ProtocolError::InvalidSetup("no tables".into()));
        }
        for (i, table) in self.tables.iter().enumerate() {
            let name = table.full_name();
            if self.tables[..i]
                .iter()
                .any(|t| t.full_name().eq_ignore_ascii_case(&name))
            {
                return Err(ProtocolError::InvalidSetup(format!(
                    "table {name} listed twice"
                )));
            }
        }
        for filter in &self.filters {
            if self.table(&filter.table).is_none() {
                return Err(ProtocolError::InvalidSetup(format!(
                    "filter on unknown table {}",
                    filter.table
                )));
            }
        }
        Ok(())
    }

    /// Checks that every required filter parameter is supplied.
    pub fn check_parameters(&self, parameters: &SyncParameters) -> ProtocolResult<()> {
        for filter in &self.filters {
            for parameter in &filter.parameters {
                let supplied = parameters.get(&parameter.name).is_some_and(|v| !v.is_null());
                if !supplied && !parameter.allow_null {
                    return Err(ProtocolError::MissingParameter {
                        table: filter.table.clone(),
                        parameter: parameter.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Stable signature of the setup, used to detect divergence between
    /// client and server.
    pub fn signature(&self) -> String {
        // serde_json output is deterministic for these plain structs.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// A named filter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncParameter {
    /// Parameter name.
    pub name: String,
    /// Parameter value.
    pub value: SyncValue,
}

/// Named, typed filter values supplied for one round.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncParameters {
    entries: Vec<SyncParameter>,
}

impl SyncParameters {
    /// Creates an empty parameter list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a parameter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<SyncValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Adds or replaces a parameter.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<SyncValue>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(&name))
        {
            Some(existing) => existing.value = value,
            None => self.entries.push(SyncParameter { name, value }),
        }
    }

    /// Looks up a parameter (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&SyncValue> {
        self.entries
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| &p.value)
    }

    /// Iterates the parameters.
    pub fn iter(&self) -> impl Iterator<Item = &SyncParameter> {
        self.entries.iter()
    }

    /// Returns true if no parameter is set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// File-system safe key identifying this parameter set.
    ///
    /// Parameters are sorted by name so that the key does not depend on the
    /// order in which they were supplied.
    pub fn cache_key(&self) -> String {
        if self.entries.is_empty() {
            return "ALL".to_string();
        }
        let mut parts: Vec<String> = self
            .entries
            .iter()
            .map(|p| format!("{}_{}", p.name.to_ascii_lowercase(), p.value.key_fragment()))
            .collect();
        parts.sort();
        parts
            .join("_")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_qualified_names() {
        let t = SetupTable::parse("sales.Customer");
        assert_eq!(t.schema.as_deref(), Some("sales"));
        assert_eq!(t.name, "Customer");
        assert_eq!(t.full_name(), "sales.Customer");

        let t = SetupTable::parse("Product");
        assert_eq!(t.schema, None);
    }

    #[test]
    fn validate_rejects_duplicates_and_stray_filters() {
        assert!(SyncSetup::new(Vec::<&str>::new()).validate().is_err());
        assert!(SyncSetup::new(["A", "a"]).validate().is_err());
        assert!(SyncSetup::new(["A"])
            .with_filter(SyncFilter::new("B"))
            .validate()
            .is_err());
        assert!(SyncSetup::new(["A", "sales.B"])
            .with_filter(SyncFilter::new("sales.B"))
            .validate()
            .is_ok());
    }

    #[test]
    fn missing_required_parameter() {
        let setup = SyncSetup::new(["Order"]).with_filter(
            SyncFilter::new("Order")
                .with_parameter(FilterParameter::new("customer_id", DataType::Integer)),
        );

        assert!(setup.check_parameters(&SyncParameters::new()).is_err());
        assert!(setup
            .check_parameters(&SyncParameters::new().with("CUSTOMER_ID", 4i64))
            .is_ok());
    }

    #[test]
    fn optional_parameter_may_be_omitted() {
        let setup = SyncSetup::new(["Order"]).with_filter(
            SyncFilter::new("Order")
                .with_parameter(FilterParameter::new("region", DataType::Text).optional()),
        );
        assert!(setup.check_parameters(&SyncParameters::new()).is_ok());
    }

    #[test]
    fn signature_tracks_content() {
        let a = SyncSetup::new(["A", "B"]);
        let b = SyncSetup::new(["A", "B"]);
        let c = SyncSetup::new(["A", "C"]);
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn cache_key_is_order_independent() {
        let a = SyncParameters::new().with("tenant", "t/1").with("region", 3i64);
        let b = SyncParameters::new().with("region", 3i64).with("tenant", "t/1");
        assert_eq!(a.cache_key(), b.cache_key());
        assert!(!a.cache_key().contains('/'));
        assert_eq!(SyncParameters::new().cache_key(), "ALL");
    }

    #[test]
    fn set_replaces_existing() {
        let mut params = SyncParameters::new().with("a", 1i64);
        params.set("A", 2i64);
        assert_eq!(params.get("a"), Some(&SyncValue::Integer(2)));
        assert_eq!(params.iter().count(), 1);
    }
}
