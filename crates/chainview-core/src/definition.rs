//! View definitions — the user-authored description of a materialized view.
//!
//! A definition is parsed from JSON, validated as a whole with
//! [`ViewDefinition::validate`], and only then handed to the schema generator.
//! Nothing here touches the database.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ViewError;
use crate::sql::{bounded_identifier, validate_identifier, SYSTEM_COLUMNS};

/// Lowercase alphanumerics and hyphens, starting with an alphanumeric.
static VIEW_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,62}$").expect("view name regex"));

/// Table name → table definition, in declaration order.
pub type TableSchema = IndexMap<String, TableDef>;

// ─── ViewDefinition ──────────────────────────────────────────────────────────

/// A complete view definition, immutable per deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub sources: Vec<Source>,
    pub schema: TableSchema,
}

fn default_version() -> u32 {
    1
}

impl ViewDefinition {
    /// Parse a definition from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ViewError> {
        serde_json::from_str(text).map_err(|e| ViewError::invalid(e.to_string()))
    }

    /// The namespace this view's tables live in unless overridden at deploy:
    /// `view_` followed by the name with hyphens turned into underscores,
    /// shortened to the identifier limit for very long names.
    pub fn default_schema_name(&self) -> String {
        bounded_identifier(&format!("view_{}", self.name.replace('-', "_")))
    }

    /// The source keys this view routes on, in declaration order, deduplicated.
    pub fn source_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for source in &self.sources {
            let key = source.key();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Check every structural invariant. Runs before any DDL is generated.
    pub fn validate(&self) -> Result<(), ViewError> {
        if !VIEW_NAME.is_match(&self.name) {
            return Err(ViewError::invalid(format!(
                "view name '{}' must be lowercase alphanumerics and hyphens (max 63 chars)",
                self.name
            )));
        }
        if self.sources.is_empty() {
            return Err(ViewError::invalid("at least one source is required"));
        }
        for source in &self.sources {
            source.validate()?;
        }
        if self.schema.is_empty() {
            return Err(ViewError::invalid("schema must declare at least one table"));
        }
        for (table, def) in &self.schema {
            validate_identifier("table", table)?;
            def.validate(table)?;
        }
        Ok(())
    }
}

// ─── Source ──────────────────────────────────────────────────────────────────

/// A filter selecting the transactions/events a view cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSource", into = "RawSource")]
pub enum Source {
    /// Calls into (or events emitted by) a contract.
    Contract {
        contract: String,
        function: Option<String>,
        event: Option<String>,
    },
    /// Transactions of a given type, e.g. plain token transfers.
    TransactionType {
        tx_type: String,
        /// Minimum `amount` an event must carry to qualify.
        min_amount: Option<u64>,
    },
}

impl Source {
    /// Source on a contract (glob allowed).
    pub fn contract(contract: impl Into<String>) -> Self {
        Self::Contract {
            contract: contract.into(),
            function: None,
            event: None,
        }
    }

    /// Source on a transaction type (glob allowed).
    pub fn tx_type(tx_type: impl Into<String>) -> Self {
        Self::TransactionType {
            tx_type: tx_type.into(),
            min_amount: None,
        }
    }

    /// Narrow a contract source to one function.
    pub fn function(mut self, name: impl Into<String>) -> Self {
        if let Self::Contract { function, .. } = &mut self {
            *function = Some(name.into());
        }
        self
    }

    /// Narrow a contract source to one event type / topic.
    pub fn event(mut self, name: impl Into<String>) -> Self {
        if let Self::Contract { event, .. } = &mut self {
            *event = Some(name.into());
        }
        self
    }

    /// Require a minimum event amount on a type source.
    pub fn min_amount(mut self, amount: u64) -> Self {
        if let Self::TransactionType { min_amount, .. } = &mut self {
            *min_amount = Some(amount);
        }
        self
    }

    /// The routing key for handlers: `contract::function`, `contract::event`,
    /// bare `contract`, or bare `type`.
    pub fn key(&self) -> String {
        match self {
            Self::Contract {
                contract,
                function: Some(f),
                ..
            } => format!("{contract}::{f}"),
            Self::Contract {
                contract,
                event: Some(e),
                ..
            } => format!("{contract}::{e}"),
            Self::Contract { contract, .. } => contract.clone(),
            Self::TransactionType { tx_type, .. } => tx_type.clone(),
        }
    }

    fn validate(&self) -> Result<(), ViewError> {
        let empty = match self {
            Self::Contract {
                contract,
                function,
                event,
            } => {
                contract.is_empty()
                    || function.as_deref() == Some("")
                    || event.as_deref() == Some("")
            }
            Self::TransactionType { tx_type, .. } => tx_type.is_empty(),
        };
        if empty {
            return Err(ViewError::invalid(format!(
                "source '{}' has an empty filter",
                self.key()
            )));
        }
        Ok(())
    }
}

/// Wire shape of a source, before it is known which kind it is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    contract: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    tx_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_amount: Option<u64>,
}

impl TryFrom<RawSource> for Source {
    type Error = String;

    fn try_from(raw: RawSource) -> Result<Self, Self::Error> {
        match (raw.contract, raw.tx_type) {
            (Some(contract), None) => Ok(Source::Contract {
                contract,
                function: raw.function,
                event: raw.event,
            }),
            (None, Some(tx_type)) => Ok(Source::TransactionType {
                tx_type,
                min_amount: raw.min_amount,
            }),
            (Some(_), Some(_)) => {
                Err("source must declare either `contract` or `type`, not both".into())
            }
            (None, None) => Err("source must declare either `contract` or `type`".into()),
        }
    }
}

impl From<Source> for RawSource {
    fn from(source: Source) -> Self {
        match source {
            Source::Contract {
                contract,
                function,
                event,
            } => RawSource {
                contract: Some(contract),
                function,
                event,
                ..Default::default()
            },
            Source::TransactionType {
                tx_type,
                min_amount,
            } => RawSource {
                tx_type: Some(tx_type),
                min_amount,
                ..Default::default()
            },
        }
    }
}

// ─── Tables ──────────────────────────────────────────────────────────────────

/// Column types a view may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Uint,
    Int,
    Principal,
    Boolean,
    Timestamp,
    Jsonb,
}

impl ColumnType {
    /// Postgres type used for this column.
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Text | Self::Principal => "TEXT",
            Self::Uint | Self::Int => "NUMERIC",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMPTZ",
            Self::Jsonb => "JSONB",
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Text => "text",
            Self::Uint => "uint",
            Self::Int => "int",
            Self::Principal => "principal",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Jsonb => "jsonb",
        };
        f.write_str(s)
    }
}

/// A user column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default, skip_serializing_if = "is_false")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub indexed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ColumnDef {
    pub fn new(ty: ColumnType) -> Self {
        Self {
            ty,
            nullable: false,
            indexed: false,
            default: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A table: ordered columns plus optional composite indexes and unique keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDef {
    pub columns: IndexMap<String, ColumnDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<Vec<String>>,
    /// Column groups with a unique constraint; required for conflict-resolving upserts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unique_keys: Vec<Vec<String>>,
}

impl TableDef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(mut self, name: impl Into<String>, def: ColumnDef) -> Self {
        self.columns.insert(name.into(), def);
        self
    }

    pub fn index(mut self, columns: &[&str]) -> Self {
        self.indexes
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn unique_key(mut self, columns: &[&str]) -> Self {
        self.unique_keys
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// The unique-key group whose column set equals `columns`, if any.
    pub fn unique_key_for(&self, columns: &[String]) -> Option<&Vec<String>> {
        self.unique_keys.iter().find(|group| {
            group.len() == columns.len() && group.iter().all(|c| columns.contains(c))
        })
    }

    fn validate(&self, table: &str) -> Result<(), ViewError> {
        if self.columns.is_empty() {
            return Err(ViewError::invalid(format!(
                "table '{table}' must declare at least one column"
            )));
        }
        for (name, def) in &self.columns {
            validate_identifier("column", name)?;
            if name.starts_with('_') || SYSTEM_COLUMNS.contains(&name.as_str()) {
                return Err(ViewError::invalid(format!(
                    "column '{table}.{name}' is reserved: names starting with '_' belong to system columns"
                )));
            }
            if let Some(Value::Null) = def.default {
                if !def.nullable {
                    return Err(ViewError::invalid(format!(
                        "column '{table}.{name}' is not nullable but defaults to null"
                    )));
                }
            }
        }
        for (kind, groups) in [("index", &self.indexes), ("unique key", &self.unique_keys)] {
            for group in groups {
                if group.is_empty() {
                    return Err(ViewError::invalid(format!(
                        "table '{table}' declares an empty {kind}"
                    )));
                }
                for column in group {
                    if !self.columns.contains_key(column) {
                        return Err(ViewError::invalid(format!(
                            "{kind} on '{table}' references unknown column '{column}'"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transfers_json() -> Value {
        json!({
            "name": "token-transfers",
            "version": 2,
            "sources": [
                {"contract": "SP000.token", "event": "ft_transfer_event"},
                {"type": "token_transfer", "minAmount": 1000000}
            ],
            "schema": {
                "transfers": {
                    "columns": {
                        "sender": {"type": "principal", "indexed": true},
                        "recipient": {"type": "principal"},
                        "amount": {"type": "uint"},
                        "memo": {"type": "text", "nullable": true}
                    },
                    "indexes": [["sender", "recipient"]],
                    "uniqueKeys": [["sender", "recipient"]]
                }
            }
        })
    }

    #[test]
    fn parses_and_validates() {
        let def: ViewDefinition = serde_json::from_value(transfers_json()).unwrap();
        def.validate().unwrap();
        assert_eq!(def.version, 2);
        assert_eq!(def.default_schema_name(), "view_token_transfers");

        let mut long = def.clone();
        long.name = "a".repeat(63);
        long.validate().unwrap();
        assert_eq!(long.default_schema_name().len(), 63);
        assert_eq!(
            def.source_keys(),
            vec!["SP000.token::ft_transfer_event", "token_transfer"]
        );
        let cols: Vec<_> = def.schema["transfers"].columns.keys().cloned().collect();
        assert_eq!(cols, vec!["sender", "recipient", "amount", "memo"]);
    }

    #[test]
    fn source_needs_contract_or_type() {
        let err = serde_json::from_value::<Source>(json!({"function": "swap"})).unwrap_err();
        assert!(err.to_string().contains("either `contract` or `type`"));
        let err =
            serde_json::from_value::<Source>(json!({"contract": "a", "type": "b"})).unwrap_err();
        assert!(err.to_string().contains("not both"));
    }

    #[test]
    fn source_keys() {
        assert_eq!(Source::contract("SP1.dex").function("swap").key(), "SP1.dex::swap");
        assert_eq!(Source::contract("SP1.dex").event("print").key(), "SP1.dex::print");
        assert_eq!(Source::contract("SP1.dex").key(), "SP1.dex");
        assert_eq!(Source::contract("*").key(), "*");
        assert_eq!(Source::tx_type("token_transfer").min_amount(5).key(), "token_transfer");
    }

    #[test]
    fn rejects_bad_names_and_empty_schema() {
        let mut def: ViewDefinition = serde_json::from_value(transfers_json()).unwrap();
        def.name = "Bad_Name".into();
        assert!(def.validate().unwrap_err().is_validation());

        let mut def: ViewDefinition = serde_json::from_value(transfers_json()).unwrap();
        def.schema.clear();
        assert!(def.validate().unwrap_err().to_string().contains("at least one table"));
    }

    #[test]
    fn rejects_unsupported_column_type() {
        let mut raw = transfers_json();
        raw["schema"]["transfers"]["columns"]["amount"]["type"] = json!("float");
        let err = ViewDefinition::from_json(&raw.to_string()).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn rejects_reserved_and_unsafe_columns() {
        let mut def: ViewDefinition = serde_json::from_value(transfers_json()).unwrap();
        def.schema["transfers"]
            .columns
            .insert("_block_height".into(), ColumnDef::new(ColumnType::Uint));
        assert!(def.validate().unwrap_err().to_string().contains("reserved"));

        let mut def: ViewDefinition = serde_json::from_value(transfers_json()).unwrap();
        def.schema["transfers"]
            .columns
            .insert("amount\"; DROP TABLE x; --".into(), ColumnDef::new(ColumnType::Text));
        assert!(matches!(
            def.validate().unwrap_err(),
            ViewError::InvalidIdentifier { kind: "column", .. }
        ));
    }

    #[test]
    fn rejects_index_on_unknown_column() {
        let mut def: ViewDefinition = serde_json::from_value(transfers_json()).unwrap();
        def.schema["transfers"].indexes.push(vec!["nope".into()]);
        assert!(def.validate().unwrap_err().to_string().contains("unknown column 'nope'"));
    }

    #[test]
    fn unique_key_lookup_is_order_insensitive() {
        let table = TableDef::new()
            .column("a", ColumnDef::new(ColumnType::Text))
            .column("b", ColumnDef::new(ColumnType::Text))
            .unique_key(&["a", "b"]);
        assert!(table.unique_key_for(&["b".into(), "a".into()]).is_some());
        assert!(table.unique_key_for(&["a".into()]).is_none());
    }

    #[test]
    fn source_serializes_back_to_wire_shape() {
        let v = serde_json::to_value(Source::tx_type("token_transfer").min_amount(7)).unwrap();
        assert_eq!(v, json!({"type": "token_transfer", "minAmount": 7}));
    }
}
