//! Statement model and Postgres rendering.
//!
//! The engine never builds SQL by string concatenation outside this module.
//! DDL and writes are first expressed as [`DdlStatement`] / [`WriteStatement`]
//! values; the Postgres backend renders them with `to_sql`, while the
//! in-memory backend interprets them structurally. Every identifier is checked
//! against [`IDENTIFIER`] at render time and every value is literal-escaped.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::definition::ColumnType;
use crate::error::ViewError;

/// A row (or a filter / assignment set): column name → JSON value.
pub type Row = Map<String, Value>;

/// Lowercase identifiers, at most 63 bytes (the Postgres limit).
pub static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").expect("identifier regex"));

/// Postgres truncates longer identifiers; we reject them instead.
pub const MAX_IDENTIFIER_LEN: usize = 63;

pub const COL_ID: &str = "_id";
pub const COL_BLOCK_HEIGHT: &str = "_block_height";
pub const COL_TX_ID: &str = "_tx_id";
pub const COL_CREATED_AT: &str = "_created_at";

/// System columns, in the fixed order they lead every generated table.
pub const SYSTEM_COLUMNS: [&str; 4] = [COL_ID, COL_BLOCK_HEIGHT, COL_TX_ID, COL_CREATED_AT];

/// Fail unless `name` is a safe identifier.
pub fn validate_identifier(kind: &'static str, name: &str) -> Result<(), ViewError> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(ViewError::InvalidIdentifier {
            kind,
            name: name.to_string(),
        })
    }
}

/// First 8 hex digits of the SHA-256 of `text`.
pub fn short_digest(text: &str) -> String {
    hex::encode(&Sha256::digest(text.as_bytes())[..4])
}

/// `name` when it fits [`MAX_IDENTIFIER_LEN`], otherwise a prefix of it
/// followed by `_` and the [`short_digest`] of the whole name.
pub fn bounded_identifier(name: &str) -> String {
    if name.len() <= MAX_IDENTIFIER_LEN {
        return name.to_string();
    }
    let digest = short_digest(name);
    let mut cut = MAX_IDENTIFIER_LEN - digest.len() - 1;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{digest}", &name[..cut])
}

/// Validate and double-quote an identifier.
pub fn quote_ident(kind: &'static str, name: &str) -> Result<String, ViewError> {
    validate_identifier(kind, name)?;
    Ok(format!("\"{name}\""))
}

/// `"schema"."table"`, both validated.
pub fn qualified(schema: &str, table: &str) -> Result<String, ViewError> {
    Ok(format!(
        "{}.{}",
        quote_ident("schema", schema)?,
        quote_ident("table", table)?
    ))
}

/// Render a JSON value as a SQL literal.
///
/// Strings are single-quote escaped, objects and arrays are serialized to JSON
/// text and quoted, numbers / booleans / null pass through.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_str(s),
        Value::Array(_) | Value::Object(_) => quote_str(&value.to_string()),
    }
}

fn quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

// ─── DDL ─────────────────────────────────────────────────────────────────────

/// Storage type of a generated column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    /// Auto-incrementing primary key.
    Serial,
    BigInt,
    /// A user column type.
    User(ColumnType),
}

impl SqlType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Serial => "SERIAL",
            Self::BigInt => "BIGINT",
            Self::User(ty) => ty.sql_type(),
        }
    }
}

/// A column default.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnDefault {
    Literal(Value),
    /// The current time at insert.
    Now,
}

impl ColumnDefault {
    fn to_sql(&self) -> String {
        match self {
            Self::Literal(v) => literal(v),
            Self::Now => "NOW()".to_string(),
        }
    }
}

/// One column of a generated table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
    pub default: Option<ColumnDefault>,
}

impl ColumnSpec {
    fn to_sql(&self) -> Result<String, ViewError> {
        let mut sql = format!("{} {}", quote_ident("column", &self.name)?, self.ty.as_sql());
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
        } else if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&default.to_sql());
        }
        Ok(sql)
    }
}

/// A schema-changing statement.
#[derive(Debug, Clone, PartialEq)]
pub enum DdlStatement {
    CreateSchema {
        schema: String,
    },
    /// Drops the namespace and everything in it.
    DropSchema {
        schema: String,
    },
    CreateTable {
        schema: String,
        table: String,
        columns: Vec<ColumnSpec>,
    },
    AddColumn {
        schema: String,
        table: String,
        column: ColumnSpec,
    },
    CreateIndex {
        schema: String,
        table: String,
        name: String,
        columns: Vec<String>,
        unique: bool,
    },
    DropIndex {
        schema: String,
        name: String,
    },
}

impl DdlStatement {
    /// Render as Postgres DDL. All statements are idempotent.
    pub fn to_sql(&self) -> Result<String, ViewError> {
        match self {
            Self::CreateSchema { schema } => Ok(format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                quote_ident("schema", schema)?
            )),
            Self::DropSchema { schema } => Ok(format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                quote_ident("schema", schema)?
            )),
            Self::CreateTable {
                schema,
                table,
                columns,
            } => {
                let cols = columns
                    .iter()
                    .map(ColumnSpec::to_sql)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!(
                    "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
                    qualified(schema, table)?,
                    cols.join(",\n  ")
                ))
            }
            Self::AddColumn {
                schema,
                table,
                column,
            } => Ok(format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
                qualified(schema, table)?,
                column.to_sql()?
            )),
            Self::CreateIndex {
                schema,
                table,
                name,
                columns,
                unique,
            } => {
                let cols = columns
                    .iter()
                    .map(|c| quote_ident("column", c))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                    if *unique { "UNIQUE " } else { "" },
                    quote_ident("index", name)?,
                    qualified(schema, table)?,
                    cols.join(", ")
                ))
            }
            Self::DropIndex { schema, name } => Ok(format!(
                "DROP INDEX IF EXISTS {}.{}",
                quote_ident("schema", schema)?,
                quote_ident("index", name)?
            )),
        }
    }
}

// ─── Writes ──────────────────────────────────────────────────────────────────

/// Conflict target and update set of an upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct OnConflict {
    pub key: Vec<String>,
    /// Columns overwritten from the incoming row; empty means `DO NOTHING`.
    pub update: Vec<String>,
}

/// A fully resolved write against one table of a view's namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatement {
    Insert {
        table: String,
        row: Row,
        on_conflict: Option<OnConflict>,
    },
    Update {
        table: String,
        filter: Row,
        set: Row,
    },
    Delete {
        table: String,
        filter: Row,
    },
}

impl WriteStatement {
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. } | Self::Update { table, .. } | Self::Delete { table, .. } => {
                table
            }
        }
    }

    /// Render against `schema`.
    pub fn to_sql(&self, schema: &str) -> Result<String, ViewError> {
        match self {
            Self::Insert {
                table,
                row,
                on_conflict,
            } => {
                let mut names = Vec::with_capacity(row.len());
                let mut values = Vec::with_capacity(row.len());
                for (col, value) in row {
                    names.push(quote_ident("column", col)?);
                    values.push(literal(value));
                }
                let mut sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    qualified(schema, table)?,
                    names.join(", "),
                    values.join(", ")
                );
                if let Some(conflict) = on_conflict {
                    let key = conflict
                        .key
                        .iter()
                        .map(|c| quote_ident("column", c))
                        .collect::<Result<Vec<_>, _>>()?;
                    sql.push_str(&format!(" ON CONFLICT ({})", key.join(", ")));
                    if conflict.update.is_empty() {
                        sql.push_str(" DO NOTHING");
                    } else {
                        let sets = conflict
                            .update
                            .iter()
                            .map(|c| quote_ident("column", c).map(|q| format!("{q} = EXCLUDED.{q}")))
                            .collect::<Result<Vec<_>, _>>()?;
                        sql.push_str(&format!(" DO UPDATE SET {}", sets.join(", ")));
                    }
                }
                Ok(sql)
            }
            Self::Update { table, filter, set } => {
                let assignments = set
                    .iter()
                    .map(|(c, v)| quote_ident("column", c).map(|q| format!("{q} = {}", literal(v))))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!(
                    "UPDATE {} SET {}{}",
                    qualified(schema, table)?,
                    assignments.join(", "),
                    where_clause(filter)?
                ))
            }
            Self::Delete { table, filter } => Ok(format!(
                "DELETE FROM {}{}",
                qualified(schema, table)?,
                where_clause(filter)?
            )),
        }
    }
}

/// ` WHERE a = 1 AND b IS NULL`, or nothing for an empty filter.
pub fn where_clause(filter: &Row) -> Result<String, ViewError> {
    if filter.is_empty() {
        return Ok(String::new());
    }
    let conds = filter
        .iter()
        .map(|(c, v)| {
            let col = quote_ident("column", c)?;
            Ok(match v {
                Value::Null => format!("{col} IS NULL"),
                _ => format!("{col} = {}", literal(v)),
            })
        })
        .collect::<Result<Vec<_>, ViewError>>()?;
    Ok(format!(" WHERE {}", conds.join(" AND ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn identifiers() {
        assert!(validate_identifier("table", "transfers").is_ok());
        assert!(validate_identifier("table", "_private").is_ok());
        assert!(validate_identifier("table", "Transfers").is_err());
        assert!(validate_identifier("table", "1abc").is_err());
        assert!(validate_identifier("table", "a\"b").is_err());
        assert!(validate_identifier("table", &"a".repeat(64)).is_err());
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(literal(&json!("it's")), "'it''s'");
        assert_eq!(literal(&json!(5)), "5");
        assert_eq!(literal(&json!(true)), "TRUE");
        assert_eq!(literal(&Value::Null), "NULL");
        assert_eq!(literal(&json!({"k": "v'"})), r#"'{"k":"v''"}'"#);
        assert_eq!(literal(&json!([1, 2])), "'[1,2]'");
    }

    #[test]
    fn renders_upsert() {
        let stmt = WriteStatement::Insert {
            table: "balances".into(),
            row: row(json!({"owner": "SP1", "amount": 10})),
            on_conflict: Some(OnConflict {
                key: vec!["owner".into()],
                update: vec!["amount".into()],
            }),
        };
        let sql = stmt.to_sql("view_balances").unwrap();
        assert!(sql.starts_with(r#"INSERT INTO "view_balances"."balances" ("#));
        assert!(sql.ends_with(
            r#"ON CONFLICT ("owner") DO UPDATE SET "amount" = EXCLUDED."amount""#
        ));
    }

    #[test]
    fn renders_update_and_delete_filters() {
        let update = WriteStatement::Update {
            table: "t".into(),
            filter: row(json!({"id": "a'b", "gone": null})),
            set: row(json!({"n": 2})),
        };
        let sql = update.to_sql("s").unwrap();
        assert!(sql.starts_with(r#"UPDATE "s"."t" SET "n" = 2 WHERE "#));
        assert!(sql.contains(r#""id" = 'a''b'"#));
        assert!(sql.contains(r#""gone" IS NULL"#));

        let delete = WriteStatement::Delete {
            table: "t".into(),
            filter: row(json!({"_block_height": 101})),
        };
        assert_eq!(
            delete.to_sql("s").unwrap(),
            r#"DELETE FROM "s"."t" WHERE "_block_height" = 101"#
        );
    }

    #[test]
    fn rejects_unsafe_column_at_render_time() {
        let stmt = WriteStatement::Insert {
            table: "t".into(),
            row: row(json!({"x\"; DROP SCHEMA s; --": 1})),
            on_conflict: None,
        };
        assert!(matches!(
            stmt.to_sql("s"),
            Err(ViewError::InvalidIdentifier { kind: "column", .. })
        ));
    }

    #[test]
    fn renders_add_column_with_default() {
        let ddl = DdlStatement::AddColumn {
            schema: "s".into(),
            table: "t".into(),
            column: ColumnSpec {
                name: "flag".into(),
                ty: SqlType::User(ColumnType::Boolean),
                nullable: false,
                primary_key: false,
                default: Some(ColumnDefault::Literal(json!(false))),
            },
        };
        assert_eq!(
            ddl.to_sql().unwrap(),
            r#"ALTER TABLE "s"."t" ADD COLUMN IF NOT EXISTS "flag" BOOLEAN NOT NULL DEFAULT FALSE"#
        );
    }

    #[test]
    fn long_identifiers_are_shortened_with_a_digest() {
        assert_eq!(bounded_identifier("view_swaps"), "view_swaps");

        let long = format!("view_{}", "a".repeat(63));
        let bounded = bounded_identifier(&long);
        assert_eq!(bounded.len(), MAX_IDENTIFIER_LEN);
        assert!(bounded.ends_with(&format!("_{}", short_digest(&long))));
        assert!(validate_identifier("schema", &bounded).is_ok());

        let other = format!("view_{}b", "a".repeat(62));
        assert_ne!(bounded_identifier(&other), bounded);
    }

    #[test]
    fn renders_drop_index() {
        let ddl = DdlStatement::DropIndex {
            schema: "s".into(),
            name: "t_owner_key_0a1b2c3d".into(),
        };
        assert_eq!(
            ddl.to_sql().unwrap(),
            r#"DROP INDEX IF EXISTS "s"."t_owner_key_0a1b2c3d""#
        );
    }
}
