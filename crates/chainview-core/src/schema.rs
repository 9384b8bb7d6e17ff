//! Schema generator and differ.
//!
//! [`generate`] turns a view's table schema into an ordered list of
//! [`DdlStatement`]s plus a content hash. [`diff`] compares two table schemas;
//! [`migration`] turns an additive diff into in-place DDL.

use indexmap::IndexMap;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::definition::{ColumnDef, ColumnType, TableDef, TableSchema};
use crate::error::ViewError;
use crate::sql::{
    short_digest, validate_identifier, ColumnDefault, ColumnSpec, DdlStatement, SqlType,
    COL_BLOCK_HEIGHT, COL_CREATED_AT, COL_ID, COL_TX_ID, MAX_IDENTIFIER_LEN,
};

/// DDL for a whole view plus the hash of its table schema.
#[derive(Debug, Clone)]
pub struct GeneratedSchema {
    pub schema_name: String,
    pub statements: Vec<DdlStatement>,
    pub hash: String,
}

impl GeneratedSchema {
    /// Render every statement as Postgres SQL.
    pub fn sql(&self) -> Result<Vec<String>, ViewError> {
        self.statements.iter().map(DdlStatement::to_sql).collect()
    }
}

/// Generate the full DDL for `tables` inside `schema_name`.
pub fn generate(tables: &TableSchema, schema_name: &str) -> Result<GeneratedSchema, ViewError> {
    validate_identifier("schema", schema_name)?;
    let mut statements = vec![DdlStatement::CreateSchema {
        schema: schema_name.to_string(),
    }];
    for (table, def) in tables {
        statements.extend(table_ddl(schema_name, table, def)?);
    }
    Ok(GeneratedSchema {
        schema_name: schema_name.to_string(),
        statements,
        hash: schema_hash(tables),
    })
}

/// `CREATE TABLE` plus the full index set for one table.
pub fn table_ddl(schema: &str, table: &str, def: &TableDef) -> Result<Vec<DdlStatement>, ViewError> {
    validate_identifier("table", table)?;
    let mut columns = system_columns();
    for (name, col) in &def.columns {
        validate_identifier("column", name)?;
        columns.push(user_column(name, col, false));
    }
    let mut statements = vec![DdlStatement::CreateTable {
        schema: schema.to_string(),
        table: table.to_string(),
        columns,
    }];
    statements.extend(index_ddl(schema, table, def));
    Ok(statements)
}

/// Every index a table should carry, in a fixed order, without duplicates.
pub fn index_ddl(schema: &str, table: &str, def: &TableDef) -> Vec<DdlStatement> {
    let mut wanted: Vec<(Vec<String>, bool)> = vec![
        (vec![COL_BLOCK_HEIGHT.into()], false),
        (vec![COL_TX_ID.into()], false),
    ];
    for (name, col) in &def.columns {
        if col.indexed {
            wanted.push((vec![name.clone()], false));
        }
    }
    wanted.extend(def.indexes.iter().map(|columns| (columns.clone(), false)));
    wanted.extend(def.unique_keys.iter().map(|columns| (columns.clone(), true)));

    let mut statements: Vec<DdlStatement> = Vec::with_capacity(wanted.len());
    for (columns, unique) in wanted {
        let name = index_name(table, &columns, unique);
        let seen = statements
            .iter()
            .any(|s| matches!(s, DdlStatement::CreateIndex { name: n, .. } if *n == name));
        if !seen {
            statements.push(DdlStatement::CreateIndex {
                schema: schema.to_string(),
                table: table.to_string(),
                name,
                columns,
                unique,
            });
        }
    }
    statements
}

/// Index names are derived from content: `<table>_<columns>_<idx|key>`, cut
/// to fit the identifier limit, then a digest of table, columns, and
/// uniqueness. Distinct indexes in one namespace never share a name, and an
/// unchanged index keeps its name across deploys.
pub fn index_name(table: &str, columns: &[String], unique: bool) -> String {
    let digest = short_digest(&format!("{table}|{}|{unique}", columns.join(",")));
    let label = columns
        .iter()
        .map(|c| c.trim_start_matches('_'))
        .collect::<Vec<_>>()
        .join("_");
    let prefix = format!("{table}_{label}_{}", if unique { "key" } else { "idx" });
    let mut cut = prefix.len().min(MAX_IDENTIFIER_LEN - digest.len() - 1);
    while !prefix.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{digest}", &prefix[..cut])
}

fn index_names(table: &str, def: &TableDef) -> Vec<String> {
    index_ddl("", table, def)
        .into_iter()
        .filter_map(|s| match s {
            DdlStatement::CreateIndex { name, .. } => Some(name),
            _ => None,
        })
        .collect()
}

fn system_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec {
            name: COL_ID.into(),
            ty: SqlType::Serial,
            nullable: false,
            primary_key: true,
            default: None,
        },
        ColumnSpec {
            name: COL_BLOCK_HEIGHT.into(),
            ty: SqlType::BigInt,
            nullable: false,
            primary_key: false,
            default: None,
        },
        ColumnSpec {
            name: COL_TX_ID.into(),
            ty: SqlType::User(ColumnType::Text),
            nullable: false,
            primary_key: false,
            default: None,
        },
        ColumnSpec {
            name: COL_CREATED_AT.into(),
            ty: SqlType::User(ColumnType::Timestamp),
            nullable: false,
            primary_key: false,
            default: Some(ColumnDefault::Now),
        },
    ]
}

/// Spec for a user column. With `backfill`, a non-nullable column without a
/// declared default gets a type-appropriate one so existing rows stay valid.
fn user_column(name: &str, col: &ColumnDef, backfill: bool) -> ColumnSpec {
    let default = match &col.default {
        Some(v) => Some(ColumnDefault::Literal(v.clone())),
        None if backfill && !col.nullable => Some(type_default(col.ty)),
        None => None,
    };
    ColumnSpec {
        name: name.to_string(),
        ty: SqlType::User(col.ty),
        nullable: col.nullable,
        primary_key: false,
        default,
    }
}

fn type_default(ty: ColumnType) -> ColumnDefault {
    match ty {
        ColumnType::Text | ColumnType::Principal => ColumnDefault::Literal(json!("")),
        ColumnType::Uint | ColumnType::Int => ColumnDefault::Literal(json!(0)),
        ColumnType::Boolean => ColumnDefault::Literal(json!(false)),
        ColumnType::Timestamp => ColumnDefault::Now,
        ColumnType::Jsonb => ColumnDefault::Literal(json!({})),
    }
}

// ─── Hash ────────────────────────────────────────────────────────────────────

/// SHA-256 (hex) of the canonical JSON rendering of a table schema.
///
/// Object keys are sorted recursively, so the hash depends only on content.
pub fn schema_hash(tables: &TableSchema) -> String {
    let value = serde_json::to_value(tables).unwrap_or(Value::Null);
    let canonical = canonical_json(&value);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{body}]")
        }
        other => other.to_string(),
    }
}

// ─── Diff ────────────────────────────────────────────────────────────────────

/// Changes to a table present in both schemas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Columns whose type, nullability, or default changed.
    pub changed: Vec<String>,
    /// Indexes the incoming table no longer declares.
    pub dropped_indexes: Vec<String>,
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
            && self.dropped_indexes.is_empty()
    }
}

/// Difference between a registered schema and an incoming one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    pub added_tables: Vec<String>,
    pub removed_tables: Vec<String>,
    /// Only tables with at least one column or index change.
    pub tables: IndexMap<String, TableDiff>,
}

impl SchemaDiff {
    /// A table/column removal or a column change cannot be applied in place.
    pub fn is_breaking(&self) -> bool {
        !self.removed_tables.is_empty()
            || self
                .tables
                .values()
                .any(|t| !t.removed.is_empty() || !t.changed.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.added_tables.is_empty() && self.removed_tables.is_empty() && self.tables.is_empty()
    }

    /// `table.column` for every removed column.
    pub fn removed_columns(&self) -> Vec<String> {
        self.qualified(|t| &t.removed)
    }

    /// `table.column` for every changed column.
    pub fn changed_columns(&self) -> Vec<String> {
        self.qualified(|t| &t.changed)
    }

    fn qualified(&self, pick: impl Fn(&TableDiff) -> &Vec<String>) -> Vec<String> {
        self.tables
            .iter()
            .flat_map(|(table, diff)| pick(diff).iter().map(move |c| format!("{table}.{c}")))
            .collect()
    }
}

/// Compare two table schemas.
pub fn diff(existing: &TableSchema, incoming: &TableSchema) -> SchemaDiff {
    let mut out = SchemaDiff::default();
    for table in incoming.keys() {
        if !existing.contains_key(table) {
            out.added_tables.push(table.clone());
        }
    }
    for (table, old) in existing {
        let Some(new) = incoming.get(table) else {
            out.removed_tables.push(table.clone());
            continue;
        };
        let mut table_diff = TableDiff::default();
        for (col, new_def) in &new.columns {
            match old.columns.get(col) {
                None => table_diff.added.push(col.clone()),
                Some(old_def) if !same_storage(old_def, new_def) => table_diff.changed.push(col.clone()),
                Some(_) => {}
            }
        }
        for col in old.columns.keys() {
            if !new.columns.contains_key(col) {
                table_diff.removed.push(col.clone());
            }
        }
        let kept = index_names(table, new);
        table_diff.dropped_indexes = index_names(table, old)
            .into_iter()
            .filter(|name| !kept.contains(name))
            .collect();
        if !table_diff.is_empty() {
            out.tables.insert(table.clone(), table_diff);
        }
    }
    out
}

/// `indexed` only decides which indexes exist; it never changes stored data.
fn same_storage(a: &ColumnDef, b: &ColumnDef) -> bool {
    a.ty == b.ty && a.nullable == b.nullable && a.default == b.default
}

/// In-place DDL for an additive diff: new tables with their index set, new
/// columns (backfilled with defaults), drops of undeclared indexes, and the
/// index set of every surviving table so newly declared indexes appear.
pub fn migration(
    schema_name: &str,
    diff: &SchemaDiff,
    incoming: &TableSchema,
) -> Result<Vec<DdlStatement>, ViewError> {
    let mut statements = vec![DdlStatement::CreateSchema {
        schema: schema_name.to_string(),
    }];
    for (table, def) in incoming {
        if diff.added_tables.contains(table) {
            statements.extend(table_ddl(schema_name, table, def)?);
            continue;
        }
        if let Some(table_diff) = diff.tables.get(table) {
            for col in &table_diff.added {
                validate_identifier("column", col)?;
                statements.push(DdlStatement::AddColumn {
                    schema: schema_name.to_string(),
                    table: table.clone(),
                    column: user_column(col, &def.columns[col], true),
                });
            }
            for name in &table_diff.dropped_indexes {
                statements.push(DdlStatement::DropIndex {
                    schema: schema_name.to_string(),
                    name: name.clone(),
                });
            }
        }
        statements.extend(index_ddl(schema_name, table, def));
    }
    Ok(statements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ColumnDef;

    fn trades() -> TableSchema {
        let mut s = TableSchema::new();
        s.insert(
            "trades".into(),
            TableDef::new()
                .column("trader", ColumnDef::new(ColumnType::Principal).indexed())
                .column("amount", ColumnDef::new(ColumnType::Uint))
                .column("memo", ColumnDef::new(ColumnType::Text).nullable())
                .index(&["trader", "amount"])
                .unique_key(&["trader"]),
        );
        s
    }

    #[test]
    fn generates_ordered_ddl() {
        let generated = generate(&trades(), "view_dex").unwrap();
        let sql = generated.sql().unwrap();
        assert_eq!(sql[0], r#"CREATE SCHEMA IF NOT EXISTS "view_dex""#);
        let create = &sql[1];
        let order: Vec<usize> = [
            r#""_id" SERIAL PRIMARY KEY"#,
            r#""_block_height" BIGINT NOT NULL"#,
            r#""_tx_id" TEXT NOT NULL"#,
            r#""_created_at" TIMESTAMPTZ NOT NULL DEFAULT NOW()"#,
            r#""trader" TEXT NOT NULL"#,
            r#""amount" NUMERIC NOT NULL"#,
            r#""memo" TEXT"#,
        ]
        .iter()
        .map(|frag| create.find(frag).unwrap_or_else(|| panic!("missing {frag}")))
        .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        assert!(!create.contains(r#""memo" TEXT NOT NULL"#));

        let rest = &sql[2..];
        assert_eq!(rest.len(), 5);
        assert!(rest[0].contains(r#""trades_block_height_idx_"#));
        assert!(rest[0].ends_with(r#"ON "view_dex"."trades" ("_block_height")"#));
        assert!(rest[1].contains(r#""trades_tx_id_idx_"#));
        assert!(rest[2].contains(r#""trades_trader_idx_"#));
        assert!(rest[3].ends_with(r#"ON "view_dex"."trades" ("trader", "amount")"#));
        assert!(rest[4].starts_with(r#"CREATE UNIQUE INDEX IF NOT EXISTS "trades_trader_key_"#));
    }

    #[test]
    fn hash_is_stable_and_order_independent() {
        let a = trades();
        assert_eq!(schema_hash(&a), schema_hash(&a.clone()));

        let mut b = TableSchema::new();
        b.insert("extra".into(), TableDef::new().column("x", ColumnDef::new(ColumnType::Int)));
        b.insert("trades".into(), a["trades"].clone());
        let mut c = TableSchema::new();
        c.insert("trades".into(), a["trades"].clone());
        c.insert("extra".into(), TableDef::new().column("x", ColumnDef::new(ColumnType::Int)));
        assert_eq!(schema_hash(&b), schema_hash(&c));
    }

    #[test]
    fn hash_changes_with_any_column_attribute() {
        let base = schema_hash(&trades());
        let variants: Vec<Box<dyn Fn(&mut ColumnDef)>> = vec![
            Box::new(|c: &mut ColumnDef| c.ty = ColumnType::Int),
            Box::new(|c: &mut ColumnDef| c.nullable = true),
            Box::new(|c: &mut ColumnDef| c.indexed = true),
            Box::new(|c: &mut ColumnDef| c.default = Some(json!(1))),
        ];
        for mutate in variants {
            let mut s = trades();
            mutate(&mut s["trades"].columns["amount"]);
            assert_ne!(schema_hash(&s), base);
        }
        let mut added = trades();
        added["trades"]
            .columns
            .insert("fee".into(), ColumnDef::new(ColumnType::Uint));
        assert_ne!(schema_hash(&added), base);
    }

    #[test]
    fn rejects_unsafe_schema_name() {
        assert!(generate(&trades(), "view-dex").is_err());
    }

    #[test]
    fn diff_detects_additions() {
        let old = trades();
        let mut new = trades();
        new["trades"]
            .columns
            .insert("fee".into(), ColumnDef::new(ColumnType::Uint));
        new.insert("pools".into(), TableDef::new().column("id", ColumnDef::new(ColumnType::Text)));

        let d = diff(&old, &new);
        assert_eq!(d.added_tables, vec!["pools"]);
        assert_eq!(d.tables["trades"].added, vec!["fee"]);
        assert!(!d.is_breaking());
        assert!(diff(&old, &old).is_empty());
    }

    #[test]
    fn diff_detects_breaking_changes() {
        let old = trades();
        let mut new = trades();
        new["trades"].columns.shift_remove("memo");
        new["trades"].columns["amount"].nullable = true;
        let d = diff(&old, &new);
        assert!(d.is_breaking());
        assert_eq!(d.removed_columns(), vec!["trades.memo"]);
        assert_eq!(d.changed_columns(), vec!["trades.amount"]);

        let d = diff(&old, &TableSchema::new());
        assert_eq!(d.removed_tables, vec!["trades"]);
        assert!(d.is_breaking());
    }

    #[test]
    fn migration_backfills_non_nullable_columns() {
        let old = trades();
        let mut new = trades();
        new["trades"]
            .columns
            .insert("fee".into(), ColumnDef::new(ColumnType::Uint));
        new["trades"]
            .columns
            .insert("note".into(), ColumnDef::new(ColumnType::Text).nullable());
        let d = diff(&old, &new);
        let sql: Vec<String> = migration("view_dex", &d, &new)
            .unwrap()
            .iter()
            .map(|s| s.to_sql().unwrap())
            .collect();
        assert!(sql.contains(
            &r#"ALTER TABLE "view_dex"."trades" ADD COLUMN IF NOT EXISTS "fee" NUMERIC NOT NULL DEFAULT 0"#
                .to_string()
        ));
        assert!(sql.contains(
            &r#"ALTER TABLE "view_dex"."trades" ADD COLUMN IF NOT EXISTS "note" TEXT"#.to_string()
        ));
        assert!(!sql.iter().any(|s| s.starts_with("CREATE TABLE")));
    }

    fn created_index_names(statements: &[DdlStatement]) -> Vec<String> {
        statements
            .iter()
            .filter_map(|s| match s {
                DdlStatement::CreateIndex { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn index_names_are_unique_in_a_namespace() {
        let mut s = TableSchema::new();
        s.insert(
            "trades".into(),
            TableDef::new()
                .column("tx_id", ColumnDef::new(ColumnType::Text).indexed())
                .column("block_height", ColumnDef::new(ColumnType::Uint).indexed())
                .column("b_c", ColumnDef::new(ColumnType::Text).indexed()),
        );
        s.insert(
            "trades_b".into(),
            TableDef::new().column("c", ColumnDef::new(ColumnType::Text).indexed()),
        );
        let generated = generate(&s, "view_dex").unwrap();
        let names = created_index_names(&generated.statements);
        assert_eq!(names.len(), 8);
        let mut distinct = names.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), names.len(), "duplicate index name in {names:?}");
    }

    #[test]
    fn long_table_names_yield_valid_index_names() {
        let table = "t".repeat(63);
        let mut s = TableSchema::new();
        s.insert(
            table.clone(),
            TableDef::new()
                .column("counterparty", ColumnDef::new(ColumnType::Principal).indexed())
                .unique_key(&["counterparty"]),
        );
        let generated = generate(&s, "view_dex").unwrap();
        generated.sql().unwrap();
        let names = created_index_names(&generated.statements);
        assert_eq!(names.len(), 4);
        assert!(names.iter().all(|n| n.len() <= MAX_IDENTIFIER_LEN));
        let mut distinct = names.clone();
        distinct.dedup();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn duplicate_index_declarations_collapse() {
        let mut s = trades();
        s["trades"].indexes.push(vec!["trader".into()]);
        let names = created_index_names(&generate(&s, "view_dex").unwrap().statements);
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn removed_unique_key_and_index_are_dropped_in_place() {
        let old = trades();
        let mut new = trades();
        new["trades"].unique_keys.clear();
        new["trades"].columns["trader"].indexed = false;

        let d = diff(&old, &new);
        assert!(!d.is_breaking());
        let dropped = &d.tables["trades"].dropped_indexes;
        assert_eq!(
            dropped,
            &vec![
                index_name("trades", &["trader".to_string()], false),
                index_name("trades", &["trader".to_string()], true),
            ]
        );

        let statements = migration("view_dex", &d, &new).unwrap();
        let drops: Vec<String> = statements
            .iter()
            .filter(|s| matches!(s, DdlStatement::DropIndex { .. }))
            .map(|s| s.to_sql().unwrap())
            .collect();
        assert_eq!(drops.len(), 2);
        assert!(drops[1].starts_with(r#"DROP INDEX IF EXISTS "view_dex"."trades_trader_key_"#));
        assert!(!created_index_names(&statements).iter().any(|n| dropped.contains(n)));
    }
}
