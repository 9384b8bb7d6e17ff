//! Schema deployer — creates, migrates, or rebuilds a view's namespace.
//!
//! Decision table for a deploy of `definition`:
//!
//! | registered? | hash equal | diff      | force | action      |
//! |-------------|------------|-----------|-------|-------------|
//! | no          |            |           |       | `Created`   |
//! | yes         | yes        |           | no    | `Unchanged` |
//! | yes         | yes        |           | yes   | `Reindexed` |
//! | yes         | no         | breaking  | no    | error       |
//! | yes         | no         | breaking  | yes   | `Reindexed` |
//! | yes         | no         | additive  | any   | `Updated`   |

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::definition::{TableSchema, ViewDefinition};
use crate::error::ViewError;
use crate::schema::{self, GeneratedSchema};
use crate::sql::{validate_identifier, DdlStatement};
use crate::store::ViewStore;
use crate::types::{RegisteredView, ViewRegistration, ViewStatus};

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Drop and rebuild the namespace even when the change is breaking or absent.
    pub force_reindex: bool,
    /// Namespace for a new view; ignored for an already registered one.
    pub schema_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployAction {
    Created,
    Unchanged,
    Updated,
    Reindexed,
}

impl DeployAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Unchanged => "unchanged",
            Self::Updated => "updated",
            Self::Reindexed => "reindexed",
        }
    }
}

impl std::fmt::Display for DeployAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub action: DeployAction,
    pub view_id: i64,
}

/// Deploy `definition` with its handler location.
pub async fn deploy(
    store: &dyn ViewStore,
    definition: &ViewDefinition,
    handler_path: &str,
    options: &DeployOptions,
) -> Result<DeployOutcome, ViewError> {
    definition.validate()?;
    if handler_path.trim().is_empty() {
        return Err(ViewError::invalid("handler location must not be empty"));
    }

    let existing = store.get_view(&definition.name).await?;
    let schema_name = resolve_schema_name(definition, existing.as_ref(), options)?;
    let generated = schema::generate(&definition.schema, &schema_name)?;

    let registration = |reset_progress: bool| ViewRegistration {
        definition: definition.clone(),
        schema_hash: generated.hash.clone(),
        handler_path: handler_path.to_string(),
        schema_name: schema_name.clone(),
        status: ViewStatus::Active,
        reset_progress,
    };

    let Some(existing) = existing else {
        let view_id = store.deploy(&generated.statements, &registration(true)).await?;
        info!(view = %definition.name, schema = %schema_name, hash = %generated.hash, "View created");
        return Ok(DeployOutcome {
            action: DeployAction::Created,
            view_id,
        });
    };

    if existing.schema_hash == generated.hash {
        if options.force_reindex {
            return rebuild(store, definition, &generated, registration(true)).await;
        }
        // No DDL; the stored definition and handler location still refresh.
        let view_id = store.deploy(&[], &registration(false)).await?;
        info!(view = %definition.name, "View unchanged");
        return Ok(DeployOutcome {
            action: DeployAction::Unchanged,
            view_id,
        });
    }

    let empty = TableSchema::new();
    let previous = existing
        .definition
        .as_ref()
        .map(|d| &d.schema)
        .unwrap_or(&empty);
    let diff = schema::diff(previous, &definition.schema);

    if diff.is_breaking() {
        if !options.force_reindex {
            return Err(ViewError::BreakingChange {
                view: definition.name.clone(),
                removed_tables: diff.removed_tables.clone(),
                removed_columns: diff.removed_columns(),
                changed_columns: diff.changed_columns(),
            });
        }
        return rebuild(store, definition, &generated, registration(true)).await;
    }

    let ddl = schema::migration(&schema_name, &diff, &definition.schema)?;
    let view_id = store.deploy(&ddl, &registration(false)).await?;
    info!(
        view = %definition.name,
        added_tables = ?diff.added_tables,
        altered_tables = ?diff.tables.keys().collect::<Vec<_>>(),
        statements = ddl.len(),
        "View migrated in place"
    );
    Ok(DeployOutcome {
        action: DeployAction::Updated,
        view_id,
    })
}

/// Drop the namespace and recreate it empty; the watermark resets to 0 so the
/// next catch-up replays from block 1.
async fn rebuild(
    store: &dyn ViewStore,
    definition: &ViewDefinition,
    generated: &GeneratedSchema,
    registration: ViewRegistration,
) -> Result<DeployOutcome, ViewError> {
    let ddl = rebuild_ddl(generated);
    let view_id = store.deploy(&ddl, &registration).await?;
    warn!(view = %definition.name, schema = %generated.schema_name, "View dropped and recreated; replaying from block 1");
    Ok(DeployOutcome {
        action: DeployAction::Reindexed,
        view_id,
    })
}

/// `DROP SCHEMA … CASCADE` followed by the full generated DDL.
pub fn rebuild_ddl(generated: &GeneratedSchema) -> Vec<DdlStatement> {
    let mut ddl = vec![DdlStatement::DropSchema {
        schema: generated.schema_name.clone(),
    }];
    ddl.extend(generated.statements.iter().cloned());
    ddl
}

fn resolve_schema_name(
    definition: &ViewDefinition,
    existing: Option<&RegisteredView>,
    options: &DeployOptions,
) -> Result<String, ViewError> {
    let name = match (existing, &options.schema_name) {
        (Some(view), requested) => {
            if let Some(requested) = requested {
                if requested != &view.schema_name {
                    warn!(
                        view = %definition.name,
                        registered = %view.schema_name,
                        requested = %requested,
                        "Ignoring schema name override for an existing view"
                    );
                }
            }
            view.schema_name.clone()
        }
        (None, Some(requested)) => requested.clone(),
        (None, None) => definition.default_schema_name(),
    };
    validate_identifier("schema", &name)?;
    Ok(name)
}
