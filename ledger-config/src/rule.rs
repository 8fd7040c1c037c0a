use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::Row;

use crate::safe_edit;
use crate::ArtifactId;
use crate::ConfigError;
use crate::ConfigResult;
use crate::ConfigStatus;

/// A named condition/action pair. `condition` and `action` are both
/// locked fields: a rule in active use by a workflow step cannot have
/// its matching logic or its effect changed out from under that step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: ArtifactId,
    pub name: String,
    pub condition: Value,
    pub action: Value,
    pub status: ConfigStatus,
    pub version: i32,
    pub parent_id: Option<ArtifactId>,
    pub created_at: DateTime<Utc>,
}

fn row_to_rule(row: &sqlx::postgres::PgRow) -> ConfigResult<Rule> {
    Ok(Rule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        condition: row.try_get("condition")?,
        action: row.try_get("action")?,
        status: ConfigStatus::parse(row.try_get::<&str, _>("status")?),
        version: row.try_get("version")?,
        parent_id: row.try_get("parent_id")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn create(pool: &PgPool, name: &str, condition: Value, action: Value) -> ConfigResult<Rule> {
    if name.trim().is_empty() {
        return Err(ConfigError::InvalidInput("rule name must not be empty".into()));
    }
    let row = sqlx::query(
        "INSERT INTO rules (name, condition, action, status, version)
         VALUES ($1, $2, $3, 'DRAFT', 1)
         RETURNING id, name, condition, action, status, version, parent_id, created_at",
    )
    .bind(name)
    .bind(&condition)
    .bind(&action)
    .fetch_one(pool)
    .await?;
    row_to_rule(&row)
}

pub async fn get(pool: &PgPool, id: ArtifactId) -> ConfigResult<Rule> {
    let row = sqlx::query(
        "SELECT id, name, condition, action, status, version, parent_id, created_at
         FROM rules WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(ConfigError::NotFound("rule", id))?;
    row_to_rule(&row)
}

pub async fn list(pool: &PgPool) -> ConfigResult<Vec<Rule>> {
    let rows = sqlx::query(
        "SELECT id, name, condition, action, status, version, parent_id, created_at
         FROM rules ORDER BY name ASC, version DESC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_rule).collect()
}

/// Number of workflow steps whose `rule` payload references this rule
/// via the `"ref_id"` convention key. Usage signal for the locked
/// `condition`/`action` fields.
async fn usage(pool: &PgPool, id: ArtifactId) -> ConfigResult<i64> {
    let ref_id = id.to_string();
    let count: i64 =
        sqlx::query_scalar("SELECT count(*) FROM workflow_steps WHERE rule ->> 'ref_id' = $1")
            .bind(ref_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

pub async fn update(
    pool: &PgPool,
    id: ArtifactId,
    name: Option<&str>,
    condition: Option<Value>,
    action: Option<Value>,
    status: Option<ConfigStatus>,
) -> ConfigResult<Rule> {
    let current = get(pool, id).await?;

    if let Some(target) = status {
        safe_edit::ensure_transition(current.status, target)?;
    }

    if let Some(new_condition) = condition.as_ref() {
        if *new_condition != current.condition {
            let used = usage(pool, id).await?;
            safe_edit::ensure_editable(current.status, used, "condition")?;
        }
    }
    if let Some(new_action) = action.as_ref() {
        if *new_action != current.action {
            let used = usage(pool, id).await?;
            safe_edit::ensure_editable(current.status, used, "action")?;
        }
    }

    let next_name = name.unwrap_or(&current.name);
    let next_condition = condition.unwrap_or(current.condition.clone());
    let next_action = action.unwrap_or(current.action.clone());
    let next_status = status.unwrap_or(current.status);

    let row = sqlx::query(
        "UPDATE rules SET name = $2, condition = $3, action = $4, status = $5, version = version + 1
         WHERE id = $1
         RETURNING id, name, condition, action, status, version, parent_id, created_at",
    )
    .bind(id)
    .bind(next_name)
    .bind(next_condition)
    .bind(next_action)
    .bind(next_status.as_str())
    .fetch_one(pool)
    .await?;
    row_to_rule(&row)
}

pub async fn clone_rule(pool: &PgPool, id: ArtifactId) -> ConfigResult<Rule> {
    let source = get(pool, id).await?;
    let cloned_name = format!("{} (v2)", source.name);
    let row = sqlx::query(
        "INSERT INTO rules (name, condition, action, status, version, parent_id)
         VALUES ($1, $2, $3, 'DRAFT', 1, $4)
         RETURNING id, name, condition, action, status, version, parent_id, created_at",
    )
    .bind(cloned_name)
    .bind(&source.condition)
    .bind(&source.action)
    .bind(source.id)
    .fetch_one(pool)
    .await?;
    row_to_rule(&row)
}
