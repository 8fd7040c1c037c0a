use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sqlx::PgPool;
use sqlx::Row;

use crate::safe_edit;
use crate::ArtifactId;
use crate::ConfigError;
use crate::ConfigResult;
use crate::ConfigStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeMethod {
    Flat,
    Percentage,
}

impl FeeMethod {
    fn as_str(self) -> &'static str {
        match self {
            FeeMethod::Flat => "FLAT",
            FeeMethod::Percentage => "PERCENTAGE",
        }
    }

    fn parse(raw: &str) -> ConfigResult<Self> {
        match raw {
            "FLAT" => Ok(FeeMethod::Flat),
            "PERCENTAGE" => Ok(FeeMethod::Percentage),
            other => Err(ConfigError::InvalidInput(format!("unknown fee method: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeFrequency {
    OneTime,
    Monthly,
    Annual,
}

impl FeeFrequency {
    fn as_str(self) -> &'static str {
        match self {
            FeeFrequency::OneTime => "ONE_TIME",
            FeeFrequency::Monthly => "MONTHLY",
            FeeFrequency::Annual => "ANNUAL",
        }
    }

    fn parse(raw: &str) -> ConfigResult<Self> {
        match raw {
            "ONE_TIME" => Ok(FeeFrequency::OneTime),
            "MONTHLY" => Ok(FeeFrequency::Monthly),
            "ANNUAL" => Ok(FeeFrequency::Annual),
            other => Err(ConfigError::InvalidInput(format!(
                "unknown fee frequency: {other}"
            ))),
        }
    }
}

/// A fee schedule. `value` is the one locked field (a flat minor-unit
/// amount or a basis-point rate depending on `method`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fee {
    pub id: ArtifactId,
    pub name: String,
    pub method: FeeMethod,
    pub value: i64,
    pub frequency: FeeFrequency,
    pub gl_account: Option<ArtifactId>,
    pub status: ConfigStatus,
    pub version: i32,
    pub parent_id: Option<ArtifactId>,
    pub created_at: DateTime<Utc>,
}

fn row_to_fee(row: &sqlx::postgres::PgRow) -> ConfigResult<Fee> {
    Ok(Fee {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        method: FeeMethod::parse(row.try_get::<&str, _>("method")?)?,
        value: row.try_get("value")?,
        frequency: FeeFrequency::parse(row.try_get::<&str, _>("frequency")?)?,
        gl_account: row.try_get("gl_account")?,
        status: ConfigStatus::parse(row.try_get::<&str, _>("status")?),
        version: row.try_get("version")?,
        parent_id: row.try_get("parent_id")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn create(
    pool: &PgPool,
    name: &str,
    method: FeeMethod,
    value: i64,
    frequency: FeeFrequency,
    gl_account: Option<ArtifactId>,
) -> ConfigResult<Fee> {
    if name.trim().is_empty() {
        return Err(ConfigError::InvalidInput("fee name must not be empty".into()));
    }
    if value < 0 {
        return Err(ConfigError::InvalidInput("fee value must not be negative".into()));
    }
    let row = sqlx::query(
        "INSERT INTO fees (name, method, value, frequency, gl_account, status, version)
         VALUES ($1, $2, $3, $4, $5, 'DRAFT', 1)
         RETURNING id, name, method, value, frequency, gl_account, status, version, parent_id, created_at",
    )
    .bind(name)
    .bind(method.as_str())
    .bind(value)
    .bind(frequency.as_str())
    .bind(gl_account)
    .fetch_one(pool)
    .await?;
    row_to_fee(&row)
}

pub async fn get(pool: &PgPool, id: ArtifactId) -> ConfigResult<Fee> {
    let row = sqlx::query(
        "SELECT id, name, method, value, frequency, gl_account, status, version, parent_id, created_at
         FROM fees WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(ConfigError::NotFound("fee", id))?;
    row_to_fee(&row)
}

pub async fn list(pool: &PgPool) -> ConfigResult<Vec<Fee>> {
    let rows = sqlx::query(
        "SELECT id, name, method, value, frequency, gl_account, status, version, parent_id, created_at
         FROM fees ORDER BY name ASC, version DESC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_fee).collect()
}

/// Number of ACTIVE rules whose `action` payload references this fee
/// via the `"ref_id"` convention key (a rule's action attaches a fee to
/// the accounts it matches). This is the usage signal for the locked
/// `value` field.
async fn usage(pool: &PgPool, id: ArtifactId) -> ConfigResult<i64> {
    let ref_id = id.to_string();
    let count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM rules
         WHERE status = 'ACTIVE' AND action ->> 'ref_id' = $1",
    )
    .bind(ref_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn update(
    pool: &PgPool,
    id: ArtifactId,
    name: Option<&str>,
    value: Option<i64>,
    status: Option<ConfigStatus>,
) -> ConfigResult<Fee> {
    let current = get(pool, id).await?;

    if let Some(target) = status {
        safe_edit::ensure_transition(current.status, target)?;
    }

    if let Some(new_value) = value {
        if new_value != current.value {
            let used = usage(pool, id).await?;
            safe_edit::ensure_editable(current.status, used, "value")?;
        }
    }

    let next_name = name.unwrap_or(&current.name);
    let next_value = value.unwrap_or(current.value);
    let next_status = status.unwrap_or(current.status);

    let row = sqlx::query(
        "UPDATE fees SET name = $2, value = $3, status = $4, version = version + 1
         WHERE id = $1
         RETURNING id, name, method, value, frequency, gl_account, status, version, parent_id, created_at",
    )
    .bind(id)
    .bind(next_name)
    .bind(next_value)
    .bind(next_status.as_str())
    .fetch_one(pool)
    .await?;
    row_to_fee(&row)
}

pub async fn clone_fee(pool: &PgPool, id: ArtifactId) -> ConfigResult<Fee> {
    let source = get(pool, id).await?;
    let cloned_name = format!("{} (v2)", source.name);
    let row = sqlx::query(
        "INSERT INTO fees (name, method, value, frequency, gl_account, status, version, parent_id)
         VALUES ($1, $2, $3, $4, $5, 'DRAFT', 1, $6)
         RETURNING id, name, method, value, frequency, gl_account, status, version, parent_id, created_at",
    )
    .bind(cloned_name)
    .bind(source.method.as_str())
    .bind(source.value)
    .bind(source.frequency.as_str())
    .bind(source.gl_account)
    .bind(source.id)
    .fetch_one(pool)
    .await?;
    row_to_fee(&row)
}
