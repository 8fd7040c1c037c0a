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

/// A savings/checking product definition. `interest_rate_bps` is the
/// one locked field: once a product is ACTIVE and at least one account
/// references it, the rate can no longer move out from under those
/// accounts' accrual math.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: ArtifactId,
    pub name: String,
    pub interest_rate_bps: i32,
    pub status: ConfigStatus,
    pub version: i32,
    pub parent_id: Option<ArtifactId>,
    pub created_at: DateTime<Utc>,
}

fn row_to_product(row: &sqlx::postgres::PgRow) -> ConfigResult<Product> {
    Ok(Product {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        interest_rate_bps: row.try_get("interest_rate_bps")?,
        status: ConfigStatus::parse(row.try_get::<&str, _>("status")?),
        version: row.try_get("version")?,
        parent_id: row.try_get("parent_id")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Create a new DRAFT product at version 1.
pub async fn create(pool: &PgPool, name: &str, interest_rate_bps: i32) -> ConfigResult<Product> {
    if name.trim().is_empty() {
        return Err(ConfigError::InvalidInput("product name must not be empty".into()));
    }
    if interest_rate_bps < 0 {
        return Err(ConfigError::InvalidInput(
            "interest_rate_bps must not be negative".into(),
        ));
    }
    let row = sqlx::query(
        "INSERT INTO products (name, interest_rate_bps, status, version)
         VALUES ($1, $2, 'DRAFT', 1)
         RETURNING id, name, interest_rate_bps, status, version, parent_id, created_at",
    )
    .bind(name)
    .bind(interest_rate_bps)
    .fetch_one(pool)
    .await?;
    row_to_product(&row)
}

pub async fn get(pool: &PgPool, id: ArtifactId) -> ConfigResult<Product> {
    let row = sqlx::query(
        "SELECT id, name, interest_rate_bps, status, version, parent_id, created_at
         FROM products WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(ConfigError::NotFound("product", id))?;
    row_to_product(&row)
}

pub async fn list(pool: &PgPool) -> ConfigResult<Vec<Product>> {
    let rows = sqlx::query(
        "SELECT id, name, interest_rate_bps, status, version, parent_id, created_at
         FROM products ORDER BY name ASC, version DESC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_product).collect()
}

/// Number of accounts currently opened against this product. This is
/// the usage signal that locks `interest_rate_bps` once nonzero on an
/// ACTIVE product.
async fn usage(pool: &PgPool, id: ArtifactId) -> ConfigResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM accounts WHERE product_id = $1")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Update a product in place. Changing `interest_rate_bps` goes through
/// the shared safe-edit check; changing `status` goes through the
/// shared transition check. Either, both, or neither may change in a
/// single call.
pub async fn update(
    pool: &PgPool,
    id: ArtifactId,
    name: Option<&str>,
    interest_rate_bps: Option<i32>,
    status: Option<ConfigStatus>,
) -> ConfigResult<Product> {
    let current = get(pool, id).await?;

    if let Some(target) = status {
        safe_edit::ensure_transition(current.status, target)?;
    }

    if let Some(new_rate) = interest_rate_bps {
        if new_rate != current.interest_rate_bps {
            let used = usage(pool, id).await?;
            safe_edit::ensure_editable(current.status, used, "interest_rate_bps")?;
        }
    }

    let next_name = name.unwrap_or(&current.name);
    let next_rate = interest_rate_bps.unwrap_or(current.interest_rate_bps);
    let next_status = status.unwrap_or(current.status);

    let row = sqlx::query(
        "UPDATE products SET name = $2, interest_rate_bps = $3, status = $4, version = version + 1
         WHERE id = $1
         RETURNING id, name, interest_rate_bps, status, version, parent_id, created_at",
    )
    .bind(id)
    .bind(next_name)
    .bind(next_rate)
    .bind(next_status.as_str())
    .fetch_one(pool)
    .await?;
    row_to_product(&row)
}

/// Clone a product into a new DRAFT version-1 artifact with `parent_id`
/// set to the source and the name suffixed "(v2)" — e.g. "Sav" clones
/// into "Sav (v2)" while the original stays ACTIVE and locked.
pub async fn clone_product(pool: &PgPool, id: ArtifactId) -> ConfigResult<Product> {
    let source = get(pool, id).await?;
    let cloned_name = format!("{} (v2)", source.name);
    let row = sqlx::query(
        "INSERT INTO products (name, interest_rate_bps, status, version, parent_id)
         VALUES ($1, $2, 'DRAFT', 1, $3)
         RETURNING id, name, interest_rate_bps, status, version, parent_id, created_at",
    )
    .bind(cloned_name)
    .bind(source.interest_rate_bps)
    .bind(source.id)
    .fetch_one(pool)
    .await?;
    row_to_product(&row)
}
