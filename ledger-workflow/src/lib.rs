#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Multi-step approval workflow engine.
//!
//! Rule evaluation ([`evaluate_rule`]) is a pure function over
//! `serde_json::Value` — unit-testable without a database, before any
//! store is involved. Instance advancement (`approve`/`reject`) is an
//! assign/decide state machine: ordered steps, one required role each,
//! advancing on approval and terminating outright on rejection.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::Row;
use thiserror::Error;
use uuid::Uuid;

pub type DefinitionId = Uuid;
pub type StepId = Uuid;
pub type InstanceId = Uuid;

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow definition {0} not found")]
    DefinitionNotFound(DefinitionId),
    #[error("workflow instance {0} not found")]
    InstanceNotFound(InstanceId),
    #[error("workflow definition {0} has no steps")]
    NoSteps(DefinitionId),
    #[error("unknown rule operator: {0}")]
    InvalidRule(String),
    #[error("store unavailable: {0}")]
    Transient(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Pending,
    Approved,
    Rejected,
}

impl WorkflowStatus {
    fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "PENDING",
            WorkflowStatus::Approved => "APPROVED",
            WorkflowStatus::Rejected => "REJECTED",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "APPROVED" => WorkflowStatus::Approved,
            "REJECTED" => WorkflowStatus::Rejected,
            _ => WorkflowStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: DefinitionId,
    pub name: String,
    pub trigger_event: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    pub definition_id: DefinitionId,
    pub sequence: i32,
    pub role: String,
    pub rule: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub definition_id: DefinitionId,
    pub current_step_id: Option<StepId>,
    pub status: WorkflowStatus,
    pub payload: Value,
    pub requester: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `{variable, operator, value}`. Deserialized directly from the opaque
/// JSON stored on a [`WorkflowStep`].
#[derive(Debug, Clone, Deserialize)]
struct LogicRule {
    variable: String,
    operator: String,
    value: Value,
}

/// Coerces a JSON value to `f64` for the `<`/`>` operators: numbers
/// widen, everything else (including missing values, handled by the
/// caller) is `0.0`.
fn to_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Evaluates a step's logic rule against a payload. Pure and
/// database-free: `variable` absent from `payload` is `false`, not an
/// error; an operator other than `<`, `>`, `=` is `InvalidRule`.
pub fn evaluate_rule(payload: &Value, rule_json: &Value) -> WorkflowResult<bool> {
    let rule: LogicRule = serde_json::from_value(rule_json.clone())
        .map_err(|err| WorkflowError::InvalidRule(err.to_string()))?;

    let Some(observed) = payload.get(&rule.variable) else {
        return Ok(false);
    };

    match rule.operator.as_str() {
        ">" => Ok(to_f64(observed) > to_f64(&rule.value)),
        "<" => Ok(to_f64(observed) < to_f64(&rule.value)),
        "=" => Ok(*observed == rule.value),
        other => Err(WorkflowError::InvalidRule(other.to_string())),
    }
}

fn row_to_definition(row: &sqlx::postgres::PgRow) -> WorkflowResult<WorkflowDefinition> {
    Ok(WorkflowDefinition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        trigger_event: row.try_get("trigger_event")?,
    })
}

fn row_to_step(row: &sqlx::postgres::PgRow) -> WorkflowResult<WorkflowStep> {
    Ok(WorkflowStep {
        id: row.try_get("id")?,
        definition_id: row.try_get("definition_id")?,
        sequence: row.try_get("sequence")?,
        role: row.try_get("role")?,
        rule: row.try_get("rule")?,
    })
}

fn row_to_instance(row: &sqlx::postgres::PgRow) -> WorkflowResult<WorkflowInstance> {
    Ok(WorkflowInstance {
        id: row.try_get("id")?,
        definition_id: row.try_get("definition_id")?,
        current_step_id: row.try_get("current_step_id")?,
        status: WorkflowStatus::parse(row.try_get::<&str, _>("status")?),
        payload: row.try_get("payload")?,
        requester: row.try_get("requester")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn first_step(pool: &PgPool, definition_id: DefinitionId) -> WorkflowResult<Option<WorkflowStep>> {
    let row = sqlx::query(
        "SELECT id, definition_id, sequence, role, rule FROM workflow_steps
         WHERE definition_id = $1 ORDER BY sequence ASC LIMIT 1",
    )
    .bind(definition_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(row_to_step).transpose()
}

/// Finds any definition bound to `event` whose first step's rule
/// matches `payload`.
pub async fn check_workflow(
    pool: &PgPool,
    event: &str,
    payload: &Value,
) -> WorkflowResult<Option<WorkflowDefinition>> {
    let definitions = sqlx::query("SELECT id, name, trigger_event FROM workflow_definitions WHERE trigger_event = $1")
        .bind(event)
        .fetch_all(pool)
        .await?;

    for row in &definitions {
        let definition = row_to_definition(row)?;
        let Some(step) = first_step(pool, definition.id).await? else {
            continue;
        };
        match evaluate_rule(payload, &step.rule) {
            Ok(true) => return Ok(Some(definition)),
            Ok(false) => continue,
            Err(err) => {
                tracing::warn!(definition_id = %definition.id, error = %err, "skipping workflow with invalid rule");
                continue;
            }
        }
    }
    Ok(None)
}

/// Starts a new instance at the definition's first step.
pub async fn start_workflow(
    pool: &PgPool,
    definition_id: DefinitionId,
    payload: Value,
    requester: Option<&str>,
) -> WorkflowResult<WorkflowInstance> {
    let step = first_step(pool, definition_id)
        .await?
        .ok_or(WorkflowError::NoSteps(definition_id))?;

    let row = sqlx::query(
        "INSERT INTO workflow_instances (definition_id, current_step_id, status, payload, requester)
         VALUES ($1, $2, 'PENDING', $3, $4)
         RETURNING id, definition_id, current_step_id, status, payload, requester, created_at, updated_at",
    )
    .bind(definition_id)
    .bind(step.id)
    .bind(&payload)
    .bind(requester)
    .fetch_one(pool)
    .await?;
    row_to_instance(&row)
}

/// Instances awaiting a decision from `role`.
pub async fn get_pending_approvals(pool: &PgPool, role: &str) -> WorkflowResult<Vec<WorkflowInstance>> {
    let rows = sqlx::query(
        "SELECT i.id, i.definition_id, i.current_step_id, i.status, i.payload, i.requester, i.created_at, i.updated_at
         FROM workflow_instances i
         JOIN workflow_steps s ON i.current_step_id = s.id
         WHERE i.status = 'PENDING' AND s.role = $1",
    )
    .bind(role)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_instance).collect()
}

async fn get_instance(pool: &PgPool, instance_id: InstanceId) -> WorkflowResult<WorkflowInstance> {
    let row = sqlx::query(
        "SELECT id, definition_id, current_step_id, status, payload, requester, created_at, updated_at
         FROM workflow_instances WHERE id = $1",
    )
    .bind(instance_id)
    .fetch_optional(pool)
    .await?
    .ok_or(WorkflowError::InstanceNotFound(instance_id))?;
    row_to_instance(&row)
}

/// Records an approval, then advances to the next step by ascending
/// sequence, or finalizes the instance as APPROVED when none remain.
pub async fn approve(
    pool: &PgPool,
    instance_id: InstanceId,
    approver_id: &str,
) -> WorkflowResult<WorkflowInstance> {
    let instance = get_instance(pool, instance_id).await?;
    let Some(current_step_id) = instance.current_step_id else {
        return Ok(instance);
    };

    sqlx::query(
        "INSERT INTO workflow_approvals (instance_id, step_id, approver_id, decision)
         VALUES ($1, $2, $3, 'APPROVED')",
    )
    .bind(instance_id)
    .bind(current_step_id)
    .bind(approver_id)
    .execute(pool)
    .await?;

    let current_sequence: i32 = sqlx::query_scalar("SELECT sequence FROM workflow_steps WHERE id = $1")
        .bind(current_step_id)
        .fetch_one(pool)
        .await?;

    let next_step: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM workflow_steps
         WHERE definition_id = $1 AND sequence > $2
         ORDER BY sequence ASC LIMIT 1",
    )
    .bind(instance.definition_id)
    .bind(current_sequence)
    .fetch_optional(pool)
    .await?;

    let row = match next_step {
        Some(next_step_id) => {
            sqlx::query(
                "UPDATE workflow_instances SET current_step_id = $1, updated_at = now()
                 WHERE id = $2
                 RETURNING id, definition_id, current_step_id, status, payload, requester, created_at, updated_at",
            )
            .bind(next_step_id)
            .bind(instance_id)
            .fetch_one(pool)
            .await?
        }
        None => {
            sqlx::query(
                "UPDATE workflow_instances SET status = 'APPROVED', current_step_id = NULL, updated_at = now()
                 WHERE id = $1
                 RETURNING id, definition_id, current_step_id, status, payload, requester, created_at, updated_at",
            )
            .bind(instance_id)
            .fetch_one(pool)
            .await?
        }
    };
    row_to_instance(&row)
}

/// Rejects the instance outright; the reason is persisted on the
/// approval row via its nullable `reason` column.
pub async fn reject(
    pool: &PgPool,
    instance_id: InstanceId,
    approver_id: &str,
    reason: Option<&str>,
) -> WorkflowResult<WorkflowInstance> {
    let instance = get_instance(pool, instance_id).await?;
    if let Some(current_step_id) = instance.current_step_id {
        sqlx::query(
            "INSERT INTO workflow_approvals (instance_id, step_id, approver_id, decision, reason)
             VALUES ($1, $2, $3, 'REJECTED', $4)",
        )
        .bind(instance_id)
        .bind(current_step_id)
        .bind(approver_id)
        .bind(reason)
        .execute(pool)
        .await?;
    }

    let row = sqlx::query(
        "UPDATE workflow_instances SET status = 'REJECTED', current_step_id = NULL, updated_at = now()
         WHERE id = $1
         RETURNING id, definition_id, current_step_id, status, payload, requester, created_at, updated_at",
    )
    .bind(instance_id)
    .fetch_one(pool)
    .await?;
    row_to_instance(&row)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn greater_than_rule_matches_numeric_payload() {
        let rule = json!({"variable": "amount", "operator": ">", "value": 1000});
        assert!(evaluate_rule(&json!({"amount": 5000}), &rule).expect("evaluates"));
        assert!(!evaluate_rule(&json!({"amount": 500}), &rule).expect("evaluates"));
    }

    #[test]
    fn missing_variable_is_false_not_an_error() {
        let rule = json!({"variable": "amount", "operator": ">", "value": 1000});
        assert!(!evaluate_rule(&json!({"other": 1}), &rule).expect("evaluates"));
    }

    #[test]
    fn equality_uses_deep_value_equality() {
        let rule = json!({"variable": "status", "operator": "=", "value": "flagged"});
        assert!(evaluate_rule(&json!({"status": "flagged"}), &rule).expect("evaluates"));
        assert!(!evaluate_rule(&json!({"status": "clear"}), &rule).expect("evaluates"));
    }

    #[test]
    fn unknown_operator_is_invalid_rule() {
        let rule = json!({"variable": "amount", "operator": "!=", "value": 1});
        let err = evaluate_rule(&json!({"amount": 1}), &rule).expect_err("unknown operator rejected");
        assert!(matches!(err, WorkflowError::InvalidRule(_)));
    }

    #[test]
    fn non_numeric_operand_widens_to_zero_instead_of_erroring() {
        let rule = json!({"variable": "amount", "operator": ">", "value": 0});
        assert!(!evaluate_rule(&json!({"amount": "not-a-number"}), &rule).expect("evaluates"));
    }
}
