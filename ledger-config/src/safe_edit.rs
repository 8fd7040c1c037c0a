use serde::Deserialize;
use serde::Serialize;

use crate::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigStatus {
    Draft,
    Active,
    Archived,
}

impl ConfigStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ConfigStatus::Draft => "DRAFT",
            ConfigStatus::Active => "ACTIVE",
            ConfigStatus::Archived => "ARCHIVED",
        }
    }

    pub(crate) fn parse(raw: &str) -> Self {
        match raw {
            "ACTIVE" => ConfigStatus::Active,
            "ARCHIVED" => ConfigStatus::Archived,
            _ => ConfigStatus::Draft,
        }
    }

    /// Status transitions allowed: DRAFT<->ACTIVE,
    /// ACTIVE->ARCHIVED, DRAFT->ARCHIVED. ARCHIVED is terminal.
    fn can_transition_to(self, target: ConfigStatus) -> bool {
        use ConfigStatus::*;
        matches!(
            (self, target),
            (Draft, Active) | (Active, Draft) | (Active, Archived) | (Draft, Archived)
        )
    }
}

pub(crate) fn ensure_transition(from: ConfigStatus, to: ConfigStatus) -> Result<(), ConfigError> {
    if from == to || from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ConfigError::InvalidTransition { from, to })
    }
}

/// Central safe-edit check shared by Product, Fee, and Rule: a locked
/// field may only change if the artifact is not (ACTIVE with nonzero
/// usage). Metadata-only edits (name, description, status) are never
/// subject to this check — callers only call this when a locked field's
/// new value differs from its current one.
pub(crate) fn ensure_editable(
    status: ConfigStatus,
    usage: i64,
    field: &'static str,
) -> Result<(), ConfigError> {
    if status == ConfigStatus::Active && usage > 0 {
        Err(ConfigError::InUseLocked { field })
    } else {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn draft_can_move_to_active_or_archived() {
        assert!(ensure_transition(ConfigStatus::Draft, ConfigStatus::Active).is_ok());
        assert!(ensure_transition(ConfigStatus::Draft, ConfigStatus::Archived).is_ok());
    }

    #[test]
    fn active_can_move_back_to_draft_or_forward_to_archived() {
        assert!(ensure_transition(ConfigStatus::Active, ConfigStatus::Draft).is_ok());
        assert!(ensure_transition(ConfigStatus::Active, ConfigStatus::Archived).is_ok());
    }

    #[test]
    fn archived_is_terminal() {
        let err = ensure_transition(ConfigStatus::Archived, ConfigStatus::Active)
            .expect_err("archived cannot reopen");
        assert!(matches!(err, ConfigError::InvalidTransition { .. }));
        let err = ensure_transition(ConfigStatus::Archived, ConfigStatus::Draft)
            .expect_err("archived cannot reopen");
        assert!(matches!(err, ConfigError::InvalidTransition { .. }));
    }

    #[test]
    fn same_status_is_always_a_no_op_transition() {
        assert!(ensure_transition(ConfigStatus::Active, ConfigStatus::Active).is_ok());
    }

    #[test]
    fn locked_field_blocked_only_when_active_and_in_use() {
        assert!(ensure_editable(ConfigStatus::Draft, 5, "rate").is_ok());
        assert!(ensure_editable(ConfigStatus::Active, 0, "rate").is_ok());
        let err =
            ensure_editable(ConfigStatus::Active, 1, "rate").expect_err("locked while in use");
        assert!(matches!(err, ConfigError::InUseLocked { field: "rate" }));
    }
}
