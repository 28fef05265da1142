//! Audit trail entries.
//!
//! One entry is produced per movement attempt, whatever its outcome. Entries are
//! plain values; writing them is the infra layer's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use cardstock_core::{AuditLogId, DomainError, UserId};

use crate::movement::{Movement, MovementRequest, MovementType, RawMovementRequest};
use crate::stock::Stock;
use crate::validation::RejectionReason;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    /// The movement was applied.
    Success,
    /// The movement was rejected by business rules.
    Denied,
    /// The attempt failed for infrastructure reasons.
    Error,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Success => "SUCCESS",
            AuditStatus::Denied => "DENIED",
            AuditStatus::Error => "ERROR",
        }
    }
}

impl core::str::FromStr for AuditStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(AuditStatus::Success),
            "DENIED" => Ok(AuditStatus::Denied),
            "ERROR" => Ok(AuditStatus::Error),
            other => Err(DomainError::validation(format!("unknown audit status '{other}'"))),
        }
    }
}

/// Request metadata the caller passes along with a movement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptContext {
    pub ip: Option<String>,
}

impl AttemptContext {
    pub fn with_ip(ip: impl Into<String>) -> Self {
        Self { ip: Some(ip.into()) }
    }
}

/// One row of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditLogId,
    pub user_id: Option<UserId>,
    pub action: String,
    pub resource: String,
    /// JSON document describing the attempt.
    pub details: String,
    pub ip: Option<String>,
    pub status: AuditStatus,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// `<prefix>.<entry|exit|transfer>`
    pub fn action_for(prefix: &str, movement_type: MovementType) -> String {
        format!("{prefix}.{}", movement_type.as_str().to_ascii_lowercase())
    }

    pub fn applied(
        action_prefix: &str,
        request: &MovementRequest,
        ctx: &AttemptContext,
        movement: &Movement,
        stock: &[Stock],
        timestamp: DateTime<Utc>,
    ) -> Self {
        let locations: Vec<_> = stock
            .iter()
            .map(|s| json!({ "location_id": s.key.location_id, "quantity": s.quantity() }))
            .collect();

        let details = json!({
            "movement_id": movement.id,
            "type": movement.movement_type(),
            "quantity": movement.quantity,
            "card_type_id": movement.card_type_id,
            "location_id": movement.location_id,
            "dest_location_id": movement.destination(),
            "stock": locations,
        });

        Self {
            id: AuditLogId::new(),
            user_id: Some(request.user_id),
            action: Self::action_for(action_prefix, request.kind.movement_type()),
            resource: format!("movement/{}", movement.id),
            details: details.to_string(),
            ip: ctx.ip.clone(),
            status: AuditStatus::Success,
            timestamp,
        }
    }

    pub fn rejected(
        action_prefix: &str,
        request: &MovementRequest,
        ctx: &AttemptContext,
        reason: &RejectionReason,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::denied(
            action_prefix,
            request.kind.movement_type(),
            request.user_id,
            json!(request),
            ctx,
            reason,
            timestamp,
        )
    }

    /// Denied entry for a request that never parsed into a [`MovementRequest`].
    pub fn rejected_raw(
        action_prefix: &str,
        request: &RawMovementRequest,
        ctx: &AttemptContext,
        reason: &RejectionReason,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::denied(
            action_prefix,
            request.movement_type,
            request.user_id,
            json!(request),
            ctx,
            reason,
            timestamp,
        )
    }

    fn denied(
        action_prefix: &str,
        movement_type: MovementType,
        user_id: UserId,
        request: serde_json::Value,
        ctx: &AttemptContext,
        reason: &RejectionReason,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let details = json!({
            "rejection": reason,
            "message": reason.to_string(),
            "request": request,
        });

        Self {
            id: AuditLogId::new(),
            user_id: Some(user_id),
            action: Self::action_for(action_prefix, movement_type),
            resource: "movement".to_string(),
            details: details.to_string(),
            ip: ctx.ip.clone(),
            status: AuditStatus::Denied,
            timestamp,
        }
    }

    pub fn failed(
        action_prefix: &str,
        request: &MovementRequest,
        ctx: &AttemptContext,
        error: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let details = json!({
            "error": error,
            "request": request,
        });

        Self {
            id: AuditLogId::new(),
            user_id: Some(request.user_id),
            action: Self::action_for(action_prefix, request.kind.movement_type()),
            resource: "movement".to_string(),
            details: details.to_string(),
            ip: ctx.ip.clone(),
            status: AuditStatus::Error,
            timestamp,
        }
    }
}
