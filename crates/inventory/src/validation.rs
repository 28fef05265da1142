//! Movement validator.
//!
//! `validate` is a pure function of the request and a snapshot of ledger state.
//! It can be called as many times as needed; the engine calls it once without
//! locks as a pre-check and again under the row locks of the write transaction,
//! because stock may change in between.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::movement::{MovementKind, MovementRequest};
use crate::reference::{CardType, Location};

/// Why a movement was refused. Returned to the caller as a value.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    #[error("quantity must be a positive integer (got {quantity})")]
    InvalidQuantity { quantity: i64 },

    #[error("invalid destination: {detail}")]
    InvalidDestination { detail: String },

    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: i64, available: i64 },

    #[error("invalid reference: {detail}")]
    InvalidReference { detail: String },
}

impl RejectionReason {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::InvalidQuantity { .. } => "invalid_quantity",
            RejectionReason::InvalidDestination { .. } => "invalid_destination",
            RejectionReason::InsufficientStock { .. } => "insufficient_stock",
            RejectionReason::InvalidReference { .. } => "invalid_reference",
        }
    }

    fn reference(detail: impl Into<String>) -> Self {
        RejectionReason::InvalidReference {
            detail: detail.into(),
        }
    }
}

/// Ledger state the validator needs for one request.
///
/// `card_type`, `source` and `destination` are `None` when the referenced
/// record does not exist. `available` is the stock at the source key (0 when the
/// row is absent).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LedgerSnapshot {
    pub card_type: Option<CardType>,
    pub source: Option<Location>,
    pub destination: Option<Location>,
    pub available: i64,
}

/// Check a movement request against the ledger snapshot.
///
/// Rules run in a fixed order and the first failure wins:
/// quantity, destination, available stock, references.
pub fn validate(request: &MovementRequest, snapshot: &LedgerSnapshot) -> Result<(), RejectionReason> {
    if request.quantity <= 0 {
        return Err(RejectionReason::InvalidQuantity {
            quantity: request.quantity,
        });
    }

    if let MovementKind::Transfer { destination } = request.kind {
        if destination == request.location_id {
            return Err(RejectionReason::InvalidDestination {
                detail: "destination must differ from source location".to_string(),
            });
        }
    }

    if request.kind.debits_source() && snapshot.available < request.quantity {
        return Err(RejectionReason::InsufficientStock {
            requested: request.quantity,
            available: snapshot.available,
        });
    }

    check_references(request, snapshot)
}

fn check_references(request: &MovementRequest, snapshot: &LedgerSnapshot) -> Result<(), RejectionReason> {
    let card_type = snapshot
        .card_type
        .as_ref()
        .filter(|c| c.id == request.card_type_id)
        .ok_or_else(|| RejectionReason::reference(format!("card type {} does not exist", request.card_type_id)))?;

    let source = snapshot
        .source
        .as_ref()
        .filter(|l| l.id == request.location_id)
        .ok_or_else(|| RejectionReason::reference(format!("location {} does not exist", request.location_id)))?;

    if source.bank_id != card_type.bank_id {
        return Err(RejectionReason::reference(format!(
            "location {} belongs to bank {}, card type {} to bank {}",
            source.id, source.bank_id, card_type.id, card_type.bank_id
        )));
    }

    if let Some(dest_id) = request.kind.destination() {
        let destination = snapshot
            .destination
            .as_ref()
            .filter(|l| l.id == dest_id)
            .ok_or_else(|| RejectionReason::reference(format!("destination location {dest_id} does not exist")))?;

        if destination.bank_id != card_type.bank_id {
            return Err(RejectionReason::reference(format!(
                "destination {} belongs to bank {}, card type {} to bank {}",
                destination.id, destination.bank_id, card_type.id, card_type.bank_id
            )));
        }
    }

    Ok(())
}
