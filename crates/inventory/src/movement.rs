//! Movement requests and recorded movements.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cardstock_core::{CardTypeId, DomainError, Entity, LocationId, MovementId, UserId};

use crate::stock::StockKey;
use crate::validation::RejectionReason;

/// Flat movement type, as stored in the `movements.type` column.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    Entry,
    Exit,
    Transfer,
}

impl MovementType {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementType::Entry => "ENTRY",
            MovementType::Exit => "EXIT",
            MovementType::Transfer => "TRANSFER",
        }
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for MovementType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ENTRY" => Ok(MovementType::Entry),
            "EXIT" => Ok(MovementType::Exit),
            "TRANSFER" => Ok(MovementType::Transfer),
            other => Err(DomainError::validation(format!("unknown movement type '{other}'"))),
        }
    }
}

/// What a movement does to the ledger.
///
/// Only a transfer has a destination, so "destination set but kind is ENTRY"
/// cannot be represented.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementKind {
    /// Cards received at the source location.
    Entry,
    /// Cards issued from the source location.
    Exit,
    /// Cards moved from the source location to `destination`.
    Transfer { destination: LocationId },
}

impl MovementKind {
    /// Build a kind from a loose `(type, destination?)` pair.
    ///
    /// A transfer without a destination, or an entry/exit carrying one, is an
    /// `InvalidDestination` rejection.
    pub fn from_parts(
        movement_type: MovementType,
        destination: Option<LocationId>,
    ) -> Result<Self, RejectionReason> {
        match (movement_type, destination) {
            (MovementType::Entry, None) => Ok(MovementKind::Entry),
            (MovementType::Exit, None) => Ok(MovementKind::Exit),
            (MovementType::Transfer, Some(destination)) => Ok(MovementKind::Transfer { destination }),
            (MovementType::Transfer, None) => Err(RejectionReason::InvalidDestination {
                detail: "transfer requires a destination location".to_string(),
            }),
            (t, Some(_)) => Err(RejectionReason::InvalidDestination {
                detail: format!("{t} movements cannot have a destination location"),
            }),
        }
    }

    pub fn movement_type(&self) -> MovementType {
        match self {
            MovementKind::Entry => MovementType::Entry,
            MovementKind::Exit => MovementType::Exit,
            MovementKind::Transfer { .. } => MovementType::Transfer,
        }
    }

    pub fn destination(&self) -> Option<LocationId> {
        match self {
            MovementKind::Transfer { destination } => Some(*destination),
            _ => None,
        }
    }

    /// True when the source location loses stock.
    pub fn debits_source(&self) -> bool {
        !matches!(self, MovementKind::Entry)
    }
}

/// A caller's request to move cards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRequest {
    pub kind: MovementKind,
    /// Raw requested amount; validated to be positive.
    pub quantity: i64,
    pub user_id: UserId,
    pub card_type_id: CardTypeId,
    pub location_id: LocationId,
}

impl MovementRequest {
    pub fn entry(user_id: UserId, card_type_id: CardTypeId, location_id: LocationId, quantity: i64) -> Self {
        Self {
            kind: MovementKind::Entry,
            quantity,
            user_id,
            card_type_id,
            location_id,
        }
    }

    pub fn exit(user_id: UserId, card_type_id: CardTypeId, location_id: LocationId, quantity: i64) -> Self {
        Self {
            kind: MovementKind::Exit,
            quantity,
            user_id,
            card_type_id,
            location_id,
        }
    }

    pub fn transfer(
        user_id: UserId,
        card_type_id: CardTypeId,
        from: LocationId,
        to: LocationId,
        quantity: i64,
    ) -> Self {
        Self {
            kind: MovementKind::Transfer { destination: to },
            quantity,
            user_id,
            card_type_id,
            location_id: from,
        }
    }

    pub fn source_key(&self) -> StockKey {
        StockKey::new(self.location_id, self.card_type_id)
    }

    pub fn destination_key(&self) -> Option<StockKey> {
        self.kind
            .destination()
            .map(|dest| StockKey::new(dest, self.card_type_id))
    }

    /// Stock rows this movement touches, in lock order (ascending, deduplicated).
    pub fn touched_keys(&self) -> Vec<StockKey> {
        let mut keys = vec![self.source_key()];
        keys.extend(self.destination_key());
        keys.sort();
        keys.dedup();
        keys
    }
}

/// A movement request as callers send it: a flat type plus an optional
/// destination, not yet checked for consistency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMovementRequest {
    #[serde(rename = "type")]
    pub movement_type: MovementType,
    pub quantity: i64,
    pub user_id: UserId,
    pub card_type_id: CardTypeId,
    pub location_id: LocationId,
    pub dest_location_id: Option<LocationId>,
}

impl RawMovementRequest {
    /// Turn the flat fields into a typed request.
    ///
    /// A non-positive quantity is reported before an inconsistent destination,
    /// matching the validator's rule order.
    pub fn parse(&self) -> Result<MovementRequest, RejectionReason> {
        if self.quantity <= 0 {
            return Err(RejectionReason::InvalidQuantity {
                quantity: self.quantity,
            });
        }
        let kind = MovementKind::from_parts(self.movement_type, self.dest_location_id)?;
        Ok(MovementRequest {
            kind,
            quantity: self.quantity,
            user_id: self.user_id,
            card_type_id: self.card_type_id,
            location_id: self.location_id,
        })
    }
}

/// An applied movement. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub id: MovementId,
    pub kind: MovementKind,
    pub quantity: i64,
    pub user_id: UserId,
    pub card_type_id: CardTypeId,
    pub location_id: LocationId,
    pub created_at: DateTime<Utc>,
}

impl Movement {
    pub fn from_request(id: MovementId, request: &MovementRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: request.kind,
            quantity: request.quantity,
            user_id: request.user_id,
            card_type_id: request.card_type_id,
            location_id: request.location_id,
            created_at,
        }
    }

    pub fn movement_type(&self) -> MovementType {
        self.kind.movement_type()
    }

    pub fn destination(&self) -> Option<LocationId> {
        self.kind.destination()
    }

    /// Rebuild a movement from its flat stored columns.
    #[allow(clippy::too_many_arguments)]
    pub fn from_stored(
        id: MovementId,
        movement_type: MovementType,
        destination: Option<LocationId>,
        quantity: i64,
        user_id: UserId,
        card_type_id: CardTypeId,
        location_id: LocationId,
        created_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let kind = MovementKind::from_parts(movement_type, destination)
            .map_err(|r| DomainError::invariant(format!("stored movement {id}: {r}")))?;
        if quantity <= 0 {
            return Err(DomainError::invariant(format!(
                "stored movement {id} has non-positive quantity {quantity}"
            )));
        }
        Ok(Self {
            id,
            kind,
            quantity,
            user_id,
            card_type_id,
            location_id,
            created_at,
        })
    }
}

impl Entity for Movement {
    type Id = MovementId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
