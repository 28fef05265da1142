//! Reference data the engine reads but never writes.

use serde::{Deserialize, Serialize};

use cardstock_core::{BankId, CardTypeId, Entity, LocationId};

/// An issuing bank. Card types and locations belong to exactly one bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bank {
    pub id: BankId,
    pub name: String,
}

/// A product line of physical cards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardType {
    pub id: CardTypeId,
    pub bank_id: BankId,
    pub name: String,
    /// Minimum stock level; at or below it a location is reported as low on stock.
    pub alert_threshold: Option<i64>,
}

/// A place where cards are physically held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub bank_id: BankId,
    pub name: String,
}

impl Entity for Bank {
    type Id = BankId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Entity for CardType {
    type Id = CardTypeId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Entity for Location {
    type Id = LocationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
