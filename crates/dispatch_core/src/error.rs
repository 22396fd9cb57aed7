use std::fmt;

use thiserror::Error;

use crate::geo::GeoError;
use crate::model::{OfferId, OfferStatus};
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Ride,
    Offer,
    Driver,
    Territory,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Ride => "ride",
            EntityKind::Offer => "offer",
            EntityKind::Driver => "driver",
            EntityKind::Territory => "territory",
        })
    }
}

/// Typed failures of engine operations. A failed operation leaves every entity
/// in its prior state.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: String },

    #[error("{actor} does not own {entity} {id}")]
    Forbidden {
        entity: EntityKind,
        id: String,
        actor: String,
    },

    #[error("cannot {action} {entity} in state {from}")]
    InvalidTransition {
        entity: EntityKind,
        from: String,
        action: &'static str,
    },

    /// Lost a race: the ride was claimed or changed underneath the caller.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("offer {offer_id} is no longer pending ({status})")]
    OfferNotPending { offer_id: OfferId, status: OfferStatus },

    #[error("offer {0} has expired")]
    OfferExpired(OfferId),

    #[error(transparent)]
    InvalidLocation(#[from] GeoError),

    #[error("fare must be a finite non-negative amount, got {0}")]
    InvalidFare(f64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    pub(crate) fn not_found(entity: EntityKind, id: impl fmt::Display) -> Self {
        DispatchError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn forbidden(entity: EntityKind, id: impl fmt::Display, actor: impl fmt::Display) -> Self {
        DispatchError::Forbidden {
            entity,
            id: id.to_string(),
            actor: actor.to_string(),
        }
    }

    pub(crate) fn invalid_transition(
        entity: EntityKind,
        from: impl fmt::Display,
        action: &'static str,
    ) -> Self {
        DispatchError::InvalidTransition {
            entity,
            from: from.to_string(),
            action,
        }
    }

    /// True for every "someone else resolved this first" outcome. Callers
    /// should refresh the ride rather than retry.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DispatchError::Conflict(_)
                | DispatchError::OfferNotPending { .. }
                | DispatchError::OfferExpired(_)
                | DispatchError::Store(StoreError::Conflict { .. })
        )
    }
}
