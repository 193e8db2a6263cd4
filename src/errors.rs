use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::Serialize;
use uuid::Uuid;

/// Unified error type for the costing engine.
///
/// Structural violations (negative quantities, zero-basis allocations,
/// over-consumed layers) are rejected synchronously at the call that would
/// cause them and are never partially applied. Value drift detected by the
/// auditor is reported through `FinanceIntegritySummary`, never raised as an
/// error, and never repaired outside an explicit reconcile invocation.
#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Concurrent modification of position {0}")]
    ConcurrentModification(Uuid),

    #[error(
        "Insufficient cost layers for position {position_id}: requested {requested}, available {available}"
    )]
    InsufficientCostLayers {
        position_id: Uuid,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Invalid layer state for layer {layer_id}: {reason}")]
    InvalidLayerState { layer_id: Uuid, reason: String },

    #[error("Landed cost allocation conflict: {0}")]
    LandedCostAllocationConflict(String),

    #[error("Serialized unit violation for position {position_id}: {reason}")]
    SerializedUnitViolation { position_id: Uuid, reason: String },

    #[error("Invalid serial state for position {position_id}: {reason}")]
    InvalidSerialState { position_id: Uuid, reason: String },

    #[error("Layer transfer mismatch between {source_position_id} and {target_position_id}: moved {moved}, recreated {recreated}")]
    LayerTransferMismatch {
        source_position_id: Uuid,
        target_position_id: Uuid,
        moved: Decimal,
        recreated: Decimal,
    },

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// True for errors a caller may retry after re-reading state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::ConcurrentModification(_))
    }

    /// The inventory position implicated in a mutation failure, when known.
    ///
    /// Every mutation failure carries the specific position or layer it
    /// concerns so callers never have to guess at the offending row.
    pub fn position_id(&self) -> Option<Uuid> {
        match self {
            ServiceError::ConcurrentModification(id) => Some(*id),
            ServiceError::InsufficientCostLayers { position_id, .. }
            | ServiceError::SerializedUnitViolation { position_id, .. }
            | ServiceError::InvalidSerialState { position_id, .. } => Some(*position_id),
            ServiceError::LayerTransferMismatch {
                source_position_id, ..
            } => Some(*source_position_id),
            _ => None,
        }
    }
}

/// Alias kept for call sites that predate the service/engine split.
pub type AppError = ServiceError;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn insufficient_layers_error_carries_shortfall_context() {
        let position_id = Uuid::new_v4();
        let err = ServiceError::InsufficientCostLayers {
            position_id,
            requested: dec!(15),
            available: dec!(10),
        };

        assert_eq!(err.position_id(), Some(position_id));
        let msg = err.to_string();
        assert!(msg.contains("requested 15"));
        assert!(msg.contains("available 10"));
    }

    #[test]
    fn concurrent_modification_is_retryable() {
        let err = ServiceError::ConcurrentModification(Uuid::new_v4());
        assert!(err.is_retryable());
        assert!(!ServiceError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn structural_errors_are_not_retryable() {
        let err = ServiceError::LandedCostAllocationConflict("zero basis".into());
        assert!(!err.is_retryable());
        assert_eq!(err.position_id(), None);
    }
}
