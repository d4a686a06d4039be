//! Vehicle routing plan lifecycle engine
//!
//! This library takes a set of capacitated stops and a travel matrix, partitions
//! the stops across a vehicle fleet, fetches real road geometry for every
//! resulting route from an external directions provider, and supports edit
//! scenarios with content-addressed incremental re-materialization.

pub mod api_types;
pub mod app_state;
pub mod delta;
pub mod directions;
pub mod export;
pub mod handlers;
pub mod materialize;
pub mod objective;
pub mod plan_store;
pub mod solver;
pub mod summary;
pub mod types;
pub mod validate;

pub use objective::*;
pub use types::*;

/// Result type for plan lifecycle operations
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors surfaced to callers, one variant per stable error code
#[derive(thiserror::Error, Debug)]
pub enum PlanError {
    #[error("Invalid input: {0}")]
    BadInput(String),

    #[error("Infeasible: {0}")]
    Infeasible(String),

    #[error("No feasible plan found within the time budget")]
    NoSolution,

    #[error("Matrix snapshot is stale: artifact built against {expected}, current is {found}")]
    StaleMatrix { expected: String, found: String },

    #[error("Stale reference: {0}")]
    StaleReference(String),

    #[error("Directions provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Some vehicles failed to materialize: {failed_vehicle_ids:?}")]
    PartialMaterialization { failed_vehicle_ids: Vec<u32> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupted plan artifact: {0}")]
    CorruptArtifact(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PlanError {
    /// Stable machine-readable code for API responses and logs
    pub fn code(&self) -> &'static str {
        match self {
            PlanError::BadInput(_) => "bad_input",
            PlanError::Infeasible(_) => "infeasible",
            PlanError::NoSolution => "no_solution",
            PlanError::StaleMatrix { .. } => "stale_matrix",
            PlanError::StaleReference(_) => "stale_reference",
            PlanError::ProviderUnavailable(_) => "provider_unavailable",
            PlanError::PartialMaterialization { .. } => "partial_materialization",
            PlanError::NotFound(_) => "not_found",
            PlanError::CorruptArtifact(_) => "corrupt_artifact",
            PlanError::Io(_) => "io_error",
            PlanError::Serialization(_) => "serialization_error",
        }
    }
}
