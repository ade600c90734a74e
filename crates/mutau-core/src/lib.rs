//! # mutau-core
//!
//! This is an internal crate used by `mutau`. It holds the jagged event model, the analysis
//! configuration and the statistics accumulator shared by every selection stage.
#![warn(clippy::perf, clippy::style)]

use thiserror::Error;

/// Jagged columnar event storage and Parquet ingestion.
pub mod data;
/// Immutable analysis configuration (cuts, working points, triggers, datasets).
pub mod config;
/// Keyed accumulation of event counts and weight sums.
pub mod stats;
/// Utility enums and four-vector helpers.
pub mod utils;

pub use crate::config::{
    AnalysisConfig, CategoryConfig, CategorySelection, ChargeSign, DatasetInfo, DeepTauConfig,
    GoldenJson, IsolationWindow, Trigger, TriggerLeg, WorkingPoints,
};
pub use crate::data::{
    read_parquet, read_parquet_batches, write_parquet, Collection, CollectionBuilder, Column,
    ColumnRef, EventBatch, Jagged, Kinematics, Value, ValueKind, EMPTY_FLOAT, EMPTY_INT,
};
pub use crate::stats::{increment_stats, GroupMap, SelectionStats, Weight, WeightMap};
pub use crate::utils::enums::{Comparison, ParticleKind};
pub use crate::utils::vectors::Vec4;

/// The result type used by all `mutau` internal methods
pub type MutauResult<T> = Result<T, MutauError>;

/// The error type used by all `mutau` internal methods
#[derive(Error, Debug)]
pub enum MutauError {
    /// An alias for [`std::io::Error`].
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    /// An alias for [`parquet::errors::ParquetError`].
    #[error("Parquet Error: {0}")]
    ParquetError(#[from] parquet::errors::ParquetError),
    /// An alias for [`arrow::error::ArrowError`].
    #[error("Arrow Error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),
    /// An alias for [`serde_json::Error`].
    #[error("JSON Error: {0}")]
    JsonError(#[from] serde_json::Error),
    /// An alias for [`shellexpand::LookupError`].
    #[error("Failed to expand path: {0}")]
    LookupError(#[from] shellexpand::LookupError<std::env::VarError>),
    /// A column required by a stage or a predicate is not present in the batch.
    #[error("Missing required column \"{column}\"")]
    MissingColumn {
        /// Name of the missing column
        column: String,
    },
    /// A column exists but holds a different value type than the one requested.
    #[error("Column \"{column}\" has type {found}, expected {expected}")]
    ColumnType {
        /// Name of the offending column
        column: String,
        /// The requested type
        expected: &'static str,
        /// The stored type
        found: &'static str,
    },
    /// An input column has null entries, which have no value in the event model.
    #[error("Column \"{column}\" contains {count} null entries")]
    NullValues {
        /// Name of the offending column
        column: String,
        /// Number of null entries
        count: usize,
    },
    /// A column or mask does not have the cardinality of the collection it belongs to.
    #[error("Length mismatch in {context}: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Where the mismatch was detected
        context: String,
        /// Expected length
        expected: usize,
        /// Observed length
        actual: usize,
    },
    /// A working point name which is not present in the tagger's working point table.
    #[error("Unknown working point \"{name}\" for tagger \"{tagger}\"")]
    UnknownWorkingPoint {
        /// Tagger (or table) name
        tagger: String,
        /// Requested working point
        name: String,
    },
    /// A trigger leg refers to a particle code which trigger objects never carry.
    #[error("Trigger \"{trigger}\" has a leg with unknown particle code {pdg_id}")]
    UnknownParticleCode {
        /// Trigger name
        trigger: String,
        /// Offending PDG id
        pdg_id: i64,
    },
    /// Collision data is processed without a certified-luminosity (golden) JSON.
    #[error("No golden JSON available for data set \"{dataset}\"")]
    MissingGoldenJson {
        /// Dataset name
        dataset: String,
    },
    /// Two entries share a name which must be unique.
    #[error("Duplicate {category} name \"{name}\"")]
    DuplicateName {
        /// Kind of entry (trigger, category, step, ...)
        category: &'static str,
        /// The duplicated name
        name: String,
    },
    /// A stage reads a column that neither the input nor any stage provides.
    #[error("Stage \"{stage}\" uses column \"{column}\" which nothing produces")]
    UnsatisfiedDependency {
        /// Stage name
        stage: String,
        /// Column that is not available
        column: String,
    },
    /// Two stages claim to produce the same column.
    #[error("Column \"{column}\" is produced by both \"{first}\" and \"{second}\"")]
    DuplicateProducer {
        /// Column name
        column: String,
        /// First producing stage
        first: String,
        /// Second producing stage
        second: String,
    },
    /// The declared column dependencies between stages form a cycle.
    #[error("Stage dependency cycle involving: {}", stages.join(", "))]
    DependencyCycle {
        /// Stages that could not be ordered
        stages: Vec<String>,
    },
    /// An error which occurs when the user tries to parse an invalid string of text, typically
    /// into an enum variant.
    #[error("Failed to parse string: \"{name}\" does not correspond to a valid \"{object}\"!")]
    ParseError {
        /// The string which was parsed
        name: String,
        /// The name of the object it failed to parse into
        object: String,
    },
    /// A custom fallback error for errors too complex or too infrequent to warrant their own error
    /// category.
    #[error("{0}")]
    Custom(String),
}

impl MutauError {
    /// Whether this error belongs to the configuration class (raised before any batch runs).
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            MutauError::MissingColumn { .. }
                | MutauError::UnknownWorkingPoint { .. }
                | MutauError::UnknownParticleCode { .. }
                | MutauError::MissingGoldenJson { .. }
                | MutauError::DuplicateName { .. }
                | MutauError::UnsatisfiedDependency { .. }
                | MutauError::DuplicateProducer { .. }
                | MutauError::DependencyCycle { .. }
                | MutauError::ParseError { .. }
        )
    }
}
