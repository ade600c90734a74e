//! `mutau` is a columnar event selection for the $`\mu\tau_h`$ final state of a CP-sensitive
//! $`H\to\tau\tau`$ measurement. It reads NanoAOD-style tables of muons, hadronic taus, jets and
//! trigger objects, selects at most one muon/tau pair per event and sorts the selected events
//! into an inclusive category and the four ABCD regions of a data-driven QCD estimate.
//!
//! <div class="warning">
//!
//! This crate is still in an early development phase, and the API is not stable.
//!
//! </div>
//!
//! # Table of Contents
//! - [Key Features](#key-features)
//! - [Quick Start](#quick-start)
//! - [Writing a New Stage](#writing-a-new-stage)
//! - [Data Format](#data-format)
//!
//! # Key Features
//! * A single [`Stage`](crate::selection::Stage) trait. Stages declare the columns they read and
//!   write, and the [`PipelineBuilder`] orders them and rejects missing, duplicated or cyclic
//!   dependencies before any event is processed.
//! * Every stage runs on every event; exclusion happens only through the final AND of all
//!   steps, so the [`Cutflow`] shows the effect of each cut alone and cumulatively.
//! * Deterministic pair resolution that does not depend on the order of the input objects.
//! * Mergeable [`SelectionStats`] for parallel processing of batches with
//!   [`rayon`](https://github.com/rayon-rs/rayon).
//!
//! # Quick Start
//! ```rust,no_run
//! use mutau::{read_parquet_batches, AnalysisConfig, DatasetInfo, PipelineBuilder};
//!
//! fn main() -> mutau::MutauResult<()> {
//!     let config = AnalysisConfig::from_json_file("~/analysis/run3_2022_preEE.json")?;
//!     let dataset = DatasetInfo::mc("dy_incl", 51);
//!     let pipeline = PipelineBuilder::mutau(config, dataset).build()?;
//!     let mut batches = read_parquet_batches("~/nano/dy_incl.parquet", 100_000)?;
//!     let outcome = pipeline.run_batches(&mut batches)?;
//!     for (step, counts) in &outcome.cutflow.steps {
//!         println!("{step:>20} {:>10} {:>14.2}", counts.cumulative, counts.weighted_cumulative);
//!     }
//!     println!("selected: {}", outcome.stats.get("num_events_selected"));
//!     Ok(())
//! }
//! ```
//!
//! # Writing a New Stage
//! A stage reads columns from the [`EventBatch`], may add columns to it, and returns named
//! per-event steps:
//! ```rust
//! use mutau::prelude::*;
//!
//! #[derive(Clone, Default)]
//! struct HighMet {
//!     min_pt: f64,
//! }
//!
//! impl Stage for HighMet {
//!     fn name(&self) -> &str {
//!         "high_met"
//!     }
//!     fn uses(&self) -> Vec<ColumnRef> {
//!         vec![ColumnRef::event("MET.pt")]
//!     }
//!     fn steps(&self) -> Vec<String> {
//!         vec!["met_30".to_string()]
//!     }
//!     fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
//!         let pass = batch
//!             .floats("MET.pt")?
//!             .iter()
//!             .map(|&pt| pt > self.min_pt)
//!             .collect();
//!         Ok(SelectionResult::new().with_step("met_30", pass))
//!     }
//! }
//!
//! let pipeline = PipelineBuilder::new(AnalysisConfig::default(), DatasetInfo::mc("dy_incl", 51))
//!     .stage(Box::new(HighMet { min_pt: 30.0 }))
//!     .build()
//!     .unwrap();
//! let mut batch = EventBatch::new(3);
//! batch
//!     .set_field("MET.pt", Column::Float(vec![10.0, 45.0, 31.0]))
//!     .unwrap();
//! let outcome = pipeline.run(&mut batch).unwrap();
//! assert_eq!(outcome.result.event, Some(vec![false, true, true]));
//! ```
//!
//! # Data Format
//! Parquet files are expected in the flat NanoAOD layout. Object attributes are list columns
//! named `<Collection>_<attribute>` (`Muon_pt`, `Tau_idDeepTau2018v2p5VSjet`, ...), and
//! every other column is a per-event scalar (`run`, `genWeight`, `MET_pt`, `HLT_IsoMu24`, ...).
//! Grouped event branches such as `MET_pt` and `HLT_IsoMu24` are addressed with a dot
//! (`MET.pt`, `HLT.IsoMu24`).
#![warn(clippy::perf, clippy::style)]

/// The selection stages and the pipeline.
pub mod selection {
    pub use mutau_selection::*;
}

pub mod data {
    pub use mutau_core::data::{
        io, read_parquet, read_parquet_batches, write_parquet, Collection, CollectionBuilder,
        Column, ColumnRef, EventBatch, Jagged, Value, ValueKind, EMPTY_FLOAT, EMPTY_INT,
    };
}

pub mod utils {
    pub use mutau_core::utils::*;
}

pub use mutau_core::{
    AnalysisConfig, Column, ColumnRef, DatasetInfo, EventBatch, GoldenJson, Jagged, MutauError,
    MutauResult, SelectionStats, Vec4,
};
pub use mutau_core::{read_parquet, read_parquet_batches, write_parquet};
pub use mutau_selection::{
    BatchesOutcome, Cutflow, CutflowStep, Pipeline, PipelineBuilder, SelectionOutcome,
    SelectionResult,
};
pub use serde::{Deserialize, Serialize};

/// Everything needed to build a pipeline and write new stages.
pub mod prelude {
    pub use mutau_core::{
        AnalysisConfig, Column, ColumnRef, DatasetInfo, EventBatch, Jagged, MutauError,
        MutauResult, Value,
    };
    pub use mutau_selection::{
        Pipeline, PipelineBuilder, SelectionOutcome, SelectionResult, Stage, StageContext,
    };
}
