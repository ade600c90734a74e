//! # mutau-selection
//!
//! This is an internal crate used by `mutau`. It holds the selection stages of the mu+tau
//! channel and the [`Pipeline`] which orders them from their declared columns and combines
//! their steps into a final decision, a cutflow and statistics.
#![warn(clippy::perf, clippy::style)]

/// Per-category ids and the dataset process id.
pub mod categories;
/// Dataset-level filters (golden JSON, Monte-Carlo weight) and the kinematics check.
pub mod filters;
/// Object preselection of muons, taus and the b-jet veto.
pub mod objects;
/// Mu+tau pair building and resolution.
pub mod pairs;
/// Assembly, scheduling and execution of the stages.
pub mod pipeline;
/// Derived columns: transverse mass, pair mass and relative charge.
pub mod production;
/// Selection results and their merging.
pub mod result;
/// The [`Stage`] trait and the shared run state.
pub mod stage;
/// HLT decisions and trigger-object matching.
pub mod trigger;
/// Extra-lepton and dilepton vetoes.
pub mod vetoes;

#[cfg(test)]
mod testing;

pub use crate::categories::{CategoryIds, ProcessIds};
pub use crate::filters::{AttachBehavior, GoldenJsonFilter, McWeight};
pub use crate::objects::{
    Cut, JetVeto, MuonSelection, NamedCut, ObjectSelection, ObjectSelector, TauSelection,
};
pub use crate::pairs::{rank_candidates, MuTauPairSelection, PairCandidate, ResolvedPair};
pub use crate::pipeline::{
    BatchesOutcome, Cutflow, CutflowStep, Pipeline, PipelineBuilder, SelectionOutcome,
};
pub use crate::production::{pair_mass, DileptonMass, RelativeCharge, TransverseMass};
pub use crate::result::{SelectionResult, TriggerData};
pub use crate::stage::{Stage, StageContext, PAIR_MUON_IDX, PAIR_TAU_IDX};
pub use crate::trigger::{leg_mask, leg_mask_field, TriggerMatching, TriggerSelection};
pub use crate::vetoes::{DileptonVeto, ExtraLeptonVeto};
