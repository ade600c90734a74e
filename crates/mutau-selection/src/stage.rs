use dyn_clone::DynClone;
use mutau_core::{
    AnalysisConfig, ColumnRef, DatasetInfo, EventBatch, GoldenJson, Jagged, MutauError,
    MutauResult,
};

use crate::result::SelectionResult;

/// Read-only state shared by every stage of a run.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    /// The analysis configuration
    pub config: &'a AnalysisConfig,
    /// Metadata of the dataset being processed
    pub dataset: &'a DatasetInfo,
    /// Certified luminosity sections, required for collision data
    pub golden_json: Option<&'a GoldenJson>,
}

impl<'a> StageContext<'a> {
    /// Bundle the run state.
    pub fn new(
        config: &'a AnalysisConfig,
        dataset: &'a DatasetInfo,
        golden_json: Option<&'a GoldenJson>,
    ) -> Self {
        Self {
            config,
            dataset,
            golden_json,
        }
    }
}

/// A single step of the selection pipeline.
///
/// Stages are bound once to the [`StageContext`] when the pipeline is built and then run on
/// every batch. They declare the columns they read ([`Stage::uses`]), the columns they add
/// ([`Stage::produces`]) and the columns they rewrite in place ([`Stage::updates`]); the
/// pipeline orders them from these declarations and refuses to build if a column has no
/// producer, two producers, or if the declarations form a cycle.
pub trait Stage: DynClone + Send + Sync {
    /// Unique name of the stage.
    fn name(&self) -> &str;
    /// Whether the stage runs at all for this dataset (e.g. simulation-only stages). This is a
    /// static decision taken at build time.
    fn applies_to(&self, _ctx: &StageContext) -> bool {
        true
    }
    /// Resolve thresholds and column names from the configuration. Configuration errors
    /// (unknown working points, ...) surface here, before any batch is processed.
    fn bind(&mut self, _ctx: &StageContext) -> MutauResult<()> {
        Ok(())
    }
    /// Columns read by [`Stage::run`].
    fn uses(&self) -> Vec<ColumnRef>;
    /// Columns added by [`Stage::run`].
    fn produces(&self) -> Vec<ColumnRef> {
        Vec::new()
    }
    /// Columns produced elsewhere which [`Stage::run`] rewrites.
    fn updates(&self) -> Vec<ColumnRef> {
        Vec::new()
    }
    /// Names of the steps contributed to the [`SelectionResult`].
    fn steps(&self) -> Vec<String> {
        Vec::new()
    }
    /// Process one batch.
    fn run(&self, batch: &mut EventBatch, ctx: &StageContext) -> MutauResult<SelectionResult>;
}

dyn_clone::clone_trait_object!(Stage);

/// Local index of the resolved muon (zero or one entry per event).
pub const PAIR_MUON_IDX: &str = "pair_muon_idx";
/// Local index of the resolved tau (zero or one entry per event).
pub const PAIR_TAU_IDX: &str = "pair_tau_idx";

/// The resolved pair of each event as `(muon, tau)` local indices.
pub(crate) fn resolved_pairs(batch: &EventBatch) -> MutauResult<Vec<Option<(usize, usize)>>> {
    let muon_idx = batch.list(PAIR_MUON_IDX)?;
    let tau_idx = batch.list(PAIR_TAU_IDX)?;
    let muons = batch.collection("Muon")?;
    let taus = batch.collection("Tau")?;
    let check = |name: &str, index: i64, count: usize| -> MutauResult<usize> {
        match usize::try_from(index) {
            Ok(index) if index < count => Ok(index),
            _ => Err(MutauError::LengthMismatch {
                context: format!("{name} index {index}"),
                expected: count,
                actual: index.unsigned_abs() as usize + 1,
            }),
        }
    };
    (0..batch.n_events())
        .map(|event| match (muon_idx.first(event), tau_idx.first(event)) {
            (Some(m), Some(t)) => Ok(Some((
                check(PAIR_MUON_IDX, m, muons.count(event))?,
                check(PAIR_TAU_IDX, t, taus.count(event))?,
            ))),
            _ => Ok(None),
        })
        .collect()
}

/// Clear the resolved pair of every event where `keep` is false.
pub(crate) fn clear_pairs(batch: &mut EventBatch, keep: &[bool]) -> MutauResult<SelectionResult> {
    let muons = batch.list(PAIR_MUON_IDX)?.clear_where_not(keep)?;
    let taus = batch.list(PAIR_TAU_IDX)?.clear_where_not(keep)?;
    batch.set_list(PAIR_MUON_IDX, muons.clone())?;
    batch.set_list(PAIR_TAU_IDX, taus.clone())?;
    Ok(SelectionResult::new()
        .with_objects("Muon", "Muon", muons)
        .with_objects("Tau", "Tau", taus))
}

/// Turn a list of optional pairs into the two index columns.
pub(crate) fn pair_lists(pairs: &[Option<(usize, usize)>]) -> (Jagged<i64>, Jagged<i64>) {
    let muons = pairs
        .iter()
        .map(|pair| pair.map(|(m, _)| vec![m as i64]).unwrap_or_default())
        .collect();
    let taus = pairs
        .iter()
        .map(|pair| pair.map(|(_, t)| vec![t as i64]).unwrap_or_default())
        .collect();
    (Jagged::from_lists(muons), Jagged::from_lists(taus))
}
