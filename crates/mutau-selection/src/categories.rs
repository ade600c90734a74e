use mutau_core::{CategoryConfig, Column, ColumnRef, EventBatch, Jagged, MutauResult};
use tracing::debug;

use crate::{
    result::SelectionResult,
    stage::{resolved_pairs, Stage, StageContext, PAIR_MUON_IDX, PAIR_TAU_IDX},
};

/// Ids of the categories each event belongs to, written to `category_ids` in configuration
/// order.
///
/// Category predicates see the relative charge and the isolation of the resolved muon;
/// events without a resolved pair only enter categories that accept anything.
#[derive(Clone, Default)]
pub struct CategoryIds {
    categories: Vec<CategoryConfig>,
}

impl CategoryIds {
    pub fn new() -> Box<Self> {
        Self::default().into()
    }

    /// Ids of the categories accepting an event with the given pair properties.
    pub fn categorize(&self, rel_charge: i64, iso: Option<f64>) -> Vec<i64> {
        self.categories
            .iter()
            .filter(|category| category.selection.accepts(rel_charge, iso))
            .map(|category| category.id)
            .collect()
    }
}

impl Stage for CategoryIds {
    fn name(&self) -> &str {
        "category_ids"
    }

    fn bind(&mut self, ctx: &StageContext) -> MutauResult<()> {
        self.categories = ctx.config.categories.clone();
        Ok(())
    }

    fn uses(&self) -> Vec<ColumnRef> {
        vec![
            ColumnRef::object("Muon", "pfRelIso04_all"),
            ColumnRef::event("rel_charge"),
            ColumnRef::event(PAIR_MUON_IDX),
            ColumnRef::event(PAIR_TAU_IDX),
        ]
    }

    fn produces(&self) -> Vec<ColumnRef> {
        vec![ColumnRef::event("category_ids")]
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        let pairs = resolved_pairs(batch)?;
        let muons = batch.collection("Muon")?;
        let iso = muons.floats("pfRelIso04_all")?;
        let rel_charge = batch.ints("rel_charge")?;
        let ids: Vec<Vec<i64>> = pairs
            .iter()
            .enumerate()
            .map(|(event, pair)| {
                let pair_iso = pair.map(|(m, _)| iso[muons.range(event).start + m]);
                self.categorize(rel_charge[event], pair_iso)
            })
            .collect();
        for category in &self.categories {
            debug!(
                category = %category.name,
                events = ids.iter().filter(|ids| ids.contains(&category.id)).count(),
                "category"
            );
        }
        batch.set_list("category_ids", Jagged::from_lists(ids))?;
        Ok(SelectionResult::new())
    }
}

/// The process id of the dataset, written to `process_id` for every event.
#[derive(Clone, Default)]
pub struct ProcessIds {
    process_id: i64,
}

impl ProcessIds {
    pub fn new() -> Box<Self> {
        Self::default().into()
    }
}

impl Stage for ProcessIds {
    fn name(&self) -> &str {
        "process_ids"
    }

    fn bind(&mut self, ctx: &StageContext) -> MutauResult<()> {
        self.process_id = ctx.dataset.process_id;
        Ok(())
    }

    fn uses(&self) -> Vec<ColumnRef> {
        Vec::new()
    }

    fn produces(&self) -> Vec<ColumnRef> {
        vec![ColumnRef::event("process_id")]
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        batch.set_field(
            "process_id",
            Column::Int(vec![self.process_id; batch.n_events()]),
        )?;
        Ok(SelectionResult::new())
    }
}
