use accurate::{sum::Klein, traits::*};
use auto_ops::impl_op_ex;
use indexmap::{IndexMap, IndexSet};
use mutau_core::{
    increment_stats, AnalysisConfig, ColumnRef, DatasetInfo, EventBatch, GoldenJson, GroupMap,
    MutauError, MutauResult, SelectionStats, Weight, WeightMap,
};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    categories::{CategoryIds, ProcessIds},
    filters::{AttachBehavior, GoldenJsonFilter, McWeight},
    objects::{JetVeto, MuonSelection, TauSelection},
    pairs::MuTauPairSelection,
    production::{DileptonMass, RelativeCharge, TransverseMass},
    result::SelectionResult,
    stage::{Stage, StageContext},
    trigger::{TriggerMatching, TriggerSelection},
    vetoes::{DileptonVeto, ExtraLeptonVeto},
};

/// Event counts of one cutflow step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CutflowStep {
    /// Events passing this step alone
    pub passed: usize,
    /// Events passing this and every earlier step
    pub cumulative: usize,
    /// Weighted `passed`
    pub weighted: f64,
    /// Weighted `cumulative`
    pub weighted_cumulative: f64,
}

/// Per-step event counts in evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cutflow {
    /// Events before any step
    pub n_events: usize,
    /// Summed weight before any step
    pub sum_weights: f64,
    pub steps: IndexMap<String, CutflowStep>,
}

impl Cutflow {
    /// Tabulate `steps`, each event counted with its weight (one when `weights` is [`None`]).
    pub fn from_steps(
        n_events: usize,
        steps: &IndexMap<String, Vec<bool>>,
        weights: Option<&[f64]>,
    ) -> MutauResult<Self> {
        let weight = |event: usize| weights.map_or(1.0, |w| w[event]);
        if let Some(weights) = weights {
            if weights.len() != n_events {
                return Err(MutauError::LengthMismatch {
                    context: "cutflow weights".to_string(),
                    expected: n_events,
                    actual: weights.len(),
                });
            }
        }
        let mut cumulative = vec![true; n_events];
        let mut cutflow = Cutflow {
            n_events,
            sum_weights: (0..n_events)
                .map(weight)
                .sum_with_accumulator::<Klein<f64>>(),
            steps: IndexMap::with_capacity(steps.len()),
        };
        for (name, mask) in steps {
            if mask.len() != n_events {
                return Err(MutauError::LengthMismatch {
                    context: format!("step \"{name}\""),
                    expected: n_events,
                    actual: mask.len(),
                });
            }
            cumulative
                .iter_mut()
                .zip(mask)
                .for_each(|(c, &m)| *c &= m);
            cutflow.steps.insert(
                name.clone(),
                CutflowStep {
                    passed: mask.iter().filter(|&&m| m).count(),
                    cumulative: cumulative.iter().filter(|&&c| c).count(),
                    weighted: (0..n_events)
                        .filter(|&e| mask[e])
                        .map(weight)
                        .sum_with_accumulator::<Klein<f64>>(),
                    weighted_cumulative: (0..n_events)
                        .filter(|&e| cumulative[e])
                        .map(weight)
                        .sum_with_accumulator::<Klein<f64>>(),
                },
            );
        }
        Ok(cutflow)
    }

    /// Events passing every step.
    pub fn n_selected(&self) -> usize {
        self.steps
            .last()
            .map_or(self.n_events, |(_, step)| step.cumulative)
    }

    fn merge(&mut self, other: &Cutflow) {
        self.n_events += other.n_events;
        self.sum_weights += other.sum_weights;
        for (name, step) in &other.steps {
            let entry = self.steps.entry(name.clone()).or_default();
            entry.passed += step.passed;
            entry.cumulative += step.cumulative;
            entry.weighted += step.weighted;
            entry.weighted_cumulative += step.weighted_cumulative;
        }
    }
}

impl_op_ex!(+ |a: &Cutflow, b: &Cutflow| -> Cutflow {
    let mut merged = a.clone();
    merged.merge(b);
    merged
});

impl_op_ex!(+= |a: &mut Cutflow, b: &Cutflow| { a.merge(b) });

/// Everything the pipeline decided about one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionOutcome {
    /// Steps, selected objects and trigger data; `event` holds the final decision
    pub result: SelectionResult,
    pub cutflow: Cutflow,
    pub stats: SelectionStats,
}

/// Outcome of several batches: the per-batch results and the reduced cutflow and statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchesOutcome {
    pub results: Vec<SelectionResult>,
    pub cutflow: Cutflow,
    pub stats: SelectionStats,
}

/// Assemble a [`Pipeline`] from stages.
///
/// [`PipelineBuilder::build`] validates the configuration, drops the stages that do not apply to
/// the dataset, binds the rest and orders them from their declared columns.
#[derive(Clone)]
pub struct PipelineBuilder {
    config: AnalysisConfig,
    dataset: DatasetInfo,
    golden_json: Option<GoldenJson>,
    inputs: Option<Vec<ColumnRef>>,
    stages: Vec<Box<dyn Stage>>,
}

impl PipelineBuilder {
    /// A builder without stages.
    pub fn new(config: AnalysisConfig, dataset: DatasetInfo) -> Self {
        Self {
            config,
            dataset,
            golden_json: None,
            inputs: None,
            stages: Vec::new(),
        }
    }

    /// A builder with the full mu+tau selection.
    pub fn mutau(config: AnalysisConfig, dataset: DatasetInfo) -> Self {
        Self::new(config, dataset)
            .stage(AttachBehavior::new())
            .stage(TransverseMass::new())
            .stage(McWeight::new())
            .stage(GoldenJsonFilter::new())
            .stage(TriggerSelection::new())
            .stage(JetVeto::new())
            .stage(MuonSelection::new())
            .stage(TauSelection::new())
            .stage(MuTauPairSelection::new())
            .stage(TriggerMatching::new())
            .stage(DileptonVeto::new())
            .stage(ExtraLeptonVeto::new())
            .stage(RelativeCharge::new())
            .stage(DileptonMass::new())
            .stage(ProcessIds::new())
            .stage(CategoryIds::new())
    }

    /// Append a stage.
    pub fn stage(mut self, stage: Box<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Use this golden JSON instead of the one referenced by the configuration.
    pub fn golden_json(mut self, golden_json: GoldenJson) -> Self {
        self.golden_json = Some(golden_json);
        self
    }

    /// Declare the columns the input batches provide. Without a declaration any column without
    /// a producer is taken as an input and checked per batch by [`Pipeline::check_batch`].
    pub fn inputs(mut self, inputs: Vec<ColumnRef>) -> Self {
        self.inputs = Some(inputs);
        self
    }

    /// Validate, bind and order the stages.
    pub fn build(self) -> MutauResult<Pipeline> {
        let PipelineBuilder {
            config,
            dataset,
            mut golden_json,
            inputs,
            stages,
        } = self;
        config.validate()?;
        if dataset.is_data() && golden_json.is_none() {
            golden_json = config.load_golden_json()?;
        }
        let ctx = StageContext::new(&config, &dataset, golden_json.as_ref());

        let mut bound: Vec<Box<dyn Stage>> = Vec::with_capacity(stages.len());
        let mut names = IndexSet::new();
        let mut step_names = IndexSet::new();
        for mut stage in stages {
            if !stage.applies_to(&ctx) {
                debug!(stage = stage.name(), dataset = %dataset.name, "stage skipped");
                continue;
            }
            stage.bind(&ctx)?;
            if !names.insert(stage.name().to_string()) {
                return Err(MutauError::DuplicateName {
                    category: "stage",
                    name: stage.name().to_string(),
                });
            }
            for step in stage.steps() {
                if !step_names.insert(step.clone()) {
                    return Err(MutauError::DuplicateName {
                        category: "step",
                        name: step,
                    });
                }
            }
            bound.push(stage);
        }

        let schedule = Schedule::new(&bound, inputs.as_deref())?;
        let mut slots: Vec<Option<Box<dyn Stage>>> = bound.into_iter().map(Some).collect();
        let stages: Vec<Box<dyn Stage>> = schedule
            .order
            .iter()
            .filter_map(|&i| slots[i].take())
            .collect();
        debug!(
            order = ?stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "stage order"
        );
        Ok(Pipeline {
            config,
            dataset,
            golden_json,
            stages,
            external_inputs: schedule.external_inputs,
        })
    }
}

/// Topological order of the stages and the columns nobody produces.
struct Schedule {
    order: Vec<usize>,
    external_inputs: Vec<ColumnRef>,
}

fn add_edge(edges: &mut [IndexSet<usize>], from: usize, to: usize) {
    if from != to {
        edges[from].insert(to);
    }
}

impl Schedule {
    /// Every column has at most one producer, which runs before all stages reading or updating
    /// it. Updates of a column apply in declaration order: a reader runs after the last update
    /// declared before it and before the next one. Ties are broken by declaration order.
    fn new(stages: &[Box<dyn Stage>], inputs: Option<&[ColumnRef]>) -> MutauResult<Self> {
        let n = stages.len();
        let mut producers: IndexMap<ColumnRef, usize> = IndexMap::new();
        for (i, stage) in stages.iter().enumerate() {
            for column in stage.produces() {
                if let Some(&first) = producers.get(&column) {
                    return Err(MutauError::DuplicateProducer {
                        column: column.to_string(),
                        first: stages[first].name().to_string(),
                        second: stage.name().to_string(),
                    });
                }
                producers.insert(column, i);
            }
        }
        let mut updaters: IndexMap<ColumnRef, Vec<usize>> = IndexMap::new();
        for (i, stage) in stages.iter().enumerate() {
            for column in stage.updates() {
                updaters.entry(column).or_default().push(i);
            }
        }

        let mut external_inputs: IndexSet<ColumnRef> = IndexSet::new();
        let mut require_input = |column: &ColumnRef, stage: usize| -> MutauResult<()> {
            if let Some(inputs) = inputs {
                if !inputs.contains(column) {
                    return Err(MutauError::UnsatisfiedDependency {
                        stage: stages[stage].name().to_string(),
                        column: column.to_string(),
                    });
                }
            }
            external_inputs.insert(column.clone());
            Ok(())
        };

        let mut edges: Vec<IndexSet<usize>> = vec![IndexSet::new(); n];
        for (i, stage) in stages.iter().enumerate() {
            for column in stage.uses() {
                match producers.get(&column) {
                    Some(&producer) => add_edge(&mut edges, producer, i),
                    None => require_input(&column, i)?,
                }
                if let Some(updates) = updaters.get(&column) {
                    if updates.contains(&i) {
                        continue;
                    }
                    if let Some(&before) = updates.iter().rev().find(|&&u| u < i) {
                        add_edge(&mut edges, before, i);
                    }
                    if let Some(&after) = updates.iter().find(|&&u| u > i) {
                        add_edge(&mut edges, i, after);
                    }
                }
            }
        }
        for (column, updates) in &updaters {
            match producers.get(column) {
                Some(&producer) => add_edge(&mut edges, producer, updates[0]),
                None => require_input(column, updates[0])?,
            }
            for pair in updates.windows(2) {
                add_edge(&mut edges, pair[0], pair[1]);
            }
        }

        let mut in_degree = vec![0usize; n];
        for targets in &edges {
            for &to in targets {
                in_degree[to] += 1;
            }
        }
        let mut done = vec![false; n];
        let mut order = Vec::with_capacity(n);
        while let Some(next) = (0..n).find(|&i| !done[i] && in_degree[i] == 0) {
            done[next] = true;
            order.push(next);
            for &to in &edges[next] {
                in_degree[to] -= 1;
            }
        }
        if order.len() < n {
            return Err(MutauError::DependencyCycle {
                stages: (0..n)
                    .filter(|&i| !done[i])
                    .map(|i| stages[i].name().to_string())
                    .collect(),
            });
        }
        Ok(Self {
            order,
            external_inputs: external_inputs.into_iter().collect(),
        })
    }
}

/// An ordered, bound list of stages for one dataset.
///
/// Every stage runs on every event; events are only excluded by the final AND of all steps,
/// so the cutflow shows what each step alone would remove.
#[derive(Clone)]
pub struct Pipeline {
    config: AnalysisConfig,
    dataset: DatasetInfo,
    golden_json: Option<GoldenJson>,
    stages: Vec<Box<dyn Stage>>,
    external_inputs: Vec<ColumnRef>,
}

impl Pipeline {
    /// The shared run state.
    pub fn context(&self) -> StageContext<'_> {
        StageContext::new(&self.config, &self.dataset, self.golden_json.as_ref())
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Step names in cutflow order.
    pub fn step_names(&self) -> Vec<String> {
        self.stages.iter().flat_map(|stage| stage.steps()).collect()
    }

    /// Columns the batches must provide.
    pub fn external_inputs(&self) -> &[ColumnRef] {
        &self.external_inputs
    }

    /// Check that `batch` holds every input column.
    pub fn check_batch(&self, batch: &EventBatch) -> MutauResult<()> {
        match self
            .external_inputs
            .iter()
            .find(|column| !batch.contains(column))
        {
            Some(column) => Err(MutauError::MissingColumn {
                column: column.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Run every stage on `batch`, then take the final decision and accumulate statistics.
    ///
    /// Output columns are added to `batch`; no event is removed from it.
    pub fn run(&self, batch: &mut EventBatch) -> MutauResult<SelectionOutcome> {
        self.check_batch(batch)?;
        let ctx = self.context();
        let n_events = batch.n_events();
        let mut result = SelectionResult::new();
        for stage in &self.stages {
            let stage_result = stage.run(batch, &ctx)?;
            for (step, mask) in &stage_result.steps {
                debug!(
                    stage = stage.name(),
                    step = %step,
                    passed = mask.iter().filter(|&&m| m).count(),
                    events = n_events,
                    "step"
                );
            }
            result += stage_result;
        }
        let selected = result.combined_steps(n_events)?;

        let mc_weight = ColumnRef::event("mc_weight");
        let weights = if self.dataset.is_mc && batch.contains(&mc_weight) {
            Some(batch.floats("mc_weight")?)
        } else {
            None
        };
        let cutflow = Cutflow::from_steps(n_events, &result.steps, weights)?;

        let process_ids = if batch.contains(&ColumnRef::event("process_id")) {
            batch.ints("process_id")?.to_vec()
        } else {
            vec![self.dataset.process_id; n_events]
        };
        let mut weight_map = WeightMap::new();
        weight_map.insert("num_events".to_string(), Weight::Count);
        weight_map.insert(
            "num_events_selected".to_string(),
            Weight::CountMasked(&selected),
        );
        if let Some(weights) = weights {
            weight_map.insert("sum_mc_weight".to_string(), Weight::Values(weights));
            weight_map.insert(
                "sum_mc_weight_selected".to_string(),
                Weight::ValuesMasked(weights, &selected),
            );
        }
        let mut group_map = GroupMap::new();
        group_map.insert("process".to_string(), process_ids.as_slice());
        let mut stats = SelectionStats::default();
        increment_stats(&mut stats, n_events, &weight_map, &group_map)?;

        info!(
            dataset = %self.dataset.name,
            events = n_events,
            selected = selected.iter().filter(|&&s| s).count(),
            "processed batch"
        );
        result.event = Some(selected);
        Ok(SelectionOutcome {
            result,
            cutflow,
            stats,
        })
    }

    /// Run every batch and reduce their cutflows and statistics.
    #[cfg(not(feature = "rayon"))]
    pub fn run_batches(&self, batches: &mut [EventBatch]) -> MutauResult<BatchesOutcome> {
        let outcomes = batches
            .iter_mut()
            .map(|batch| self.run(batch))
            .collect::<MutauResult<Vec<_>>>()?;
        Ok(Self::reduce(outcomes))
    }

    /// Run every batch in parallel and reduce their cutflows and statistics.
    #[cfg(feature = "rayon")]
    pub fn run_batches(&self, batches: &mut [EventBatch]) -> MutauResult<BatchesOutcome> {
        let outcomes = batches
            .par_iter_mut()
            .map(|batch| self.run(batch))
            .collect::<MutauResult<Vec<_>>>()?;
        Ok(Self::reduce(outcomes))
    }

    fn reduce(outcomes: Vec<SelectionOutcome>) -> BatchesOutcome {
        outcomes
            .into_iter()
            .fold(BatchesOutcome::default(), |mut total, outcome| {
                total.cutflow += outcome.cutflow;
                total.stats += outcome.stats;
                total.results.push(outcome.result);
                total
            })
    }
}
