use indexmap::IndexMap;
use mutau_core::{
    utils::threshold_tag, Collection, Column, ColumnRef, Comparison, EventBatch, Jagged,
    MutauError, MutauResult, Value,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    result::SelectionResult,
    stage::{Stage, StageContext},
};

/// A predicate on a single object attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cut {
    /// `value <op> threshold`; the threshold type must match the column type.
    Compare(Comparison, Value),
    /// `|value| < threshold` on a float attribute.
    AbsLess(f64),
    /// Integer attribute not in the list.
    NotIn(Vec<i64>),
    /// Boolean attribute is set.
    IsTrue,
}

impl Cut {
    /// `value > threshold`
    pub fn greater(threshold: impl Into<Value>) -> Self {
        Cut::Compare(Comparison::Greater, threshold.into())
    }
    /// `value >= threshold`
    pub fn greater_eq(threshold: impl Into<Value>) -> Self {
        Cut::Compare(Comparison::GreaterEq, threshold.into())
    }
    /// `value < threshold`
    pub fn less(threshold: impl Into<Value>) -> Self {
        Cut::Compare(Comparison::Less, threshold.into())
    }

    fn evaluate(&self, field: &str, column: &Column) -> MutauResult<Vec<bool>> {
        let mismatch = |expected: &'static str| MutauError::ColumnType {
            column: field.to_string(),
            expected,
            found: match column {
                Column::Float(_) => "float",
                Column::Int(_) => "int",
                Column::Bool(_) => "bool",
            },
        };
        match (self, column) {
            (Cut::Compare(op, Value::Float(t)), Column::Float(v)) => {
                Ok(v.iter().map(|x| op.compare(*x, *t)).collect())
            }
            (Cut::Compare(op, Value::Int(t)), Column::Int(v)) => {
                Ok(v.iter().map(|x| op.compare(*x, *t)).collect())
            }
            (Cut::Compare(op, Value::Bool(t)), Column::Bool(v)) => {
                Ok(v.iter().map(|x| op.compare(*x, *t)).collect())
            }
            (Cut::Compare(_, Value::Float(_)), _) => Err(mismatch("float")),
            (Cut::Compare(_, Value::Int(_)), _) => Err(mismatch("int")),
            (Cut::Compare(_, Value::Bool(_)), _) => Err(mismatch("bool")),
            (Cut::AbsLess(t), Column::Float(v)) => Ok(v.iter().map(|x| x.abs() < *t).collect()),
            (Cut::AbsLess(_), _) => Err(mismatch("float")),
            (Cut::NotIn(excluded), Column::Int(v)) => {
                Ok(v.iter().map(|x| !excluded.contains(x)).collect())
            }
            (Cut::NotIn(_), _) => Err(mismatch("int")),
            (Cut::IsTrue, Column::Bool(v)) => Ok(v.clone()),
            (Cut::IsTrue, _) => Err(mismatch("bool")),
        }
    }
}

/// A named [`Cut`] on one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCut {
    /// Step name used for cutflow accounting
    pub step: String,
    /// Attribute the cut is applied to
    pub field: String,
    pub cut: Cut,
}

impl NamedCut {
    pub fn new(step: &str, field: &str, cut: Cut) -> Self {
        Self {
            step: step.to_string(),
            field: field.to_string(),
            cut,
        }
    }
}

/// Output of an [`ObjectSelector`].
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSelection {
    /// Objects passing every cut
    pub mask: Jagged<bool>,
    /// Per cut: does the event have an object passing this and all earlier cuts?
    pub steps: IndexMap<String, Vec<bool>>,
}

/// An ordered list of cuts on one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectSelector {
    pub collection: String,
    pub cuts: Vec<NamedCut>,
}

impl ObjectSelector {
    /// A selector without cuts.
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            cuts: Vec::new(),
        }
    }

    /// Append a cut.
    pub fn cut(mut self, step: &str, field: &str, cut: Cut) -> Self {
        self.cuts.push(NamedCut::new(step, field, cut));
        self
    }

    /// Attributes read by the cuts.
    pub fn uses(&self) -> Vec<ColumnRef> {
        let mut fields: Vec<&str> = Vec::new();
        for cut in &self.cuts {
            if !fields.contains(&cut.field.as_str()) {
                fields.push(&cut.field);
            }
        }
        ColumnRef::objects(&self.collection, &fields)
    }

    /// Step names in cut order.
    pub fn step_names(&self) -> Vec<String> {
        self.cuts.iter().map(|cut| cut.step.clone()).collect()
    }

    /// Apply the cuts in order to `collection`.
    pub fn apply(&self, collection: &Collection) -> MutauResult<ObjectSelection> {
        let mut mask = Jagged::filled(collection.offsets(), true);
        let mut steps = IndexMap::new();
        for cut in &self.cuts {
            let passed = cut.cut.evaluate(&cut.field, collection.column(&cut.field)?)?;
            mask = mask.and(&Jagged::from_offsets(collection.offsets().to_vec(), passed)?)?;
            steps.insert(cut.step.clone(), mask.any());
        }
        Ok(ObjectSelection { mask, steps })
    }
}

fn log_steps(stage: &str, steps: &IndexMap<String, Vec<bool>>) {
    for (step, mask) in steps {
        debug!(
            stage,
            step,
            passed = mask.iter().filter(|&&m| m).count(),
            events = mask.len(),
            "object selection step"
        );
    }
}

/// Preselection of the muon candidates. Writes `Muon.preselected`.
#[derive(Clone, Default)]
pub struct MuonSelection {
    selector: ObjectSelector,
}

impl MuonSelection {
    pub fn new() -> Box<Self> {
        Self::default().into()
    }
}

impl Stage for MuonSelection {
    fn name(&self) -> &str {
        "muon_selection"
    }

    fn bind(&mut self, ctx: &StageContext) -> MutauResult<()> {
        let cuts = &ctx.config.muon;
        self.selector = ObjectSelector::new("Muon")
            .cut(
                &format!("muon_pt_{}", threshold_tag(cuts.min_pt)),
                "pt",
                Cut::greater(cuts.min_pt),
            )
            .cut(
                &format!("muon_eta_{}", threshold_tag(cuts.max_abs_eta)),
                "eta",
                Cut::AbsLess(cuts.max_abs_eta),
            )
            .cut("mediumID", "mediumId", Cut::IsTrue)
            .cut(
                &format!("muon_dxy_{}", threshold_tag(cuts.max_abs_dxy)),
                "dxy",
                Cut::AbsLess(cuts.max_abs_dxy),
            )
            .cut(
                &format!("muon_dz_{}", threshold_tag(cuts.max_abs_dz)),
                "dz",
                Cut::AbsLess(cuts.max_abs_dz),
            );
        Ok(())
    }

    fn uses(&self) -> Vec<ColumnRef> {
        self.selector.uses()
    }

    fn produces(&self) -> Vec<ColumnRef> {
        vec![ColumnRef::object("Muon", "preselected")]
    }

    fn steps(&self) -> Vec<String> {
        self.selector.step_names()
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        let selection = self.selector.apply(batch.collection("Muon")?)?;
        log_steps(self.name(), &selection.steps);
        let indices = selection.mask.local_indices();
        batch
            .collection_mut("Muon")?
            .set_mask("preselected", selection.mask)?;
        Ok(SelectionResult {
            steps: selection.steps,
            ..Default::default()
        }
        .with_objects("Muon", "Muon", indices))
    }
}

/// Preselection of the hadronic tau candidates. Writes `Tau.preselected`.
#[derive(Clone, Default)]
pub struct TauSelection {
    selector: ObjectSelector,
}

impl TauSelection {
    pub fn new() -> Box<Self> {
        Self::default().into()
    }
}

impl Stage for TauSelection {
    fn name(&self) -> &str {
        "tau_selection"
    }

    fn bind(&mut self, ctx: &StageContext) -> MutauResult<()> {
        let deep_tau = &ctx.config.deep_tau;
        let cuts = &ctx.config.tau;
        self.selector = ObjectSelector::new("Tau")
            .cut(
                "DeepTauVSjet",
                &deep_tau.id_column("jet"),
                Cut::greater_eq(deep_tau.vs_jet_rank()?),
            )
            .cut(
                "DeepTauVSe",
                &deep_tau.id_column("e"),
                Cut::greater_eq(deep_tau.vs_e_rank()?),
            )
            .cut(
                "DeepTauVSmu",
                &deep_tau.id_column("mu"),
                Cut::greater_eq(deep_tau.vs_mu_rank()?),
            )
            .cut(
                &format!("tau_eta_{}", threshold_tag(cuts.max_abs_eta)),
                "eta",
                Cut::AbsLess(cuts.max_abs_eta),
            )
            .cut(
                &format!("tau_dz_{}", threshold_tag(cuts.max_abs_dz)),
                "dz",
                Cut::AbsLess(cuts.max_abs_dz),
            )
            .cut(
                &format!("tau_pt_{}", threshold_tag(cuts.min_pt)),
                "pt",
                Cut::greater(cuts.min_pt),
            )
            .cut(
                "tau_1and3prong",
                "decayMode",
                Cut::NotIn(cuts.excluded_decay_modes.clone()),
            );
        Ok(())
    }

    fn uses(&self) -> Vec<ColumnRef> {
        self.selector.uses()
    }

    fn produces(&self) -> Vec<ColumnRef> {
        vec![ColumnRef::object("Tau", "preselected")]
    }

    fn steps(&self) -> Vec<String> {
        self.selector.step_names()
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        let selection = self.selector.apply(batch.collection("Tau")?)?;
        log_steps(self.name(), &selection.steps);
        let indices = selection.mask.local_indices();
        batch
            .collection_mut("Tau")?
            .set_mask("preselected", selection.mask)?;
        Ok(SelectionResult {
            steps: selection.steps,
            ..Default::default()
        }
        .with_objects("Tau", "Tau", indices))
    }
}

/// Veto of events with a b-tagged jet. Step `b_jet_veto` is true when no jet passes the
/// b-tag selection; `Jet.veto_clean` marks the jets that do not.
#[derive(Clone, Default)]
pub struct JetVeto {
    selector: ObjectSelector,
}

impl JetVeto {
    pub fn new() -> Box<Self> {
        Self::default().into()
    }
}

impl Stage for JetVeto {
    fn name(&self) -> &str {
        "jet_veto"
    }

    fn bind(&mut self, ctx: &StageContext) -> MutauResult<()> {
        let cuts = &ctx.config.jet_veto;
        self.selector = ObjectSelector::new("Jet")
            .cut(
                &format!("jet_veto_pt_{}", threshold_tag(cuts.min_pt)),
                "pt",
                Cut::greater(cuts.min_pt),
            )
            .cut(
                &format!("jet_veto_eta_{}", threshold_tag(cuts.max_abs_eta)),
                "eta",
                Cut::AbsLess(cuts.max_abs_eta),
            )
            .cut(
                "deepJet_veto_medium",
                "btagDeepFlavB",
                Cut::greater(ctx.config.btag_threshold()),
            );
        Ok(())
    }

    fn uses(&self) -> Vec<ColumnRef> {
        self.selector.uses()
    }

    fn produces(&self) -> Vec<ColumnRef> {
        vec![ColumnRef::object("Jet", "veto_clean")]
    }

    fn steps(&self) -> Vec<String> {
        vec!["b_jet_veto".to_string()]
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        let selection = self.selector.apply(batch.collection("Jet")?)?;
        let veto: Vec<bool> = selection.mask.any().iter().map(|b| !b).collect();
        debug!(
            stage = self.name(),
            passed = veto.iter().filter(|&&v| v).count(),
            events = veto.len(),
            "b-jet veto"
        );
        let clean = selection.mask.not();
        let indices = clean.local_indices();
        batch.collection_mut("Jet")?.set_mask("veto_clean", clean)?;
        Ok(SelectionResult::new()
            .with_step("b_jet_veto", veto)
            .with_objects("Jet", "Jet", indices))
    }
}
