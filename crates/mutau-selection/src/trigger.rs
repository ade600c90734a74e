use mutau_core::{
    utils::vectors::delta_r, ColumnRef, EventBatch, Jagged, MutauError, MutauResult,
    ParticleKind, Trigger, TriggerLeg,
};
use tracing::{debug, warn};

use crate::{
    result::{SelectionResult, TriggerData},
    stage::{clear_pairs, resolved_pairs, Stage, StageContext, PAIR_MUON_IDX, PAIR_TAU_IDX},
};

/// Name of the `TrigObj` attribute holding the objects matched to leg `leg` of `trigger`.
pub fn leg_mask_field(trigger: &Trigger, leg: usize) -> String {
    format!("{}_leg{}", trigger.hlt_field(), leg)
}

/// Trigger objects passing one leg: particle code, minimum pt and every filter-bit group.
pub fn leg_mask(leg: &TriggerLeg, ids: &[i64], pts: &[f64], bits: &[i64]) -> Vec<bool> {
    ids.iter()
        .zip(pts)
        .zip(bits)
        .map(|((id, pt), bits)| {
            leg.pdg_id.map_or(true, |pdg_id| id.abs() == pdg_id.abs())
                && leg.min_pt.map_or(true, |min_pt| *pt >= min_pt)
                && leg.trigger_bits.iter().all(|group| bits & group != 0)
        })
        .collect()
}

/// Trigger decisions with leg matching.
///
/// A trigger fires if its HLT decision is set and every leg is matched by at least one trigger
/// object. The step `trigger` requires at least one applicable trigger to fire, and the ids of
/// the firing triggers are written to `trigger_ids` in declaration order.
///
/// The step is therefore stricter than the OR of the raw HLT decisions: an event whose HLT bit
/// is set but whose legs have no matching trigger object fails `trigger`.
#[derive(Clone, Default)]
pub struct TriggerSelection {
    triggers: Vec<Trigger>,
}

impl TriggerSelection {
    pub fn new() -> Box<Self> {
        Self::default().into()
    }
}

impl Stage for TriggerSelection {
    fn name(&self) -> &str {
        "trigger_selection"
    }

    fn bind(&mut self, ctx: &StageContext) -> MutauResult<()> {
        self.triggers = ctx
            .config
            .triggers
            .iter()
            .filter(|trigger| trigger.applies_to(ctx.dataset))
            .cloned()
            .collect();
        for trigger in &self.triggers {
            for pdg_id in trigger.legs.iter().filter_map(|leg| leg.pdg_id) {
                if ParticleKind::from_pdg_id(pdg_id).is_none() {
                    return Err(MutauError::UnknownParticleCode {
                        trigger: trigger.name.clone(),
                        pdg_id,
                    });
                }
            }
        }
        Ok(())
    }

    fn uses(&self) -> Vec<ColumnRef> {
        ColumnRef::objects("TrigObj", &["id", "pt", "filterBits"])
    }

    fn produces(&self) -> Vec<ColumnRef> {
        let mut columns = vec![ColumnRef::event("trigger_ids")];
        for trigger in &self.triggers {
            for leg in 0..trigger.legs.len() {
                columns.push(ColumnRef::object(
                    "TrigObj",
                    &leg_mask_field(trigger, leg),
                ));
            }
        }
        columns
    }

    fn steps(&self) -> Vec<String> {
        vec!["trigger".to_string()]
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        let n_events = batch.n_events();
        let trigobj = batch.collection("TrigObj")?;
        let ids = trigobj.ints("id")?;
        let pts = trigobj.floats("pt")?;
        let bits = trigobj.ints("filterBits")?;

        let mut fired_ids: Vec<Vec<i64>> = vec![Vec::new(); n_events];
        let mut any_fired = vec![false; n_events];
        let mut triggers = Vec::with_capacity(self.triggers.len());
        let mut leg_columns = Vec::new();
        for trigger in &self.triggers {
            let hlt = trigger.hlt_column();
            let raw = if batch.contains(&ColumnRef::event(&hlt)) {
                batch.bools(&hlt)?.to_vec()
            } else {
                warn!(
                    trigger = %trigger.name,
                    column = %hlt,
                    "HLT decision not in batch, treating trigger as not fired"
                );
                vec![false; n_events]
            };
            let leg_masks = trigger
                .legs
                .iter()
                .map(|leg| {
                    Jagged::from_offsets(trigobj.offsets().to_vec(), leg_mask(leg, ids, pts, bits))
                })
                .collect::<MutauResult<Vec<_>>>()?;
            let matched: Vec<Vec<bool>> = leg_masks.iter().map(Jagged::any).collect();
            let fired: Vec<bool> = (0..n_events)
                .map(|event| raw[event] && matched.iter().all(|leg| leg[event]))
                .collect();
            for (event, _) in fired.iter().enumerate().filter(|(_, &f)| f) {
                fired_ids[event].push(trigger.id);
                any_fired[event] = true;
            }
            debug!(
                trigger = %trigger.name,
                raw = raw.iter().filter(|&&r| r).count(),
                fired = fired.iter().filter(|&&f| f).count(),
                "trigger decision"
            );
            for (leg, mask) in leg_masks.iter().enumerate() {
                leg_columns.push((leg_mask_field(trigger, leg), mask.clone()));
            }
            triggers.push(TriggerData {
                name: trigger.name.clone(),
                id: trigger.id,
                fired,
                leg_masks,
            });
        }

        let trigobj = batch.collection_mut("TrigObj")?;
        for (field, mask) in leg_columns {
            trigobj.set_mask(&field, mask)?;
        }
        batch.set_list("trigger_ids", Jagged::from_lists(fired_ids))?;
        Ok(SelectionResult {
            triggers,
            ..Default::default()
        }
        .with_step("trigger", any_fired))
    }
}

/// Matching of the resolved muon to a trigger object of a muon leg.
///
/// Events whose muon has no matching object within `max_delta_r` fail `trigger_matching` and
/// lose their resolved pair.
#[derive(Clone, Default)]
pub struct TriggerMatching {
    leg_fields: Vec<String>,
    max_delta_r: f64,
}

impl TriggerMatching {
    pub fn new() -> Box<Self> {
        Self::default().into()
    }
}

impl Stage for TriggerMatching {
    fn name(&self) -> &str {
        "trigger_matching"
    }

    fn applies_to(&self, ctx: &StageContext) -> bool {
        ctx.config.trigger_matching.enabled
    }

    fn bind(&mut self, ctx: &StageContext) -> MutauResult<()> {
        self.max_delta_r = ctx.config.trigger_matching.max_delta_r;
        self.leg_fields = ctx
            .config
            .triggers
            .iter()
            .filter(|trigger| trigger.applies_to(ctx.dataset))
            .flat_map(|trigger| {
                trigger
                    .legs
                    .iter()
                    .enumerate()
                    .filter(|(_, leg)| {
                        leg.pdg_id.map(i64::abs) == Some(ParticleKind::Muon.pdg_id())
                    })
                    .map(|(k, _)| leg_mask_field(trigger, k))
                    .collect::<Vec<_>>()
            })
            .collect();
        Ok(())
    }

    fn uses(&self) -> Vec<ColumnRef> {
        let mut columns = ColumnRef::objects("Muon", &["eta", "phi"]);
        columns.extend(ColumnRef::objects("TrigObj", &["eta", "phi"]));
        for field in &self.leg_fields {
            columns.push(ColumnRef::object("TrigObj", field));
        }
        columns
    }

    fn updates(&self) -> Vec<ColumnRef> {
        vec![
            ColumnRef::event(PAIR_MUON_IDX),
            ColumnRef::event(PAIR_TAU_IDX),
        ]
    }

    fn steps(&self) -> Vec<String> {
        vec!["trigger_matching".to_string()]
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        let pairs = resolved_pairs(batch)?;
        let muons = batch.collection("Muon")?;
        let trigobj = batch.collection("TrigObj")?;
        let (mu_eta, mu_phi) = (muons.floats("eta")?, muons.floats("phi")?);
        let (obj_eta, obj_phi) = (trigobj.floats("eta")?, trigobj.floats("phi")?);
        let leg_masks = self
            .leg_fields
            .iter()
            .map(|field| trigobj.bools(field))
            .collect::<MutauResult<Vec<_>>>()?;
        let matched: Vec<bool> = pairs
            .iter()
            .enumerate()
            .map(|(event, pair)| match pair {
                None => false,
                Some((muon, _)) => {
                    let i = muons.range(event).start + muon;
                    trigobj.range(event).any(|j| {
                        leg_masks.iter().any(|mask| mask[j])
                            && delta_r(mu_eta[i], mu_phi[i], obj_eta[j], obj_phi[j])
                                < self.max_delta_r
                    })
                }
            })
            .collect();
        debug!(
            stage = self.name(),
            matched = matched.iter().filter(|&&m| m).count(),
            "trigger matching"
        );
        Ok(clear_pairs(batch, &matched)?.with_step("trigger_matching", matched))
    }
}
