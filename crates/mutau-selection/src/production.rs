use mutau_core::{
    utils::vectors::transverse_mass, Column, ColumnRef, EventBatch, MutauResult, Vec4,
    EMPTY_FLOAT,
};
use tracing::debug;

use crate::{
    result::SelectionResult,
    stage::{resolved_pairs, Stage, StageContext, PAIR_MUON_IDX, PAIR_TAU_IDX},
};

/// Invariant mass of a two-body system, or [`EMPTY_FLOAT`] when the squared mass is negative.
pub fn pair_mass(a: &Vec4, b: &Vec4) -> f64 {
    (a + b).mass().unwrap_or(EMPTY_FLOAT)
}

/// Transverse mass of every muon with the missing transverse momentum, written to `Muon.mT`.
#[derive(Clone, Default)]
pub struct TransverseMass;

impl TransverseMass {
    pub fn new() -> Box<Self> {
        Self.into()
    }
}

impl Stage for TransverseMass {
    fn name(&self) -> &str {
        "muon_mt"
    }

    fn uses(&self) -> Vec<ColumnRef> {
        let mut columns = ColumnRef::objects("Muon", &["pt", "phi"]);
        columns.push(ColumnRef::event("MET.pt"));
        columns.push(ColumnRef::event("MET.phi"));
        columns
    }

    fn produces(&self) -> Vec<ColumnRef> {
        vec![ColumnRef::object("Muon", "mT")]
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        let muons = batch.collection("Muon")?;
        let (pt, phi) = (muons.floats("pt")?, muons.floats("phi")?);
        let (met_pt, met_phi) = (batch.floats("MET.pt")?, batch.floats("MET.phi")?);
        let mut mt = Vec::with_capacity(muons.n_objects());
        for event in 0..batch.n_events() {
            for i in muons.range(event) {
                mt.push(transverse_mass(pt[i], phi[i], met_pt[event], met_phi[event]));
            }
        }
        batch
            .collection_mut("Muon")?
            .set_column("mT", Column::Float(mt))?;
        Ok(SelectionResult::new())
    }
}

/// Invariant mass of the resolved pair (`mutau_mass`). Simulation additionally gets
/// `mutau_mass_no_tes`, built from the tau before its energy-scale correction.
#[derive(Clone, Default)]
pub struct DileptonMass {
    is_mc: bool,
}

impl DileptonMass {
    pub fn new() -> Box<Self> {
        Self::default().into()
    }
}

impl Stage for DileptonMass {
    fn name(&self) -> &str {
        "dilepton_mass"
    }

    fn bind(&mut self, ctx: &StageContext) -> MutauResult<()> {
        self.is_mc = ctx.dataset.is_mc;
        Ok(())
    }

    fn uses(&self) -> Vec<ColumnRef> {
        let mut columns = ColumnRef::objects("Muon", &["pt", "eta", "phi", "mass"]);
        columns.extend(ColumnRef::objects("Tau", &["pt", "eta", "phi", "mass"]));
        if self.is_mc {
            columns.extend(ColumnRef::objects("Tau", &["pt_no_tes", "mass_no_tes"]));
        }
        columns.push(ColumnRef::event(PAIR_MUON_IDX));
        columns.push(ColumnRef::event(PAIR_TAU_IDX));
        columns
    }

    fn produces(&self) -> Vec<ColumnRef> {
        let mut columns = vec![ColumnRef::event("mutau_mass")];
        if self.is_mc {
            columns.push(ColumnRef::event("mutau_mass_no_tes"));
        }
        columns
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        let pairs = resolved_pairs(batch)?;
        let muons = batch.collection("Muon")?.kinematics()?;
        let taus = batch.collection("Tau")?;
        let tau_p4 = taus.kinematics()?;
        let mass: Vec<f64> = pairs
            .iter()
            .enumerate()
            .map(|(event, pair)| {
                pair.map_or(EMPTY_FLOAT, |(m, t)| {
                    pair_mass(&muons.p4(event, m), &tau_p4.p4(event, t))
                })
            })
            .collect();
        let mass_no_tes = if self.is_mc {
            let pt = taus.floats("pt_no_tes")?;
            let tau_mass = taus.floats("mass_no_tes")?;
            Some(
                pairs
                    .iter()
                    .enumerate()
                    .map(|(event, pair)| {
                        pair.map_or(EMPTY_FLOAT, |(m, t)| {
                            let i = taus.range(event).start + t;
                            let (eta, phi) = tau_p4.eta_phi(event, t);
                            let tau = Vec4::from_pt_eta_phi_m(pt[i], eta, phi, tau_mass[i]);
                            pair_mass(&muons.p4(event, m), &tau)
                        })
                    })
                    .collect::<Vec<f64>>(),
            )
        } else {
            None
        };
        debug!(
            stage = self.name(),
            defined = mass.iter().filter(|&&m| m != EMPTY_FLOAT).count(),
            "dilepton mass"
        );
        batch.set_field("mutau_mass", Column::Float(mass))?;
        if let Some(mass_no_tes) = mass_no_tes {
            batch.set_field("mutau_mass_no_tes", Column::Float(mass_no_tes))?;
        }
        Ok(SelectionResult::new())
    }
}

/// Product of the charges of the resolved pair (`rel_charge`), zero without a pair.
#[derive(Clone, Default)]
pub struct RelativeCharge;

impl RelativeCharge {
    pub fn new() -> Box<Self> {
        Self.into()
    }
}

impl Stage for RelativeCharge {
    fn name(&self) -> &str {
        "rel_charge"
    }

    fn uses(&self) -> Vec<ColumnRef> {
        vec![
            ColumnRef::object("Muon", "charge"),
            ColumnRef::object("Tau", "charge"),
            ColumnRef::event(PAIR_MUON_IDX),
            ColumnRef::event(PAIR_TAU_IDX),
        ]
    }

    fn produces(&self) -> Vec<ColumnRef> {
        vec![ColumnRef::event("rel_charge")]
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        let pairs = resolved_pairs(batch)?;
        let muons = batch.collection("Muon")?;
        let taus = batch.collection("Tau")?;
        let (muon_charge, tau_charge) = (muons.ints("charge")?, taus.ints("charge")?);
        let rel_charge: Vec<i64> = pairs
            .iter()
            .enumerate()
            .map(|(event, pair)| {
                pair.map_or(0, |(m, t)| {
                    muon_charge[muons.range(event).start + m]
                        * tau_charge[taus.range(event).start + t]
                })
            })
            .collect();
        batch.set_field("rel_charge", Column::Int(rel_charge))?;
        Ok(SelectionResult::new())
    }
}
