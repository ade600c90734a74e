//! Hand-built NanoAOD-like batches for the unit tests.
use mutau_core::{Collection, CollectionBuilder, Column, EventBatch, Value, ValueKind};

#[derive(Debug, Clone, Copy)]
pub(crate) struct MuonSpec {
    pub pt: f64,
    pub eta: f64,
    pub phi: f64,
    pub charge: i64,
    pub medium: bool,
    pub dxy: f64,
    pub dz: f64,
    pub iso: f64,
    pub is_global: bool,
    pub is_pf: bool,
}

impl MuonSpec {
    pub fn good(pt: f64, eta: f64, phi: f64, charge: i64) -> Self {
        Self {
            pt,
            eta,
            phi,
            charge,
            medium: true,
            dxy: 0.01,
            dz: 0.01,
            iso: 0.05,
            is_global: true,
            is_pf: true,
        }
    }

    fn row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("pt", self.pt.into()),
            ("eta", self.eta.into()),
            ("phi", self.phi.into()),
            ("mass", Value::Float(0.10566)),
            ("charge", self.charge.into()),
            ("mediumId", self.medium.into()),
            ("dxy", self.dxy.into()),
            ("dz", self.dz.into()),
            ("pfRelIso04_all", self.iso.into()),
            ("isGlobal", self.is_global.into()),
            ("isPFcand", self.is_pf.into()),
        ]
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TauSpec {
    pub pt: f64,
    pub eta: f64,
    pub phi: f64,
    pub mass: f64,
    pub charge: i64,
    pub dz: f64,
    pub decay_mode: i64,
    pub vs_jet: i64,
    pub vs_e: i64,
    pub vs_mu: i64,
    pub raw_vs_jet: f64,
}

impl TauSpec {
    pub fn good(pt: f64, eta: f64, phi: f64, charge: i64) -> Self {
        Self {
            pt,
            eta,
            phi,
            mass: 1.2,
            charge,
            dz: 0.01,
            decay_mode: 0,
            vs_jet: 5,
            vs_e: 2,
            vs_mu: 4,
            raw_vs_jet: 0.9,
        }
    }

    fn row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("pt", self.pt.into()),
            ("eta", self.eta.into()),
            ("phi", self.phi.into()),
            ("mass", self.mass.into()),
            ("charge", self.charge.into()),
            ("dz", self.dz.into()),
            ("decayMode", self.decay_mode.into()),
            ("idDeepTau2018v2p5VSjet", self.vs_jet.into()),
            ("idDeepTau2018v2p5VSe", self.vs_e.into()),
            ("idDeepTau2018v2p5VSmu", self.vs_mu.into()),
            ("rawDeepTau2018v2p5VSjet", self.raw_vs_jet.into()),
            // energy scale applied to hadronic taus only
            ("pt_no_tes", (self.pt / 1.02).into()),
            ("mass_no_tes", (self.mass / 1.02).into()),
        ]
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct JetSpec {
    pub pt: f64,
    pub eta: f64,
    pub btag: f64,
}

impl JetSpec {
    pub fn new(pt: f64, eta: f64, btag: f64) -> Self {
        Self { pt, eta, btag }
    }

    fn row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("pt", self.pt.into()),
            ("eta", self.eta.into()),
            ("phi", Value::Float(0.0)),
            ("mass", Value::Float(5.0)),
            ("btagDeepFlavB", self.btag.into()),
        ]
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TrigObjSpec {
    pub id: i64,
    pub pt: f64,
    pub eta: f64,
    pub phi: f64,
    pub bits: i64,
}

impl TrigObjSpec {
    pub fn new(id: i64, pt: f64, bits: i64) -> Self {
        Self {
            id,
            pt,
            eta: 0.0,
            phi: 0.0,
            bits,
        }
    }

    pub fn at(self, eta: f64, phi: f64) -> Self {
        Self { eta, phi, ..self }
    }

    fn row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("pt", self.pt.into()),
            ("eta", self.eta.into()),
            ("phi", self.phi.into()),
            ("filterBits", self.bits.into()),
        ]
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EventSpec {
    pub muons: Vec<MuonSpec>,
    pub taus: Vec<TauSpec>,
    pub jets: Vec<JetSpec>,
    pub trigobjs: Vec<TrigObjSpec>,
    pub met_pt: f64,
    pub met_phi: f64,
    pub hlt: Vec<(&'static str, bool)>,
    pub gen_weight: f64,
    pub run: i64,
    pub lumi: i64,
}

impl Default for EventSpec {
    fn default() -> Self {
        Self {
            muons: Vec::new(),
            taus: Vec::new(),
            jets: Vec::new(),
            trigobjs: Vec::new(),
            met_pt: 10.0,
            met_phi: 0.0,
            hlt: Vec::new(),
            gen_weight: 1.0,
            run: 355100,
            lumi: 1,
        }
    }
}

pub(crate) const HLT_FIELDS: [&str; 3] = [
    "IsoMu24",
    "IsoMu27",
    "IsoMu20_eta2p1_LooseDeepTauPFTauHPS27_eta2p1_CrossL1",
];

fn schema_of(row: &[(&str, Value)]) -> Vec<(String, ValueKind)> {
    row.iter()
        .map(|(field, value)| (field.to_string(), value.kind()))
        .collect()
}

fn collection<T>(
    events: &[Vec<T>],
    template: T,
    row: impl Fn(&T) -> Vec<(&'static str, Value)>,
) -> Collection {
    let schema = schema_of(&row(&template));
    let mut builder = schema
        .iter()
        .fold(CollectionBuilder::new(), |b, (field, kind)| b.declare(field, *kind));
    for event in events {
        let rows: Vec<Vec<(&str, Value)>> = event.iter().map(&row).collect();
        let objects: Vec<&[(&str, Value)]> = rows.iter().map(Vec::as_slice).collect();
        builder.push_event(&objects).unwrap();
    }
    builder.build()
}

pub(crate) fn muon_collection(events: &[Vec<MuonSpec>]) -> Collection {
    collection(events, MuonSpec::good(0.0, 0.0, 0.0, 1), MuonSpec::row)
}

pub(crate) fn tau_collection(events: &[Vec<TauSpec>]) -> Collection {
    collection(events, TauSpec::good(0.0, 0.0, 0.0, 1), TauSpec::row)
}

pub(crate) fn jet_collection(events: &[Vec<JetSpec>]) -> Collection {
    collection(events, JetSpec::new(0.0, 0.0, 0.0), JetSpec::row)
}

pub(crate) fn trigobj_collection(events: &[Vec<TrigObjSpec>]) -> Collection {
    collection(events, TrigObjSpec::new(0, 0.0, 0), TrigObjSpec::row)
}

/// A complete batch with every input column of the default pipeline.
pub(crate) fn batch(events: &[EventSpec]) -> EventBatch {
    let n = events.len();
    let mut batch = EventBatch::new(n);
    let floats = |f: fn(&EventSpec) -> f64| Column::Float(events.iter().map(f).collect());
    let ints = |f: fn(&EventSpec) -> i64| Column::Int(events.iter().map(f).collect());
    batch
        .set_field("event", Column::Int((0..n as i64).collect()))
        .unwrap();
    batch.set_field("run", ints(|e| e.run)).unwrap();
    batch.set_field("luminosityBlock", ints(|e| e.lumi)).unwrap();
    batch.set_field("genWeight", floats(|e| e.gen_weight)).unwrap();
    batch.set_field("MET.pt", floats(|e| e.met_pt)).unwrap();
    batch.set_field("MET.phi", floats(|e| e.met_phi)).unwrap();
    for field in HLT_FIELDS {
        let fired = events
            .iter()
            .map(|e| e.hlt.iter().any(|(name, bit)| *name == field && *bit))
            .collect();
        batch
            .set_field(&format!("HLT.{field}"), Column::Bool(fired))
            .unwrap();
    }
    let muons: Vec<_> = events.iter().map(|e| e.muons.clone()).collect();
    let taus: Vec<_> = events.iter().map(|e| e.taus.clone()).collect();
    let jets: Vec<_> = events.iter().map(|e| e.jets.clone()).collect();
    let trigobjs: Vec<_> = events.iter().map(|e| e.trigobjs.clone()).collect();
    batch.set_collection("Muon", muon_collection(&muons)).unwrap();
    batch.set_collection("Tau", tau_collection(&taus)).unwrap();
    batch.set_collection("Jet", jet_collection(&jets)).unwrap();
    batch
        .set_collection("TrigObj", trigobj_collection(&trigobjs))
        .unwrap();
    batch
}
