use std::{fs, path::PathBuf};

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::{utils::enums::ParticleKind, MutauError, MutauResult};

fn expand_path(file_path: &str) -> MutauResult<PathBuf> {
    Ok(PathBuf::from(&*shellexpand::full(file_path)?))
}

/// A table mapping named working points of one tagger to integer ranks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingPoints {
    /// Name of the tagger (or discriminant) the table belongs to
    pub tagger: String,
    /// Working point name to rank, loosest first
    pub ranks: IndexMap<String, i64>,
}

impl WorkingPoints {
    /// Construct a table from `(name, rank)` pairs.
    pub fn new(tagger: &str, ranks: &[(&str, i64)]) -> Self {
        Self {
            tagger: tagger.to_string(),
            ranks: ranks
                .iter()
                .map(|(name, rank)| (name.to_string(), *rank))
                .collect(),
        }
    }

    /// Look up the rank of a working point by name.
    pub fn rank(&self, name: &str) -> MutauResult<i64> {
        self.ranks
            .get(name)
            .copied()
            .ok_or_else(|| MutauError::UnknownWorkingPoint {
                tagger: self.tagger.clone(),
                name: name.to_string(),
            })
    }
}

/// DeepTau discriminant configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepTauConfig {
    /// Tagger version used in the NanoAOD column names
    pub tagger: String,
    /// Required working point against jets
    pub vs_jet: String,
    /// Required working point against electrons
    pub vs_e: String,
    /// Required working point against muons
    pub vs_mu: String,
    /// Working point table shared by the vs-e and vs-jet discriminants
    pub vs_e_jet_wps: WorkingPoints,
    /// Working point table of the vs-mu discriminant
    pub vs_mu_wps: WorkingPoints,
}

impl Default for DeepTauConfig {
    fn default() -> Self {
        Self {
            tagger: "DeepTau2018v2p5".to_string(),
            vs_jet: "Medium".to_string(),
            vs_e: "VVLoose".to_string(),
            vs_mu: "Tight".to_string(),
            vs_e_jet_wps: WorkingPoints::new(
                "DeepTau vs e/jet",
                &[
                    ("VVVLoose", 1),
                    ("VVLoose", 2),
                    ("VLoose", 3),
                    ("Loose", 4),
                    ("Medium", 5),
                    ("Tight", 6),
                    ("VTight", 7),
                    ("VVTight", 8),
                ],
            ),
            vs_mu_wps: WorkingPoints::new(
                "DeepTau vs mu",
                &[("VLoose", 1), ("Loose", 2), ("Medium", 3), ("Tight", 4)],
            ),
        }
    }
}

impl DeepTauConfig {
    /// Minimum vs-jet rank.
    pub fn vs_jet_rank(&self) -> MutauResult<i64> {
        self.vs_e_jet_wps.rank(&self.vs_jet)
    }
    /// Minimum vs-e rank.
    pub fn vs_e_rank(&self) -> MutauResult<i64> {
        self.vs_e_jet_wps.rank(&self.vs_e)
    }
    /// Minimum vs-mu rank.
    pub fn vs_mu_rank(&self) -> MutauResult<i64> {
        self.vs_mu_wps.rank(&self.vs_mu)
    }
    /// Working-point id column, e.g. `idDeepTau2018v2p5VSjet` for `against = "jet"`.
    pub fn id_column(&self, against: &str) -> String {
        format!("id{}VS{}", self.tagger, against)
    }
    /// Raw score column, e.g. `rawDeepTau2018v2p5VSjet`.
    pub fn raw_column(&self, against: &str) -> String {
        format!("raw{}VS{}", self.tagger, against)
    }
}

/// Cuts of the muon preselection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuonCuts {
    pub min_pt: f64,
    pub max_abs_eta: f64,
    pub max_abs_dxy: f64,
    pub max_abs_dz: f64,
}

impl Default for MuonCuts {
    fn default() -> Self {
        Self {
            min_pt: 26.0,
            max_abs_eta: 2.4,
            max_abs_dxy: 0.045,
            max_abs_dz: 0.2,
        }
    }
}

/// Cuts of the tau preselection (on top of the DeepTau working points).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TauCuts {
    pub min_pt: f64,
    pub max_abs_eta: f64,
    pub max_abs_dz: f64,
    /// Decay modes which are rejected (the two-prong modes)
    pub excluded_decay_modes: Vec<i64>,
}

impl Default for TauCuts {
    fn default() -> Self {
        Self {
            min_pt: 20.0,
            max_abs_eta: 2.3,
            max_abs_dz: 0.2,
            excluded_decay_modes: vec![5, 6],
        }
    }
}

/// Cuts of the b-jet veto. The b-tag threshold depends on the data-taking year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JetVetoCuts {
    pub min_pt: f64,
    pub max_abs_eta: f64,
    /// Medium DeepJet working point per year
    pub btag_wp: IndexMap<i32, f64>,
    /// Threshold used for years without an entry; 1.0 never vetoes
    pub default_btag_wp: f64,
}

impl Default for JetVetoCuts {
    fn default() -> Self {
        Self {
            min_pt: 20.0,
            max_abs_eta: 2.4,
            btag_wp: [(2018, 0.2783), (2022, 0.3196)].into_iter().collect(),
            default_btag_wp: 1.0,
        }
    }
}

impl JetVetoCuts {
    /// The b-tag threshold for a year.
    pub fn btag_threshold(&self, year: i32) -> f64 {
        self.btag_wp
            .get(&year)
            .copied()
            .unwrap_or(self.default_btag_wp)
    }
}

/// Pair-level cuts and the multi-pair switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairCuts {
    /// Minimum $`\Delta R`$ between the muon and the tau
    pub min_delta_r: f64,
    /// Maximum muon transverse mass
    pub max_muon_mt: f64,
    /// Resolve events with several surviving pairs by the ranking instead of rejecting them
    pub resolve_multiple_pairs: bool,
}

impl Default for PairCuts {
    fn default() -> Self {
        Self {
            min_delta_r: 0.5,
            max_muon_mt: 50.0,
            resolve_multiple_pairs: false,
        }
    }
}

/// Quality cuts of the additional muons considered by the extra-lepton veto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraLeptonCuts {
    pub min_pt: f64,
    pub max_abs_eta: f64,
    pub max_iso: f64,
    /// Minimum separation from both members of the resolved pair
    pub min_delta_r: f64,
}

impl Default for ExtraLeptonCuts {
    fn default() -> Self {
        Self {
            min_pt: 10.0,
            max_abs_eta: 2.5,
            max_iso: 0.3,
            min_delta_r: 0.5,
        }
    }
}

/// Cuts of the opposite-sign dimuon veto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DileptonCuts {
    pub min_pt: f64,
    pub max_abs_eta: f64,
    pub max_abs_dz: f64,
    pub max_abs_dxy: f64,
    pub max_iso: f64,
    pub min_delta_r: f64,
}

impl Default for DileptonCuts {
    fn default() -> Self {
        Self {
            min_pt: 15.0,
            max_abs_eta: 2.4,
            max_abs_dz: 0.2,
            max_abs_dxy: 0.045,
            max_iso: 0.3,
            min_delta_r: 0.15,
        }
    }
}

/// Matching of the resolved muon to muon trigger objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMatchingConfig {
    pub enabled: bool,
    pub max_delta_r: f64,
}

impl Default for TriggerMatchingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_delta_r: 0.5,
        }
    }
}

/// One leg of a trigger. Unset requirements are not applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerLeg {
    /// Required `|TrigObj.id|`
    #[serde(default)]
    pub pdg_id: Option<i64>,
    /// Required minimum `TrigObj.pt`
    #[serde(default)]
    pub min_pt: Option<f64>,
    /// Required filter-bit groups: every group must share at least one bit with
    /// `TrigObj.filterBits`
    #[serde(default)]
    pub trigger_bits: Vec<i64>,
}

impl TriggerLeg {
    /// Shortcut for a leg with every requirement set.
    pub fn new(pdg_id: i64, min_pt: f64, trigger_bits: &[i64]) -> Self {
        Self {
            pdg_id: Some(pdg_id),
            min_pt: Some(min_pt),
            trigger_bits: trigger_bits.to_vec(),
        }
    }
}

/// Restrictions on the datasets a trigger is evaluated for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerApplicability {
    /// `Some(true)` for simulation only, `Some(false)` for data only
    #[serde(default)]
    pub is_mc: Option<bool>,
    /// Eras the trigger is present in
    #[serde(default)]
    pub eras: Option<Vec<String>>,
}

/// An HLT path with its legs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Full path name, e.g. `HLT_IsoMu24`
    pub name: String,
    /// Identifier stored in `trigger_ids`
    pub id: i64,
    pub legs: Vec<TriggerLeg>,
    #[serde(default)]
    pub applicability: TriggerApplicability,
}

impl Trigger {
    /// Construct a trigger which applies to every dataset.
    pub fn new(name: &str, id: i64, legs: Vec<TriggerLeg>) -> Self {
        Self {
            name: name.to_string(),
            id,
            legs,
            applicability: TriggerApplicability::default(),
        }
    }

    /// Name of the decision bit inside the `HLT` group.
    pub fn hlt_field(&self) -> &str {
        self.name.strip_prefix("HLT_").unwrap_or(&self.name)
    }

    /// The event column holding the raw decision, e.g. `HLT.IsoMu24`.
    pub fn hlt_column(&self) -> String {
        format!("HLT.{}", self.hlt_field())
    }

    /// Whether the trigger is evaluated for `dataset`.
    pub fn applies_to(&self, dataset: &DatasetInfo) -> bool {
        let mc_ok = self
            .applicability
            .is_mc
            .map_or(true, |is_mc| is_mc == dataset.is_mc);
        let era_ok = match (&self.applicability.eras, &dataset.era) {
            (Some(eras), Some(era)) => eras.contains(era),
            (Some(_), None) => false,
            (None, _) => true,
        };
        mc_ok && era_ok
    }
}

/// The charge relation of the resolved pair required by a category.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeSign {
    /// `rel_charge > 0`
    SameSign,
    /// `rel_charge < 0`
    OppositeSign,
}

/// A window on the isolation of the resolved muon.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IsolationWindow {
    /// Inclusive lower bound
    #[serde(default)]
    pub min: Option<f64>,
    /// Upper bound
    pub max: f64,
    /// Whether `max` itself is accepted
    #[serde(default)]
    pub max_inclusive: bool,
}

impl IsolationWindow {
    /// Whether `iso` lies inside the window.
    pub fn contains(&self, iso: f64) -> bool {
        let above = self.min.map_or(true, |min| iso >= min);
        let below = if self.max_inclusive {
            iso <= self.max
        } else {
            iso < self.max
        };
        above && below
    }
}

/// Predicate of a category.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CategorySelection {
    /// Always true
    Inclusive,
    /// Charge relation and isolation window of the resolved pair
    Region {
        sign: ChargeSign,
        isolation: IsolationWindow,
    },
}

impl CategorySelection {
    /// Evaluate the predicate for one event. `iso` is the isolation of the resolved muon, or
    /// [`None`] when no pair was resolved.
    pub fn accepts(&self, rel_charge: i64, iso: Option<f64>) -> bool {
        match self {
            CategorySelection::Inclusive => true,
            CategorySelection::Region { sign, isolation } => {
                let sign_ok = match sign {
                    ChargeSign::SameSign => rel_charge > 0,
                    ChargeSign::OppositeSign => rel_charge < 0,
                };
                sign_ok && iso.is_some_and(|iso| isolation.contains(iso))
            }
        }
    }
}

/// A named analysis category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    pub id: i64,
    pub selection: CategorySelection,
    #[serde(default)]
    pub label: String,
}

impl CategoryConfig {
    fn new(name: &str, id: i64, selection: CategorySelection, label: &str) -> Self {
        Self {
            name: name.to_string(),
            id,
            selection,
            label: label.to_string(),
        }
    }

    /// The inclusive category and the four ABCD regions.
    pub fn abcd(iso_cut: f64, iso_max: f64) -> Vec<Self> {
        let tight = IsolationWindow {
            min: None,
            max: iso_cut,
            max_inclusive: false,
        };
        let sideband = IsolationWindow {
            min: Some(iso_cut),
            max: iso_max,
            max_inclusive: true,
        };
        vec![
            Self::new("incl", 1, CategorySelection::Inclusive, "inclusive"),
            Self::new(
                "cat_a",
                104,
                CategorySelection::Region {
                    sign: ChargeSign::SameSign,
                    isolation: sideband,
                },
                "QCD transfer factor cat. A",
            ),
            Self::new(
                "cat_b",
                105,
                CategorySelection::Region {
                    sign: ChargeSign::OppositeSign,
                    isolation: sideband,
                },
                "QCD transfer factor cat. B",
            ),
            Self::new(
                "cat_c",
                106,
                CategorySelection::Region {
                    sign: ChargeSign::SameSign,
                    isolation: tight,
                },
                "QCD control region",
            ),
            Self::new(
                "cat_d",
                107,
                CategorySelection::Region {
                    sign: ChargeSign::OppositeSign,
                    isolation: tight,
                },
                "signal region",
            ),
        ]
    }
}

/// Per-dataset metadata supplied by the dataset catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub name: String,
    pub is_mc: bool,
    /// Identifier written to `process_id`
    pub process_id: i64,
    #[serde(default)]
    pub era: Option<String>,
}

impl DatasetInfo {
    /// Metadata of a simulated dataset.
    pub fn mc(name: &str, process_id: i64) -> Self {
        Self {
            name: name.to_string(),
            is_mc: true,
            process_id,
            era: None,
        }
    }

    /// Metadata of a collision-data dataset.
    pub fn data(name: &str, process_id: i64, era: &str) -> Self {
        Self {
            name: name.to_string(),
            is_mc: false,
            process_id,
            era: Some(era.to_string()),
        }
    }

    /// Whether this is collision data.
    pub fn is_data(&self) -> bool {
        !self.is_mc
    }
}

/// Certified luminosity sections (the "golden JSON"): run number to inclusive ranges of
/// luminosity blocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoldenJson {
    runs: IndexMap<String, Vec<[i64; 2]>>,
}

impl GoldenJson {
    /// Parse the CMS certification format, `{"355100": [[1, 43], [45, 100]], ...}`.
    pub fn from_json_str(json: &str) -> MutauResult<Self> {
        let golden: GoldenJson = serde_json::from_str(json)?;
        for run in golden.runs.keys() {
            run.parse::<i64>().map_err(|_| MutauError::ParseError {
                name: run.clone(),
                object: "run number".to_string(),
            })?;
        }
        Ok(golden)
    }

    /// Read a certification file; `~` and environment variables are expanded.
    pub fn from_json_file(file_path: &str) -> MutauResult<Self> {
        Self::from_json_str(&fs::read_to_string(expand_path(file_path)?)?)
    }

    /// Whether the luminosity block of a run is certified.
    pub fn contains(&self, run: i64, lumi: i64) -> bool {
        self.runs
            .get(&run.to_string())
            .is_some_and(|ranges| ranges.iter().any(|[lo, hi]| (*lo..=*hi).contains(&lumi)))
    }

    /// Number of certified runs.
    pub fn n_runs(&self) -> usize {
        self.runs.len()
    }
}

/// The complete, immutable configuration of the selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Configuration name, e.g. `run3_2022_preEE`
    pub name: String,
    /// Data-taking year, selects the b-tag working point
    pub year: i32,
    pub deep_tau: DeepTauConfig,
    pub muon: MuonCuts,
    pub tau: TauCuts,
    pub jet_veto: JetVetoCuts,
    pub pair: PairCuts,
    pub extra_lepton: ExtraLeptonCuts,
    pub dilepton: DileptonCuts,
    pub trigger_matching: TriggerMatchingConfig,
    pub triggers: Vec<Trigger>,
    pub categories: Vec<CategoryConfig>,
    /// Path of the golden JSON applied to collision data
    pub golden_json: Option<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            name: "run3_2022_preEE".to_string(),
            year: 2022,
            deep_tau: DeepTauConfig::default(),
            muon: MuonCuts::default(),
            tau: TauCuts::default(),
            jet_veto: JetVetoCuts::default(),
            pair: PairCuts::default(),
            extra_lepton: ExtraLeptonCuts::default(),
            dilepton: DileptonCuts::default(),
            trigger_matching: TriggerMatchingConfig::default(),
            triggers: vec![
                Trigger::new("HLT_IsoMu24", 131, vec![TriggerLeg::new(13, 25.0, &[2])]),
                Trigger::new("HLT_IsoMu27", 132, vec![TriggerLeg::new(13, 25.0, &[2])]),
                Trigger::new(
                    "HLT_IsoMu20_eta2p1_LooseDeepTauPFTauHPS27_eta2p1_CrossL1",
                    301,
                    vec![
                        TriggerLeg::new(13, 21.0, &[2 + 64]),
                        TriggerLeg::new(15, 32.0, &[1024 + 512]),
                    ],
                ),
            ],
            categories: CategoryConfig::abcd(0.15, 0.30),
            golden_json: None,
        }
    }
}

impl AnalysisConfig {
    /// Parse and validate a JSON configuration; omitted sections take their defaults.
    pub fn from_json_str(json: &str) -> MutauResult<Self> {
        let config: AnalysisConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_json_file(file_path: &str) -> MutauResult<Self> {
        Self::from_json_str(&fs::read_to_string(expand_path(file_path)?)?)
    }

    /// Load the golden JSON referenced by this configuration, if any.
    pub fn load_golden_json(&self) -> MutauResult<Option<GoldenJson>> {
        self.golden_json
            .as_deref()
            .map(GoldenJson::from_json_file)
            .transpose()
    }

    /// The b-tag threshold of the configured year.
    pub fn btag_threshold(&self) -> f64 {
        self.jet_veto.btag_threshold(self.year)
    }

    /// Check working point names, trigger particle codes and name uniqueness.
    pub fn validate(&self) -> MutauResult<()> {
        self.deep_tau.vs_jet_rank()?;
        self.deep_tau.vs_e_rank()?;
        self.deep_tau.vs_mu_rank()?;

        let mut names = IndexSet::new();
        let mut ids = IndexSet::new();
        for trigger in &self.triggers {
            if !names.insert(trigger.name.as_str()) {
                return Err(MutauError::DuplicateName {
                    category: "trigger",
                    name: trigger.name.clone(),
                });
            }
            if !ids.insert(trigger.id) {
                return Err(MutauError::DuplicateName {
                    category: "trigger id",
                    name: trigger.id.to_string(),
                });
            }
            for leg in &trigger.legs {
                if let Some(pdg_id) = leg.pdg_id {
                    if ParticleKind::from_pdg_id(pdg_id).is_none() {
                        return Err(MutauError::UnknownParticleCode {
                            trigger: trigger.name.clone(),
                            pdg_id,
                        });
                    }
                }
            }
        }

        let mut names = IndexSet::new();
        let mut ids = IndexSet::new();
        for category in &self.categories {
            if !names.insert(category.name.as_str()) {
                return Err(MutauError::DuplicateName {
                    category: "category",
                    name: category.name.clone(),
                });
            }
            if !ids.insert(category.id) {
                return Err(MutauError::DuplicateName {
                    category: "category id",
                    name: category.id.to_string(),
                });
            }
        }
        Ok(())
    }
}
