use mutau_core::{utils::vectors::delta_r, ColumnRef, EventBatch, MutauResult};
use tracing::debug;

use crate::{
    result::SelectionResult,
    stage::{clear_pairs, resolved_pairs, Stage, StageContext, PAIR_MUON_IDX, PAIR_TAU_IDX},
};

/// Veto of events with an additional isolated muon away from the resolved pair.
///
/// An extra muon fails `extra_lep_veto` and clears the resolved pair of its event. Events
/// without a resolved pair have nothing to be separated from and always pass.
#[derive(Clone, Default)]
pub struct ExtraLeptonVeto {
    min_pt: f64,
    max_abs_eta: f64,
    max_iso: f64,
    min_delta_r: f64,
}

impl ExtraLeptonVeto {
    pub fn new() -> Box<Self> {
        Self::default().into()
    }
}

impl Stage for ExtraLeptonVeto {
    fn name(&self) -> &str {
        "extra_lepton_veto"
    }

    fn bind(&mut self, ctx: &StageContext) -> MutauResult<()> {
        let cuts = &ctx.config.extra_lepton;
        self.min_pt = cuts.min_pt;
        self.max_abs_eta = cuts.max_abs_eta;
        self.max_iso = cuts.max_iso;
        self.min_delta_r = cuts.min_delta_r;
        Ok(())
    }

    fn uses(&self) -> Vec<ColumnRef> {
        let mut columns =
            ColumnRef::objects("Muon", &["pt", "eta", "phi", "mediumId", "pfRelIso04_all"]);
        columns.extend(ColumnRef::objects("Tau", &["eta", "phi"]));
        columns
    }

    fn updates(&self) -> Vec<ColumnRef> {
        vec![
            ColumnRef::event(PAIR_MUON_IDX),
            ColumnRef::event(PAIR_TAU_IDX),
        ]
    }

    fn steps(&self) -> Vec<String> {
        vec!["extra_lep_veto".to_string()]
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        let pairs = resolved_pairs(batch)?;
        let muons = batch.collection("Muon")?;
        let taus = batch.collection("Tau")?;
        let (pt, eta, phi) = (
            muons.floats("pt")?,
            muons.floats("eta")?,
            muons.floats("phi")?,
        );
        let medium = muons.bools("mediumId")?;
        let iso = muons.floats("pfRelIso04_all")?;
        let (tau_eta, tau_phi) = (taus.floats("eta")?, taus.floats("phi")?);
        let veto: Vec<bool> = pairs
            .iter()
            .enumerate()
            .map(|(event, pair)| {
                let Some((pair_muon, pair_tau)) = *pair else {
                    return true;
                };
                let m = muons.range(event).start + pair_muon;
                let t = taus.range(event).start + pair_tau;
                !muons.range(event).enumerate().any(|(k, i)| {
                    k != pair_muon
                        && pt[i] > self.min_pt
                        && eta[i].abs() < self.max_abs_eta
                        && medium[i]
                        && iso[i] < self.max_iso
                        && delta_r(eta[i], phi[i], eta[m], phi[m]) > self.min_delta_r
                        && delta_r(eta[i], phi[i], tau_eta[t], tau_phi[t]) > self.min_delta_r
                })
            })
            .collect();
        debug!(
            stage = self.name(),
            passed = veto.iter().filter(|&&v| v).count(),
            events = veto.len(),
            "extra lepton veto"
        );
        Ok(clear_pairs(batch, &veto)?.with_step("extra_lep_veto", veto))
    }
}

/// Veto of events with an opposite-sign pair of good muons. The resolved pair is not touched.
#[derive(Clone, Default)]
pub struct DileptonVeto {
    min_pt: f64,
    max_abs_eta: f64,
    max_abs_dz: f64,
    max_abs_dxy: f64,
    max_iso: f64,
    min_delta_r: f64,
}

impl DileptonVeto {
    pub fn new() -> Box<Self> {
        Self::default().into()
    }
}

impl Stage for DileptonVeto {
    fn name(&self) -> &str {
        "dilepton_veto"
    }

    fn bind(&mut self, ctx: &StageContext) -> MutauResult<()> {
        let cuts = &ctx.config.dilepton;
        self.min_pt = cuts.min_pt;
        self.max_abs_eta = cuts.max_abs_eta;
        self.max_abs_dz = cuts.max_abs_dz;
        self.max_abs_dxy = cuts.max_abs_dxy;
        self.max_iso = cuts.max_iso;
        self.min_delta_r = cuts.min_delta_r;
        Ok(())
    }

    fn uses(&self) -> Vec<ColumnRef> {
        ColumnRef::objects(
            "Muon",
            &[
                "pt",
                "eta",
                "phi",
                "charge",
                "isGlobal",
                "isPFcand",
                "dz",
                "dxy",
                "pfRelIso04_all",
            ],
        )
    }

    fn steps(&self) -> Vec<String> {
        vec!["dilep_veto".to_string()]
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        let muons = batch.collection("Muon")?;
        let (pt, eta, phi) = (
            muons.floats("pt")?,
            muons.floats("eta")?,
            muons.floats("phi")?,
        );
        let charge = muons.ints("charge")?;
        let (is_global, is_pf) = (muons.bools("isGlobal")?, muons.bools("isPFcand")?);
        let (dz, dxy) = (muons.floats("dz")?, muons.floats("dxy")?);
        let iso = muons.floats("pfRelIso04_all")?;
        let good = |i: usize| {
            pt[i] > self.min_pt
                && eta[i].abs() < self.max_abs_eta
                && is_global[i]
                && is_pf[i]
                && dz[i].abs() < self.max_abs_dz
                && dxy[i].abs() < self.max_abs_dxy
                && iso[i] < self.max_iso
        };
        let veto: Vec<bool> = (0..batch.n_events())
            .map(|event| {
                let candidates: Vec<usize> = muons.range(event).filter(|&i| good(i)).collect();
                !candidates.iter().enumerate().any(|(k, &i)| {
                    candidates[k + 1..].iter().any(|&j| {
                        charge[i] * charge[j] < 0
                            && delta_r(eta[i], phi[i], eta[j], phi[j]) > self.min_delta_r
                    })
                })
            })
            .collect();
        debug!(
            stage = self.name(),
            passed = veto.iter().filter(|&&v| v).count(),
            events = veto.len(),
            "dilepton veto"
        );
        Ok(SelectionResult::new().with_step("dilep_veto", veto))
    }
}

#[cfg(test)]
mod tests {
    use mutau_core::{AnalysisConfig, DatasetInfo, Jagged};

    use super::*;
    use crate::testing::*;

    fn run_stage<S: Stage>(mut stage: S, batch: &mut EventBatch) -> SelectionResult {
        let config = AnalysisConfig::default();
        let dataset = DatasetInfo::mc("dy_incl", 51);
        let ctx = StageContext::new(&config, &dataset, None);
        stage.bind(&ctx).unwrap();
        stage.run(batch, &ctx).unwrap()
    }

    fn with_pairs(mut batch: EventBatch, pairs: Vec<Vec<i64>>) -> EventBatch {
        batch
            .set_list(PAIR_MUON_IDX, Jagged::from_lists(pairs.clone()))
            .unwrap();
        batch
            .set_list(
                PAIR_TAU_IDX,
                Jagged::from_lists(pairs.iter().map(|p| vec![0; p.len()]).collect()),
            )
            .unwrap();
        batch
    }

    #[test]
    fn test_extra_lepton_veto_clears_pair() {
        let pair_muon = MuonSpec::good(30.0, 0.0, 0.0, 1);
        let tau = TauSpec::good(40.0, 0.0, 3.0, -1);
        let mut batch = with_pairs(
            batch(&[
                // isolated extra muon far from both pair members
                EventSpec {
                    muons: vec![pair_muon, MuonSpec::good(15.0, -1.5, 1.5, -1)],
                    taus: vec![tau],
                    ..EventSpec::default()
                },
                // extra muon too close to the pair muon
                EventSpec {
                    muons: vec![pair_muon, MuonSpec::good(15.0, 0.1, 0.1, -1)],
                    taus: vec![tau],
                    ..EventSpec::default()
                },
                // extra muon not isolated
                EventSpec {
                    muons: vec![
                        MuonSpec {
                            iso: 0.5,
                            ..MuonSpec::good(15.0, -1.5, 1.5, -1)
                        },
                        pair_muon,
                    ],
                    taus: vec![tau],
                    ..EventSpec::default()
                },
                // no resolved pair
                EventSpec {
                    muons: vec![pair_muon, MuonSpec::good(15.0, -1.5, 1.5, -1)],
                    taus: vec![tau],
                    ..EventSpec::default()
                },
            ]),
            vec![vec![0], vec![0], vec![1], vec![]],
        );
        let result = run_stage(ExtraLeptonVeto::default(), &mut batch);
        assert_eq!(
            result.steps["extra_lep_veto"],
            vec![false, true, true, true]
        );
        assert_eq!(
            batch.list(PAIR_MUON_IDX).unwrap().counts(),
            vec![0, 1, 1, 0]
        );
        assert_eq!(batch.list(PAIR_TAU_IDX).unwrap().count(0), 0);
        assert_eq!(batch.list(PAIR_MUON_IDX).unwrap().event(2), &[1]);
        assert_eq!(result.objects["Tau"]["Tau"].counts(), vec![0, 1, 1, 0]);
    }

    #[test]
    fn test_dilepton_veto_keeps_pair() {
        let mut batch = with_pairs(
            batch(&[
                EventSpec {
                    muons: vec![
                        MuonSpec::good(30.0, 0.0, 0.0, 1),
                        MuonSpec::good(20.0, 1.0, 2.0, -1),
                    ],
                    ..EventSpec::default()
                },
                // same sign
                EventSpec {
                    muons: vec![
                        MuonSpec::good(30.0, 0.0, 0.0, 1),
                        MuonSpec::good(20.0, 1.0, 2.0, 1),
                    ],
                    ..EventSpec::default()
                },
                // second muon is not a global muon
                EventSpec {
                    muons: vec![
                        MuonSpec::good(30.0, 0.0, 0.0, 1),
                        MuonSpec {
                            is_global: false,
                            ..MuonSpec::good(20.0, 1.0, 2.0, -1)
                        },
                    ],
                    ..EventSpec::default()
                },
                // large negative impact parameter
                EventSpec {
                    muons: vec![
                        MuonSpec::good(30.0, 0.0, 0.0, 1),
                        MuonSpec {
                            dz: -0.5,
                            ..MuonSpec::good(20.0, 1.0, 2.0, -1)
                        },
                    ],
                    ..EventSpec::default()
                },
                EventSpec {
                    muons: vec![MuonSpec::good(30.0, 0.0, 0.0, 1)],
                    ..EventSpec::default()
                },
            ]),
            vec![vec![0], vec![0], vec![0], vec![0], vec![]],
        );
        let before = batch.list(PAIR_MUON_IDX).unwrap().clone();
        let result = run_stage(DileptonVeto::default(), &mut batch);
        assert_eq!(
            result.steps["dilep_veto"],
            vec![false, true, true, true, true]
        );
        assert_eq!(batch.list(PAIR_MUON_IDX).unwrap(), &before);
        assert!(result.objects.is_empty());
    }
}
