use mutau_core::{utils::vectors::delta_r, Column, ColumnRef, EventBatch, MutauResult};
use tracing::debug;

use crate::{
    result::SelectionResult,
    stage::{pair_lists, Stage, StageContext, PAIR_MUON_IDX, PAIR_TAU_IDX},
};

/// A muon-tau combination surviving the pair cuts, with its ranking inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairCandidate {
    /// Local muon index
    pub muon: usize,
    /// Local tau index
    pub tau: usize,
    pub muon_iso: f64,
    pub muon_pt: f64,
    pub tau_raw_vs_jet: f64,
    pub tau_pt: f64,
}

impl PairCandidate {
    // lower is better for every key
    fn rank_key(&self, key: usize) -> f64 {
        match key {
            0 => self.muon_iso,
            1 => -self.muon_pt,
            2 => -self.tau_raw_vs_jet,
            _ => -self.tau_pt,
        }
    }
}

const N_RANK_KEYS: usize = 4;

/// Outcome of the tie-break for one event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPair {
    pub muon: usize,
    pub tau: usize,
    /// Every ranking key was tied and the lowest indices were taken
    pub ambiguous: bool,
}

/// Pick one candidate by the ordered ranking: lowest muon isolation, then highest muon pt,
/// then highest tau vs-jet score, then highest tau pt.
///
/// Each key keeps only the candidates tied for the best value; candidates with an undefined
/// (NaN) key never win that key unless every candidate is undefined. If several candidates
/// remain after the last key, the one with the lowest muon index (then tau index) is taken and
/// the result is flagged as ambiguous. The outcome does not depend on the input order.
pub fn rank_candidates(candidates: &[PairCandidate]) -> Option<ResolvedPair> {
    let mut remaining: Vec<&PairCandidate> = candidates.iter().collect();
    for key in 0..N_RANK_KEYS {
        if remaining.len() <= 1 {
            break;
        }
        let best = remaining
            .iter()
            .map(|c| c.rank_key(key))
            .filter(|v| !v.is_nan())
            .fold(f64::INFINITY, f64::min);
        if best.is_finite() || remaining.iter().any(|c| c.rank_key(key) == best) {
            remaining.retain(|c| c.rank_key(key) == best);
        }
    }
    let ambiguous = remaining.len() > 1;
    remaining
        .into_iter()
        .min_by_key(|c| (c.muon, c.tau))
        .map(|c| ResolvedPair {
            muon: c.muon,
            tau: c.tau,
            ambiguous,
        })
}

/// Resolution of the muon-tau pair.
///
/// Candidates are all combinations of preselected muons and taus separated by more than
/// `min_delta_r` whose muon has a transverse mass below `max_muon_mt`. A single candidate is
/// taken as is. With several candidates the event keeps no pair unless
/// `resolve_multiple_pairs` is enabled, in which case [`rank_candidates`] decides.
#[derive(Clone, Default)]
pub struct MuTauPairSelection {
    min_delta_r: f64,
    max_muon_mt: f64,
    resolve_multiple: bool,
    raw_vs_jet: String,
}

impl MuTauPairSelection {
    pub fn new() -> Box<Self> {
        Self::default().into()
    }

    fn step_name(&self) -> &str {
        if self.resolve_multiple {
            "mutau_pair"
        } else {
            "single_pair"
        }
    }

    fn candidates(&self, batch: &EventBatch) -> MutauResult<Vec<Vec<PairCandidate>>> {
        let muons = batch.collection("Muon")?;
        let taus = batch.collection("Tau")?;
        let muon_mask = muons.bools("preselected")?;
        let tau_mask = taus.bools("preselected")?;
        let muon_mt = muons.floats("mT")?;
        let muon_iso = muons.floats("pfRelIso04_all")?;
        let tau_raw = taus.floats(&self.raw_vs_jet)?;
        let muon_p4 = muons.kinematics()?;
        let tau_p4 = taus.kinematics()?;
        Ok((0..batch.n_events())
            .map(|event| {
                let mut candidates = Vec::new();
                for (m, i) in muons.range(event).enumerate() {
                    if !muon_mask[i] || muon_mt[i] >= self.max_muon_mt {
                        continue;
                    }
                    let (mu_eta, mu_phi) = muon_p4.eta_phi(event, m);
                    for (t, j) in taus.range(event).enumerate() {
                        if !tau_mask[j] {
                            continue;
                        }
                        let (tau_eta, tau_phi) = tau_p4.eta_phi(event, t);
                        if delta_r(mu_eta, mu_phi, tau_eta, tau_phi) <= self.min_delta_r {
                            continue;
                        }
                        candidates.push(PairCandidate {
                            muon: m,
                            tau: t,
                            muon_iso: muon_iso[i],
                            muon_pt: muon_p4.pt(event, m),
                            tau_raw_vs_jet: tau_raw[j],
                            tau_pt: tau_p4.pt(event, t),
                        });
                    }
                }
                candidates
            })
            .collect())
    }
}

impl Stage for MuTauPairSelection {
    fn name(&self) -> &str {
        "mutau_pair_selection"
    }

    fn bind(&mut self, ctx: &StageContext) -> MutauResult<()> {
        let cuts = &ctx.config.pair;
        self.min_delta_r = cuts.min_delta_r;
        self.max_muon_mt = cuts.max_muon_mt;
        self.resolve_multiple = cuts.resolve_multiple_pairs;
        self.raw_vs_jet = ctx.config.deep_tau.raw_column("jet");
        Ok(())
    }

    fn uses(&self) -> Vec<ColumnRef> {
        let mut columns = ColumnRef::objects(
            "Muon",
            &["preselected", "mT", "pfRelIso04_all", "pt", "eta", "phi", "mass"],
        );
        columns.extend(ColumnRef::objects(
            "Tau",
            &["preselected", self.raw_vs_jet.as_str(), "pt", "eta", "phi", "mass"],
        ));
        columns
    }

    fn produces(&self) -> Vec<ColumnRef> {
        vec![
            ColumnRef::event(PAIR_MUON_IDX),
            ColumnRef::event(PAIR_TAU_IDX),
            ColumnRef::event("single_pair"),
            ColumnRef::event("ambiguous_pair"),
        ]
    }

    fn steps(&self) -> Vec<String> {
        vec![self.step_name().to_string()]
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        let candidates = self.candidates(batch)?;
        let single: Vec<bool> = candidates.iter().map(|c| c.len() == 1).collect();
        let resolved: Vec<Option<ResolvedPair>> = candidates
            .iter()
            .map(|c| match c.len() {
                1 => rank_candidates(c),
                n if n > 1 && self.resolve_multiple => rank_candidates(c),
                _ => None,
            })
            .collect();
        let ambiguous: Vec<bool> = resolved
            .iter()
            .map(|pair| pair.is_some_and(|p| p.ambiguous))
            .collect();
        let pairs: Vec<Option<(usize, usize)>> = resolved
            .iter()
            .map(|pair| pair.map(|p| (p.muon, p.tau)))
            .collect();
        let step: Vec<bool> = if self.resolve_multiple {
            pairs.iter().map(Option::is_some).collect()
        } else {
            single.clone()
        };
        debug!(
            stage = self.name(),
            single = single.iter().filter(|&&s| s).count(),
            multiple = candidates.iter().filter(|c| c.len() > 1).count(),
            resolved = pairs.iter().filter(|p| p.is_some()).count(),
            ambiguous = ambiguous.iter().filter(|&&a| a).count(),
            "pair resolution"
        );

        let (muon_idx, tau_idx) = pair_lists(&pairs);
        batch.set_list(PAIR_MUON_IDX, muon_idx.clone())?;
        batch.set_list(PAIR_TAU_IDX, tau_idx.clone())?;
        batch.set_field("single_pair", Column::Bool(single))?;
        batch.set_field("ambiguous_pair", Column::Bool(ambiguous))?;
        Ok(SelectionResult::new()
            .with_step(self.step_name(), step)
            .with_objects("Muon", "Muon", muon_idx)
            .with_objects("Tau", "Tau", tau_idx))
    }
}

#[cfg(test)]
mod tests {
    use mutau_core::{AnalysisConfig, DatasetInfo, Jagged};

    use super::*;
    use crate::{
        objects::{MuonSelection, TauSelection},
        production::TransverseMass,
        testing::*,
    };

    fn candidate(muon: usize, tau: usize, keys: [f64; 4]) -> PairCandidate {
        PairCandidate {
            muon,
            tau,
            muon_iso: keys[0],
            muon_pt: keys[1],
            tau_raw_vs_jet: keys[2],
            tau_pt: keys[3],
        }
    }

    fn run_pairs(config: &AnalysisConfig, batch: &mut EventBatch) -> SelectionResult {
        let dataset = DatasetInfo::mc("dy_incl", 51);
        let ctx = StageContext::new(config, &dataset, None);
        let mut stages: Vec<Box<dyn Stage>> = vec![
            TransverseMass::new(),
            MuonSelection::new(),
            TauSelection::new(),
            MuTauPairSelection::new(),
        ];
        let mut result = SelectionResult::new();
        for stage in stages.iter_mut() {
            stage.bind(&ctx).unwrap();
            result += stage.run(batch, &ctx).unwrap();
        }
        result
    }

    #[test]
    fn test_ranking_keys_in_order() {
        // isolation decides first
        let candidates = [
            candidate(0, 0, [0.10, 50.0, 0.9, 40.0]),
            candidate(1, 0, [0.05, 30.0, 0.5, 20.0]),
        ];
        assert_eq!(
            rank_candidates(&candidates),
            Some(ResolvedPair {
                muon: 1,
                tau: 0,
                ambiguous: false
            })
        );
        // same muon, tau decided by the vs-jet score before the tau pt
        let candidates = [
            candidate(0, 0, [0.05, 30.0, 0.5, 80.0]),
            candidate(0, 1, [0.05, 30.0, 0.7, 25.0]),
            candidate(0, 2, [0.05, 30.0, 0.7, 35.0]),
        ];
        assert_eq!(rank_candidates(&candidates).map(|p| p.tau), Some(2));
        assert_eq!(rank_candidates(&[]), None);
    }

    #[test]
    fn test_full_tie_falls_back_to_lowest_indices() {
        let candidates = [
            candidate(1, 0, [0.05, 30.0, 0.5, 25.0]),
            candidate(0, 1, [0.05, 30.0, 0.5, 25.0]),
            candidate(0, 2, [0.05, 30.0, 0.5, 25.0]),
        ];
        assert_eq!(
            rank_candidates(&candidates),
            Some(ResolvedPair {
                muon: 0,
                tau: 1,
                ambiguous: true
            })
        );
    }

    #[test]
    fn test_nan_keys_never_win() {
        let candidates = [
            candidate(0, 0, [f64::NAN, 90.0, 0.9, 90.0]),
            candidate(1, 0, [0.2, 30.0, 0.5, 25.0]),
        ];
        assert_eq!(rank_candidates(&candidates).map(|p| p.muon), Some(1));
        let candidates = [
            candidate(0, 0, [f64::NAN, 30.0, 0.9, 90.0]),
            candidate(1, 0, [f64::NAN, 90.0, 0.5, 25.0]),
        ];
        assert_eq!(rank_candidates(&candidates).map(|p| p.muon), Some(1));
    }

    #[test]
    fn test_ranking_is_order_independent() {
        fastrand::seed(7);
        for _ in 0..50 {
            let mut candidates: Vec<PairCandidate> = (0..6)
                .map(|k| {
                    candidate(
                        k / 3,
                        k % 3,
                        [
                            fastrand::usize(0..2) as f64 * 0.05,
                            20.0 + fastrand::usize(0..2) as f64,
                            0.5 + fastrand::usize(0..2) as f64 * 0.1,
                            20.0 + fastrand::usize(0..3) as f64,
                        ],
                    )
                })
                .collect();
            let expected = rank_candidates(&candidates);
            for _ in 0..10 {
                fastrand::shuffle(&mut candidates);
                assert_eq!(rank_candidates(&candidates), expected);
            }
        }
    }

    fn two_pair_event() -> EventSpec {
        EventSpec {
            muons: vec![
                MuonSpec {
                    iso: 0.10,
                    ..MuonSpec::good(30.0, 0.0, 0.0, 1)
                },
                MuonSpec {
                    iso: 0.02,
                    ..MuonSpec::good(28.0, 0.0, 0.3, 1)
                },
            ],
            taus: vec![TauSpec::good(40.0, 1.5, 2.5, -1)],
            met_pt: 5.0,
            ..EventSpec::default()
        }
    }

    #[test]
    fn test_single_pair_passes_through() {
        let mut batch = batch(&[
            EventSpec {
                muons: vec![MuonSpec::good(30.0, 0.0, 0.0, 1)],
                taus: vec![TauSpec::good(40.0, 1.5, 2.5, -1)],
                ..EventSpec::default()
            },
            // the only combination is too close
            EventSpec {
                muons: vec![MuonSpec::good(30.0, 0.0, 0.0, 1)],
                taus: vec![TauSpec::good(40.0, 0.1, 0.1, -1)],
                ..EventSpec::default()
            },
            two_pair_event(),
            EventSpec::default(),
        ]);
        let result = run_pairs(&AnalysisConfig::default(), &mut batch);
        assert_eq!(result.steps["single_pair"], vec![true, false, false, false]);
        assert!(!result.steps.contains_key("mutau_pair"));
        let muons = batch.list(PAIR_MUON_IDX).unwrap();
        assert_eq!(muons.event(0), &[0]);
        assert_eq!(muons.counts(), vec![1, 0, 0, 0]);
        assert_eq!(batch.list(PAIR_TAU_IDX).unwrap().event(0), &[0]);
        assert_eq!(
            batch.bools("single_pair").unwrap(),
            &[true, false, false, false]
        );
        assert_eq!(batch.bools("ambiguous_pair").unwrap(), &[false; 4]);
    }

    #[test]
    fn test_multiple_pairs_resolved_when_enabled() {
        let mut config = AnalysisConfig::default();
        config.pair.resolve_multiple_pairs = true;
        let mut batch = batch(&[two_pair_event(), EventSpec::default()]);
        let result = run_pairs(&config, &mut batch);
        assert_eq!(result.steps["mutau_pair"], vec![true, false]);
        assert_eq!(batch.list(PAIR_MUON_IDX).unwrap().event(0), &[1]);
        assert_eq!(batch.bools("single_pair").unwrap(), &[false, false]);
        assert_eq!(
            result.objects["Tau"]["Tau"],
            Jagged::from_lists(vec![vec![0], vec![]])
        );
    }

    #[test]
    fn test_high_mt_muon_is_not_a_candidate() {
        let mut batch = batch(&[EventSpec {
            muons: vec![MuonSpec::good(60.0, 0.0, 0.0, 1)],
            taus: vec![TauSpec::good(40.0, 1.5, 2.5, -1)],
            met_pt: 40.0,
            met_phi: std::f64::consts::PI,
            ..EventSpec::default()
        }]);
        let result = run_pairs(&AnalysisConfig::default(), &mut batch);
        assert_eq!(result.steps["single_pair"], vec![false]);
    }
}
