use mutau_core::{Column, ColumnRef, EventBatch, GoldenJson, MutauError, MutauResult};
use tracing::debug;

use crate::{
    result::SelectionResult,
    stage::{Stage, StageContext},
};

/// Collections whose four-momenta are used downstream.
const KINEMATIC_COLLECTIONS: [&str; 3] = ["Muon", "Tau", "Jet"];

/// Check that the kinematic collections carry consistent pt/eta/phi/mass attributes before any
/// selection runs.
#[derive(Clone, Default)]
pub struct AttachBehavior;

impl AttachBehavior {
    pub fn new() -> Box<Self> {
        Self.into()
    }
}

impl Stage for AttachBehavior {
    fn name(&self) -> &str {
        "attach_behavior"
    }

    fn uses(&self) -> Vec<ColumnRef> {
        KINEMATIC_COLLECTIONS
            .iter()
            .flat_map(|collection| ColumnRef::objects(collection, &["pt", "eta", "phi", "mass"]))
            .collect()
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        for name in KINEMATIC_COLLECTIONS {
            let collection = batch.collection(name)?;
            collection.kinematics()?;
            debug!(
                collection = name,
                objects = collection.n_objects(),
                "attached four-momenta"
            );
        }
        Ok(SelectionResult::new())
    }
}

/// The per-event Monte-Carlo weight (`mc_weight`), taken from the generator weight.
#[derive(Clone, Default)]
pub struct McWeight;

impl McWeight {
    pub fn new() -> Box<Self> {
        Self.into()
    }
}

impl Stage for McWeight {
    fn name(&self) -> &str {
        "mc_weight"
    }

    fn applies_to(&self, ctx: &StageContext) -> bool {
        ctx.dataset.is_mc
    }

    fn uses(&self) -> Vec<ColumnRef> {
        vec![ColumnRef::event("genWeight")]
    }

    fn produces(&self) -> Vec<ColumnRef> {
        vec![ColumnRef::event("mc_weight")]
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        let weights = batch.floats("genWeight")?.to_vec();
        batch.set_field("mc_weight", Column::Float(weights))?;
        Ok(SelectionResult::new())
    }
}

/// Certified-luminosity filter for collision data (step `json`).
#[derive(Clone, Default)]
pub struct GoldenJsonFilter {
    golden_json: GoldenJson,
}

impl GoldenJsonFilter {
    pub fn new() -> Box<Self> {
        Self::default().into()
    }
}

impl Stage for GoldenJsonFilter {
    fn name(&self) -> &str {
        "golden_json"
    }

    fn applies_to(&self, ctx: &StageContext) -> bool {
        ctx.dataset.is_data()
    }

    fn bind(&mut self, ctx: &StageContext) -> MutauResult<()> {
        self.golden_json = ctx
            .golden_json
            .cloned()
            .ok_or_else(|| MutauError::MissingGoldenJson {
                dataset: ctx.dataset.name.clone(),
            })?;
        Ok(())
    }

    fn uses(&self) -> Vec<ColumnRef> {
        vec![ColumnRef::event("run"), ColumnRef::event("luminosityBlock")]
    }

    fn steps(&self) -> Vec<String> {
        vec!["json".to_string()]
    }

    fn run(&self, batch: &mut EventBatch, _ctx: &StageContext) -> MutauResult<SelectionResult> {
        let runs = batch.ints("run")?;
        let lumis = batch.ints("luminosityBlock")?;
        let certified: Vec<bool> = runs
            .iter()
            .zip(lumis)
            .map(|(&run, &lumi)| self.golden_json.contains(run, lumi))
            .collect();
        debug!(
            stage = self.name(),
            certified = certified.iter().filter(|&&c| c).count(),
            events = certified.len(),
            "golden JSON"
        );
        Ok(SelectionResult::new().with_step("json", certified))
    }
}

#[cfg(test)]
mod tests {
    use mutau_core::{AnalysisConfig, DatasetInfo};

    use super::*;
    use crate::testing::*;

    #[test]
    fn test_golden_json_filter() {
        let golden = GoldenJson::from_json_str(r#"{"355100": [[1, 10], [20, 30]]}"#).unwrap();
        let config = AnalysisConfig::default();
        let dataset = DatasetInfo::data("data_mu_c", 1, "C");
        let ctx = StageContext::new(&config, &dataset, Some(&golden));
        let mut stage = GoldenJsonFilter::default();
        assert!(stage.applies_to(&ctx));
        stage.bind(&ctx).unwrap();
        let mut batch = batch(&[
            EventSpec {
                lumi: 5,
                ..EventSpec::default()
            },
            EventSpec {
                lumi: 15,
                ..EventSpec::default()
            },
            EventSpec {
                run: 355101,
                lumi: 5,
                ..EventSpec::default()
            },
            EventSpec {
                lumi: 30,
                ..EventSpec::default()
            },
        ]);
        let result = stage.run(&mut batch, &ctx).unwrap();
        assert_eq!(result.steps["json"], vec![true, false, false, true]);
    }

    #[test]
    fn test_golden_json_required_for_data() {
        let config = AnalysisConfig::default();
        let dataset = DatasetInfo::data("data_mu_c", 1, "C");
        let ctx = StageContext::new(&config, &dataset, None);
        assert!(matches!(
            GoldenJsonFilter::default().bind(&ctx),
            Err(MutauError::MissingGoldenJson { .. })
        ));
        let mc = DatasetInfo::mc("dy_incl", 51);
        assert!(!GoldenJsonFilter::default().applies_to(&StageContext::new(&config, &mc, None)));
    }

    #[test]
    fn test_mc_weight() {
        let config = AnalysisConfig::default();
        let dataset = DatasetInfo::mc("dy_incl", 51);
        let ctx = StageContext::new(&config, &dataset, None);
        let mut batch = batch(&[
            EventSpec {
                gen_weight: 0.5,
                ..EventSpec::default()
            },
            EventSpec {
                gen_weight: -1.5,
                ..EventSpec::default()
            },
        ]);
        assert!(McWeight.applies_to(&ctx));
        McWeight.run(&mut batch, &ctx).unwrap();
        assert_eq!(batch.floats("mc_weight").unwrap(), &[0.5, -1.5]);
    }

    #[test]
    fn test_attach_behavior_requires_kinematics() {
        let config = AnalysisConfig::default();
        let dataset = DatasetInfo::mc("dy_incl", 51);
        let ctx = StageContext::new(&config, &dataset, None);
        let mut batch = batch(&[EventSpec::default()]);
        assert!(AttachBehavior.run(&mut batch, &ctx).is_ok());
        batch.collection_mut("Tau").unwrap().remove_column("mass");
        assert!(matches!(
            AttachBehavior.run(&mut batch, &ctx),
            Err(MutauError::MissingColumn { .. })
        ));
    }
}
