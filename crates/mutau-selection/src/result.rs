use auto_ops::impl_op_ex;
use indexmap::IndexMap;
use mutau_core::{Jagged, MutauError, MutauResult};

/// Per-trigger output of the trigger selection.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerData {
    /// Trigger name
    pub name: String,
    /// Trigger id
    pub id: i64,
    /// Raw decision and all legs matched, per event
    pub fired: Vec<bool>,
    /// Trigger objects matching each leg
    pub leg_masks: Vec<Jagged<bool>>,
}

/// What one or more stages decided about a batch.
///
/// `steps` hold one boolean per event in evaluation order, `objects` hold selected object
/// indices (source collection → target name → per-event indices) and `event` is the final
/// decision once the orchestrator has combined the steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionResult {
    pub steps: IndexMap<String, Vec<bool>>,
    pub objects: IndexMap<String, IndexMap<String, Jagged<i64>>>,
    pub triggers: Vec<TriggerData>,
    pub event: Option<Vec<bool>>,
}

impl SelectionResult {
    /// An empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named step.
    pub fn with_step(mut self, name: &str, mask: Vec<bool>) -> Self {
        self.steps.insert(name.to_string(), mask);
        self
    }

    /// Add selected object indices of `collection`, stored under `target`.
    pub fn with_objects(mut self, collection: &str, target: &str, indices: Jagged<i64>) -> Self {
        self.objects
            .entry(collection.to_string())
            .or_default()
            .insert(target.to_string(), indices);
        self
    }

    /// Borrow a step.
    pub fn step(&self, name: &str) -> MutauResult<&[bool]> {
        self.steps
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| MutauError::MissingColumn {
                column: format!("step {name}"),
            })
    }

    /// Logical AND of every step; all true when there are no steps.
    pub fn combined_steps(&self, n_events: usize) -> MutauResult<Vec<bool>> {
        let mut mask = vec![true; n_events];
        for (name, step) in &self.steps {
            if step.len() != n_events {
                return Err(MutauError::LengthMismatch {
                    context: format!("step \"{name}\""),
                    expected: n_events,
                    actual: step.len(),
                });
            }
            mask.iter_mut().zip(step).for_each(|(m, &s)| *m &= s);
        }
        Ok(mask)
    }

    fn merge(&mut self, other: &SelectionResult) {
        for (name, step) in &other.steps {
            self.steps.insert(name.clone(), step.clone());
        }
        for (collection, targets) in &other.objects {
            let entry = self.objects.entry(collection.clone()).or_default();
            for (target, indices) in targets {
                entry.insert(target.clone(), indices.clone());
            }
        }
        self.triggers.extend(other.triggers.iter().cloned());
        if other.event.is_some() {
            self.event.clone_from(&other.event);
        }
    }
}

// later results win for repeated names
impl_op_ex!(+= |a: &mut SelectionResult, b: &SelectionResult| { a.merge(b) });
impl_op_ex!(+ |a: &SelectionResult, b: &SelectionResult| -> SelectionResult {
    let mut merged = a.clone();
    merged.merge(b);
    merged
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_steps() {
        let result = SelectionResult::new()
            .with_step("trigger", vec![true, true, false])
            .with_step("b_jet_veto", vec![true, false, true]);
        assert_eq!(
            result.combined_steps(3).unwrap(),
            vec![true, false, false]
        );
        assert_eq!(SelectionResult::new().combined_steps(2).unwrap(), vec![true; 2]);
        assert!(result.combined_steps(2).is_err());
    }

    #[test]
    fn test_merge_keeps_step_order_and_overrides_objects() {
        let mut result = SelectionResult::new()
            .with_step("a", vec![true])
            .with_objects("Muon", "Muon", Jagged::from_lists(vec![vec![0]]));
        result += SelectionResult::new()
            .with_step("b", vec![false])
            .with_objects("Muon", "Muon", Jagged::from_lists(vec![vec![]]));
        assert_eq!(
            result.steps.keys().collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(result.objects["Muon"]["Muon"].count(0), 0);
        assert_eq!(result.step("b").unwrap(), &[false]);
        assert!(result.step("c").is_err());
    }
}
