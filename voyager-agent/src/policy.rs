//! Action selection for a running episode

use crate::agent::{Action, StepResult};
use std::collections::{BTreeMap, BTreeSet};
use voyager_env::registry::SkillId;
use voyager_env::session::Observation;

/// What a policy gets to look at before choosing
pub struct PolicyView<'a> {
    pub skills: &'a [SkillId],
    pub run_counts: &'a BTreeMap<SkillId, usize>,
    pub observation: &'a Observation,
}

pub trait Policy {
    fn next_action(&mut self, view: &PolicyView<'_>) -> Action;

    /// Called after every step with the action that produced `result`
    fn record(&mut self, _action: &Action, _result: &StepResult) {}
}

/// Grow the library once every known skill has been tried since the last
/// discovery, otherwise rerun the least-used skill.
#[derive(Debug, Default)]
pub struct ExplorationPolicy {
    tried: BTreeSet<SkillId>,
}

impl ExplorationPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Policy for ExplorationPolicy {
    fn next_action(&mut self, view: &PolicyView<'_>) -> Action {
        view.skills
            .iter()
            .filter(|id| !self.tried.contains(id))
            .min_by_key(|id| (view.run_counts.get(id).copied().unwrap_or(0), **id))
            .map(|&skill_id| Action::RunSkill { skill_id })
            .unwrap_or(Action::NewSkill)
    }

    fn record(&mut self, action: &Action, result: &StepResult) {
        if result.reward > 0.0 {
            self.tried.clear();
        }
        match action {
            Action::RunSkill { skill_id } => {
                self.tried.insert(*skill_id);
            }
            // the growth loop already ran the skill it accepted
            Action::NewSkill => {
                if let Some(id) = result.info.get("skill_id").and_then(|v| v.as_u64()) {
                    self.tried.insert(id as SkillId);
                }
            }
            _ => {}
        }
    }
}

/// Replays a fixed list of actions, then inspects the library
#[derive(Debug, Default)]
pub struct ScriptedPolicy {
    actions: std::collections::VecDeque<Action>,
}

impl ScriptedPolicy {
    pub fn new(actions: impl IntoIterator<Item = Action>) -> Self {
        Self {
            actions: actions.into_iter().collect(),
        }
    }
}

impl Policy for ScriptedPolicy {
    fn next_action(&mut self, _view: &PolicyView<'_>) -> Action {
        self.actions.pop_front().unwrap_or(Action::InspectLibrary)
    }
}
