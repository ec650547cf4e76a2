//! Declarative multi-step plans and their persisted execution state.
//!
//! A plan is an ordered set of steps forming a DAG over `depends_on`
//! edges. Execution groups steps into waves (topological layers); each
//! wave fans out in parallel and rendezvouses before the next starts.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};

fn default_max_retries() -> u32 {
    2
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Unique within the plan.
    pub id: String,
    /// Worker pool that executes this step.
    pub agent_id: String,
    /// Prompt template; `{step_id.output}` placeholders are substituted
    /// with outputs of prior succeeded steps.
    pub prompt: String,
    /// Step ids in the same plan that must succeed first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Plan-level retry budget (new task with a retry prompt per attempt).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// When set, the step waits for a human approval event before its
    /// task is created.
    #[serde(default)]
    pub requires_approval: bool,
}

/// A named, ordered sequence of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Structural validation: non-empty, unique ids, resolvable
    /// dependencies, acyclic graph. No state is mutated on failure.
    pub fn validate(&self) -> CoreResult<()> {
        if self.steps.is_empty() {
            return Err(CoreError::Validation(format!(
                "plan '{}' has no steps",
                self.name
            )));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "plan '{}' has duplicate step id '{}'",
                    self.name, step.id
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(CoreError::Validation(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
        }

        // Wave layering doubles as cycle detection.
        self.waves()?;
        Ok(())
    }

    /// Topological layering (Kahn-style): every pass selects all steps
    /// whose dependencies are already processed. A pass that selects
    /// nothing while steps remain means the graph has a cycle.
    ///
    /// Waves are recomputed fresh on every execute and resume so the plan
    /// definition stays the source of truth.
    pub fn waves(&self) -> CoreResult<Vec<Vec<&PlanStep>>> {
        let by_id: HashMap<&str, &PlanStep> =
            self.steps.iter().map(|s| (s.id.as_str(), s)).collect();

        let mut processed: HashSet<&str> = HashSet::new();
        let mut waves: Vec<Vec<&PlanStep>> = Vec::new();

        while processed.len() < self.steps.len() {
            let mut wave: Vec<&PlanStep> = Vec::new();
            for step in &self.steps {
                if processed.contains(step.id.as_str()) {
                    continue;
                }
                let ready = step
                    .depends_on
                    .iter()
                    .all(|dep| processed.contains(dep.as_str()));
                if ready {
                    wave.push(step);
                }
            }

            if wave.is_empty() {
                let stuck: Vec<&str> = self
                    .steps
                    .iter()
                    .filter(|s| !processed.contains(s.id.as_str()))
                    .map(|s| s.id.as_str())
                    .collect();
                return Err(CoreError::Validation(format!(
                    "plan '{}' has a dependency cycle involving: {}",
                    self.name,
                    stuck.join(", ")
                )));
            }

            for step in &wave {
                processed.insert(step.id.as_str());
            }
            waves.push(wave);
        }

        debug_assert!(by_id.len() == processed.len());
        Ok(waves)
    }

    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Substitute `{step_id.output}` placeholders with outputs of finished
/// steps. Placeholders referring to unfinished or absent steps remain
/// literal.
pub fn render_prompt(template: &str, outputs: &BTreeMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (step_id, output) in outputs {
        let placeholder = format!("{{{step_id}.output}}");
        if rendered.contains(&placeholder) {
            rendered = rendered.replace(&placeholder, output);
        }
    }
    rendered
}

/// Compose the deterministic retry prompt for a failed step.
///
/// Contains: the failure statement, the original prompt verbatim, the
/// attempt number with the error message, and the instruction to analyze
/// and change approach.
pub fn retry_prompt(original_prompt: &str, attempt: u32, error: &str) -> String {
    format!(
        "The previous attempt at this step failed.\n\
         \n\
         Original instructions:\n\
         {original_prompt}\n\
         \n\
         Attempt {attempt} failed with error: {error}\n\
         \n\
         Analyze the error above and try a different approach."
    )
}

/// Status of a plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Status of one step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Once a step record is succeeded or failed it is never re-executed
    /// by a resume.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Persisted state of one plan run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: String,
    pub plan_name: String,
    pub session_id: String,
    pub status: ExecutionStatus,
    /// Next wave to run; monotonic.
    pub current_wave: u32,
    pub total_steps: u32,
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persisted state of one step within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub execution_id: String,
    pub step_id: String,
    pub step_index: u32,
    pub wave_number: u32,
    pub agent_id: String,
    pub prompt: String,
    pub status: StepStatus,
    /// Attempts consumed so far; read back from the store before any
    /// retry decision.
    pub attempt: u32,
    pub task_id: Option<Uuid>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub cost: f64,
}

impl StepRecord {
    /// Initial pending record for a step placed in a wave.
    pub fn pending(execution_id: &str, step: &PlanStep, step_index: u32, wave_number: u32) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            step_id: step.id.clone(),
            step_index,
            wave_number,
            agent_id: step.agent_id.clone(),
            prompt: step.prompt.clone(),
            status: StepStatus::Pending,
            attempt: 0,
            task_id: None,
            result: None,
            error: None,
            cost: 0.0,
        }
    }
}

/// Aggregate result of an execution, keyed by step id.
///
/// A failed execution still carries every step record gathered so far;
/// `error` wraps the first fatal step failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanResult {
    pub execution_id: String,
    pub status: Option<ExecutionStatus>,
    pub steps: BTreeMap<String, StepRecord>,
    pub total_cost: f64,
    pub error: Option<String>,
}

impl PlanResult {
    pub fn output_of(&self, step_id: &str) -> Option<&str> {
        self.steps
            .get(step_id)
            .and_then(|rec| rec.result.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        PlanStep {
            id: id.to_string(),
            agent_id: format!("agent-{id}"),
            prompt: format!("do {id}"),
            depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
            max_retries: 2,
            requires_approval: false,
        }
    }

    fn plan(steps: Vec<PlanStep>) -> Plan {
        Plan {
            name: "test-plan".to_string(),
            steps,
        }
    }

    #[test]
    fn test_empty_plan_rejected() {
        let p = plan(vec![]);
        assert!(matches!(p.validate(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let p = plan(vec![step("a", &[]), step("a", &[])]);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let p = plan(vec![step("a", &["ghost"])]);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("unknown step"));
    }

    #[test]
    fn test_cycle_rejected() {
        let p = plan(vec![step("a", &["b"]), step("b", &["a"])]);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_linear_waves() {
        let p = plan(vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])]);
        let waves = p.waves().unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0][0].id, "a");
        assert_eq!(waves[1][0].id, "b");
        assert_eq!(waves[2][0].id, "c");
    }

    #[test]
    fn test_diamond_waves() {
        let p = plan(vec![
            step("a", &[]),
            step("b", &[]),
            step("c", &["a", "b"]),
        ]);
        let waves = p.waves().unwrap();
        assert_eq!(waves.len(), 2);
        let first: Vec<&str> = waves[0].iter().map(|s| s.id.as_str()).collect();
        assert_eq!(first, vec!["a", "b"]);
        assert_eq!(waves[1][0].id, "c");
    }

    #[test]
    fn test_render_prompt_substitutes_finished_outputs() {
        let mut outputs = BTreeMap::new();
        outputs.insert("a".to_string(), "X".to_string());

        let rendered = render_prompt("use {a.output} then {b.output}", &outputs);
        assert_eq!(rendered, "use X then {b.output}");
    }

    #[test]
    fn test_render_prompt_without_placeholders() {
        let outputs = BTreeMap::new();
        assert_eq!(render_prompt("plain prompt", &outputs), "plain prompt");
    }

    #[test]
    fn test_retry_prompt_contains_all_elements() {
        let prompt = retry_prompt("summarize the report", 2, "rate limit exceeded");
        assert!(prompt.contains("failed"));
        assert!(prompt.contains("summarize the report"));
        assert!(prompt.contains("Attempt 2"));
        assert!(prompt.contains("rate limit exceeded"));
        assert!(prompt.contains("different approach"));
    }

    #[test]
    fn test_plan_yaml_round_trip() {
        let yaml = r"
name: review
steps:
  - id: draft
    agent_id: writer
    prompt: draft the document
  - id: check
    agent_id: reviewer
    prompt: 'review: {draft.output}'
    depends_on: [draft]
    max_retries: 1
";
        let p: Plan = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(p.name, "review");
        assert_eq!(p.steps.len(), 2);
        assert_eq!(p.steps[0].max_retries, 2); // default
        assert_eq!(p.steps[1].max_retries, 1);
        assert!(p.validate().is_ok());
    }
}
