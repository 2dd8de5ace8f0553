//! Prompt rendering for baseline, build, verify and decomposition turns.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections are
//! removed first (in a fixed order) and the last section is truncated only as
//! a last resort.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::task::Task;
use crate::io::backlog::FeatureRequest;

const BASELINE_TEMPLATE: &str = include_str!("../prompts/baseline.md");
const BUILD_TEMPLATE: &str = include_str!("../prompts/build.md");
const VERIFY_TEMPLATE: &str = include_str!("../prompts/verify.md");
const DECOMPOSE_TEMPLATE: &str = include_str!("../prompts/decompose.md");

/// Default byte budget for a rendered prompt.
pub const DEFAULT_PROMPT_BUDGET: usize = 48_000;

/// Drop order when over budget: least critical first.
const DROP_ORDER: [&str; 5] = ["prd", "tasks", "build", "ui", "failure"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section regex is valid")
});

pub struct BaselineInputs<'a> {
    pub protected_files: &'a [String],
    pub prd_path: &'a str,
    pub tasks_path: &'a str,
    pub runs_dir: &'a str,
}

pub struct BuildInputs<'a> {
    pub task: &'a Task,
    pub iteration: u64,
    pub gates: &'a [String],
    pub previous_failure: Option<&'a str>,
    pub prd: Option<&'a str>,
}

pub struct VerifyInputs<'a> {
    pub task: &'a Task,
    pub gate_summary: &'a str,
    pub gate_log: &'a str,
    pub gate_json: &'a str,
    pub ui_summary: Option<&'a str>,
    pub ui_artifacts: &'a [String],
    pub build_prompt: &'a str,
}

pub struct DecomposeInputs<'a> {
    pub feature: &'a FeatureRequest,
    pub existing: &'a [Task],
    pub prd: Option<&'a str>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptEngine {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("baseline", BASELINE_TEMPLATE)
            .context("load baseline template")?;
        env.add_template("build", BUILD_TEMPLATE)
            .context("load build template")?;
        env.add_template("verify", VERIFY_TEMPLATE)
            .context("load verify template")?;
        env.add_template("decompose", DECOMPOSE_TEMPLATE)
            .context("load decompose template")?;
        Ok(Self { env, budget_bytes })
    }

    pub fn render_baseline(&self, input: &BaselineInputs<'_>) -> Result<String> {
        let rendered = self.env.get_template("baseline")?.render(context! {
            protected_files => input.protected_files,
            prd_path => input.prd_path,
            tasks_path => input.tasks_path,
            runs_dir => input.runs_dir,
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn render_build(&self, input: &BuildInputs<'_>) -> Result<String> {
        let rendered = self.env.get_template("build")?.render(context! {
            task => input.task,
            iteration => input.iteration,
            gates => input.gates,
            previous_failure => input.previous_failure.map(str::trim).filter(|s| !s.is_empty()),
            prd => input.prd.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn render_verify(&self, input: &VerifyInputs<'_>) -> Result<String> {
        let rendered = self.env.get_template("verify")?.render(context! {
            task => input.task,
            gate_summary => input.gate_summary,
            gate_log => input.gate_log,
            gate_json => input.gate_json,
            ui_summary => input.ui_summary,
            ui_artifacts => input.ui_artifacts,
            build_prompt => input.build_prompt,
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn render_decompose(&self, input: &DecomposeInputs<'_>) -> Result<String> {
        let rendered = self.env.get_template("decompose")?.render(context! {
            feature => input.feature,
            existing => input.existing,
            prd => input.prd.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        render_sections(&sections)
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in matches.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let required = kind.as_str() == "required";
        let end = matches
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let other_len: usize = sections
        .iter()
        .take(sections.len().saturating_sub(1))
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    if let Some(last) = sections.last_mut()
        && last.content.len() > allowed
    {
        let before_len = last.content.len();
        let keep = floor_char_boundary(&last.content, allowed.saturating_sub(12));
        last.content.truncate(keep);
        last.content.push_str("\n[truncated]");
        debug!(section = %last.key, before_len, after_len = last.content.len(), "truncated section for budget");
    }
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn render_sections(sections: &[ParsedSection]) -> String {
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::backlog::FeatureStatus;

    fn task() -> Task {
        let mut task = Task::new("T-003", "Add login form");
        task.acceptance = vec!["form validates email".to_string()];
        task.scope = vec!["src/login/**".to_string()];
        task
    }

    fn engine() -> PromptEngine {
        PromptEngine::new(DEFAULT_PROMPT_BUDGET).expect("engine")
    }

    #[test]
    fn build_prompt_orders_sections() {
        let task = task();
        let gates = vec!["npm test".to_string()];
        let prompt = engine()
            .render_build(&BuildInputs {
                task: &task,
                iteration: 4,
                gates: &gates,
                previous_failure: Some("gate `test` failed"),
                prd: Some("# PRD"),
            })
            .expect("render");

        let contract = prompt.find("<contract>").expect("contract");
        let task_pos = prompt.find("### Task T-003: Add login form").expect("task");
        let gates_pos = prompt.find("- `npm test`").expect("gates");
        let failure = prompt.find("<failure>").expect("failure");
        let prd = prompt.find("<prd>").expect("prd");
        assert!(contract < task_pos && task_pos < gates_pos && gates_pos < failure && failure < prd);
        assert!(prompt.contains("Iteration: 4"));
        assert!(!prompt.contains("section:"));
    }

    #[test]
    fn empty_optional_sections_are_omitted() {
        let task = task();
        let prompt = engine()
            .render_build(&BuildInputs {
                task: &task,
                iteration: 1,
                gates: &[],
                previous_failure: None,
                prd: Some("   "),
            })
            .expect("render");
        assert!(!prompt.contains("<failure>"));
        assert!(!prompt.contains("<prd>"));
        assert!(prompt.contains("No gates are configured."));
    }

    #[test]
    fn budget_drops_prd_before_required_sections() {
        let task = task();
        let prd = "requirement ".repeat(500);
        let prompt = PromptEngine::new(900)
            .expect("engine")
            .render_build(&BuildInputs {
                task: &task,
                iteration: 1,
                gates: &[],
                previous_failure: Some("timed out"),
                prd: Some(&prd),
            })
            .expect("render");
        assert!(!prompt.contains("<prd>"));
        assert!(prompt.contains("<failure>"));
        assert!(prompt.contains("<task>"));
    }

    #[test]
    fn verify_prompt_demands_both_signals() {
        let task = task();
        let artifacts = vec![".loopsmith/runs/x/ui/screenshot.png".to_string()];
        let prompt = engine()
            .render_verify(&VerifyInputs {
                task: &task,
                gate_summary: "2 gate(s) passed",
                gate_log: ".loopsmith/runs/x/gate.log",
                gate_json: ".loopsmith/runs/x/gates.json",
                ui_summary: Some("passed"),
                ui_artifacts: &artifacts,
                build_prompt: ".loopsmith/runs/x/build_prompt.md",
            })
            .expect("render");
        assert!(prompt.contains("Status: PASS"));
        assert!(prompt.contains("EXIT_SIGNAL: true"));
        assert!(prompt.contains("- form validates email"));
        assert!(prompt.contains("screenshot.png"));
    }

    #[test]
    fn baseline_lists_protected_files() {
        let files = vec![".loopsmith/state/run_state.json".to_string()];
        let prompt = engine()
            .render_baseline(&BaselineInputs {
                protected_files: &files,
                prd_path: ".loopsmith/PRD.md",
                tasks_path: ".loopsmith/state/tasks.json",
                runs_dir: ".loopsmith/runs",
            })
            .expect("render");
        assert!(prompt.contains("- `.loopsmith/state/run_state.json`"));
        assert!(prompt.contains("Do not reply"));
    }

    #[test]
    fn decompose_lists_existing_tasks() {
        let feature = FeatureRequest {
            id: "F-001".to_string(),
            title: "Login".to_string(),
            request: "Users sign in with email".to_string(),
            status: FeatureStatus::Open,
            task_ids: Vec::new(),
            created_at: None,
        };
        let existing = vec![task()];
        let prompt = engine()
            .render_decompose(&DecomposeInputs {
                feature: &feature,
                existing: &existing,
                prd: None,
            })
            .expect("render");
        assert!(prompt.contains("### F-001: Login"));
        assert!(prompt.contains("- T-003 [open] Add login form"));
        assert!(prompt.contains("```json"));
    }
}
