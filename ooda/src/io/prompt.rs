//! Prompt rendering for orient and act invocations.
//!
//! Templates mark sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections go
//! first, then the last section is truncated.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::learnings::Learning;
use crate::core::types::Task;

const ORIENT_TEMPLATE: &str = include_str!("prompts/orient.md");
const ACT_TEMPLATE: &str = include_str!("prompts/act.md");

const DROP_ORDER: &[&str] = &["spec", "learnings", "human"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

#[derive(Debug, Clone, Serialize)]
struct LearningContext {
    id: String,
    text: String,
}

#[derive(Debug, Clone, Serialize)]
struct DegradedContext {
    name: String,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct TaskContext {
    id: String,
    title: String,
    description: String,
}

fn learning_contexts(learnings: &[Learning]) -> Vec<LearningContext> {
    learnings
        .iter()
        .map(|l| LearningContext {
            id: l.id.clone(),
            text: l.text.clone(),
        })
        .collect()
}

/// Everything the orient prompt shows the reasoner.
#[derive(Debug, Clone)]
pub struct OrientPromptInputs {
    pub iteration: u32,
    pub workdir: String,
    pub spec: String,
    /// Pretty-printed claims JSON.
    pub claims_json: String,
    pub learnings: Vec<Learning>,
    pub stagnation: Option<String>,
    /// The repository has no project skeleton yet.
    pub kickstart: bool,
    pub degraded: Vec<(String, String)>,
    pub comments: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ActPromptInputs {
    pub workdir: String,
    pub task: Task,
    pub intent: String,
    pub approach: String,
    pub spec: String,
    pub learnings: Vec<Learning>,
    /// New test failures from a previous attempt at this task.
    pub failures: Vec<String>,
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("orient", ORIENT_TEMPLATE)?;
        env.add_template("act", ACT_TEMPLATE)?;
        Ok(Self { env })
    }

    fn render_orient(&self, input: &OrientPromptInputs) -> Result<String> {
        let degraded: Vec<DegradedContext> = input
            .degraded
            .iter()
            .map(|(name, error)| DegradedContext {
                name: name.clone(),
                error: error.clone(),
            })
            .collect();
        let template = self.env.get_template("orient")?;
        Ok(template.render(context! {
            iteration => input.iteration,
            workdir => input.workdir,
            spec => input.spec.trim(),
            claims => input.claims_json,
            learnings => learning_contexts(&input.learnings),
            stagnation => input.stagnation.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            kickstart => input.kickstart,
            degraded => degraded,
            comments => input.comments,
        })?)
    }

    fn render_act(&self, input: &ActPromptInputs) -> Result<String> {
        let task = TaskContext {
            id: input.task.id.clone(),
            title: input.task.title.clone(),
            description: input.task.description.trim().to_string(),
        };
        let template = self.env.get_template("act")?;
        Ok(template.render(context! {
            workdir => input.workdir,
            task => task,
            intent => input.intent.trim(),
            approach => input.approach.trim(),
            spec => input.spec.trim(),
            learnings => learning_contexts(&input.learnings),
            failures => input.failures,
        })?)
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = collapse_blank_lines(rendered[whole.end()..end].trim());
        if !content.is_empty() {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required: kind.as_str() == "required",
                content,
            });
        }
    }
    sections
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };
    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }
    if total(sections) <= budget {
        return;
    }
    let others: usize = sections
        .iter()
        .rev()
        .skip(1)
        .map(|s| s.content.len())
        .sum();
    if let Some(last) = sections.last_mut() {
        let allowed = budget.saturating_sub(others).saturating_sub(12);
        let mut cut = allowed.min(last.content.len());
        while !last.content.is_char_boundary(cut) {
            cut -= 1;
        }
        last.content.truncate(cut);
        last.content.push_str("\n[truncated]");
        debug!(section = %last.key, "truncated section for budget");
    }
}

fn finish(rendered: &str, budget: usize) -> String {
    let mut sections = parse_sections(rendered);
    apply_budget(&mut sections, budget);
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}

pub fn render_orient_prompt(input: &OrientPromptInputs, budget_bytes: usize) -> Result<String> {
    let rendered = PromptEngine::new()?.render_orient(input)?;
    Ok(finish(&rendered, budget_bytes))
}

pub fn render_act_prompt(input: &ActPromptInputs, budget_bytes: usize) -> Result<String> {
    let rendered = PromptEngine::new()?.render_act(input)?;
    Ok(finish(&rendered, budget_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::learnings::Validity;
    use crate::core::types::{Priority, TaskStatus};

    fn learning(id: &str, text: &str) -> Learning {
        Learning {
            id: id.to_string(),
            text: text.to_string(),
            validity: Validity::Valid,
            added_in: 1,
            deprecation_reason: None,
        }
    }

    fn orient_inputs() -> OrientPromptInputs {
        OrientPromptInputs {
            iteration: 3,
            workdir: "/repo".to_string(),
            spec: "# Todo API\n- list todos".to_string(),
            claims_json: "{\"iteration_number\": 3}".to_string(),
            learnings: vec![learning("L1", "tests live in tests/api.rs")],
            stagnation: None,
            kickstart: false,
            degraded: vec![("work".to_string(), "tracker unavailable".to_string())],
            comments: vec!["prefer sqlite".to_string()],
        }
    }

    /// Sections render in a stable order and empty ones disappear.
    #[test]
    fn orient_prompt_orders_sections() {
        let prompt = render_orient_prompt(&orient_inputs(), 100_000).expect("render");
        let contract = prompt.find("### Orient Contract").expect("contract");
        let degraded = prompt.find("### Unavailable Sources").expect("degraded");
        let spec = prompt.find("### Spec").expect("spec");
        let human = prompt.find("### Human Comments").expect("comments");
        let learnings = prompt.find("### Learnings").expect("learnings");
        let claims = prompt.find("### Claims").expect("claims");
        assert!(contract < degraded && degraded < spec && spec < human);
        assert!(human < learnings && learnings < claims);
        assert!(!prompt.contains("Stagnation Detected"));
        assert!(!prompt.contains("New Project"));
        assert!(!prompt.contains("section:"));
        assert!(prompt.contains("- work: tracker unavailable"));
    }

    #[test]
    fn orient_prompt_includes_stagnation() {
        let mut input = orient_inputs();
        input.stagnation = Some("intent repeated".to_string());
        let prompt = render_orient_prompt(&input, 100_000).expect("render");
        assert!(prompt.contains("### Stagnation Detected\n\nintent repeated"));
    }

    #[test]
    fn orient_prompt_flags_a_project_without_skeleton() {
        let mut input = orient_inputs();
        input.kickstart = true;
        let prompt = render_orient_prompt(&input, 100_000).expect("render");
        let kickstart = prompt.find("### New Project").expect("kickstart");
        let spec = prompt.find("### Spec").expect("spec");
        assert!(kickstart < spec);
        assert!(prompt.contains("no build manifest"));
    }

    #[test]
    fn budget_drops_droppable_sections_first() {
        let mut input = orient_inputs();
        input.learnings = (0..200)
            .map(|i| learning(&format!("L{i}"), "a long learning about the repository layout"))
            .collect();
        let prompt = render_orient_prompt(&input, 2_500).expect("render");
        assert!(!prompt.contains("### Learnings"));
        assert!(prompt.contains("### Orient Contract"));
        assert!(prompt.contains("### Claims"));
    }

    #[test]
    fn act_prompt_names_the_task_and_failures() {
        let input = ActPromptInputs {
            workdir: "/repo".to_string(),
            task: Task {
                id: "t7".to_string(),
                title: "Add list endpoint".to_string(),
                description: "GET /todos returns all todos".to_string(),
                status: TaskStatus::Open,
                priority: Priority::P1,
                blocker_reason: None,
                parent_id: Some("root".to_string()),
                blocked_by: Vec::new(),
            },
            intent: "Implement listing".to_string(),
            approach: "Add handler and test".to_string(),
            spec: "# Todo API".to_string(),
            learnings: Vec::new(),
            failures: vec!["api::list_empty".to_string()],
        };
        let prompt = render_act_prompt(&input, 100_000).expect("render");
        assert!(prompt.contains("### Task t7: Add list endpoint"));
        assert!(prompt.contains("- api::list_empty"));
        assert!(prompt.contains("`task_id` must be `t7`"));
        assert!(!prompt.contains("### Learnings"));
    }
}
