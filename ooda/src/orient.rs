//! ORIENT: ask the reasoner for a verdict and verify it.
//!
//! The reasoner is untrusted. Its raw text only becomes a [`Verdict`] after
//! [`validate_verdict`] accepts it, and an active stagnation flag can still
//! demote the verdict's actionable work.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::claims::Claims;
use crate::core::learnings::Learning;
use crate::core::loop_detect::{Gate, gate_verdict};
use crate::core::retry::RetryPolicy;
use crate::core::types::{HumanInputKind, Verdict};
use crate::io::agent::{Agent, AgentRequest, AgentRole, invoke_and_read, write_schema};
use crate::io::config::AgentConfig;
use crate::io::prompt::{OrientPromptInputs, render_orient_prompt};
use crate::io::retry::retry_transient;
use crate::io::signal::CancelFlag;
use crate::io::transcripts::TranscriptPaths;
use crate::validate::{VERDICT_SCHEMA, validate_verdict};

/// Everything the reasoner may look at for one iteration.
#[derive(Debug, Clone)]
pub struct OrientRequest<'a> {
    pub run_id: &'a str,
    pub workdir: &'a Path,
    /// Latest recorded spec version.
    pub spec: &'a str,
    pub claims: &'a Claims,
    /// Currently valid learnings.
    pub learnings: &'a [Learning],
}

/// Unverified reasoner output plus where its transcript lives.
#[derive(Debug, Clone)]
pub struct RawVerdict {
    pub raw: String,
    pub transcript_path: PathBuf,
}

pub trait Reasoner {
    fn orient(&self, request: &OrientRequest<'_>) -> Result<RawVerdict>;
}

/// Reasoner backed by an [`Agent`] process.
pub struct AgentReasoner<'a, A: Agent + ?Sized> {
    agent: &'a A,
    config: &'a AgentConfig,
    transcripts_dir: &'a Path,
    schemas_dir: &'a Path,
    retry: RetryPolicy,
    cancel: &'a CancelFlag,
}

impl<'a, A: Agent + ?Sized> AgentReasoner<'a, A> {
    pub fn new(
        agent: &'a A,
        config: &'a AgentConfig,
        transcripts_dir: &'a Path,
        schemas_dir: &'a Path,
        retry: RetryPolicy,
        cancel: &'a CancelFlag,
    ) -> Self {
        Self {
            agent,
            config,
            transcripts_dir,
            schemas_dir,
            retry,
            cancel,
        }
    }
}

impl<A: Agent + ?Sized> Reasoner for AgentReasoner<'_, A> {
    #[instrument(skip_all, fields(run_id = %request.run_id, iteration = request.claims.iteration_number))]
    fn orient(&self, request: &OrientRequest<'_>) -> Result<RawVerdict> {
        let prompt = render_orient_prompt(&prompt_inputs(request)?, self.config.prompt_budget_bytes)?;
        let schema_path = self.schemas_dir.join("verdict.schema.json");
        write_schema(&schema_path, VERDICT_SCHEMA)?;

        let mut attempt = 0;
        retry_transient(&self.retry, "orient", self.cancel, || {
            attempt += 1;
            let transcript = TranscriptPaths::new(
                self.transcripts_dir,
                request.run_id,
                request.claims.iteration_number,
                AgentRole::Orient.as_str(),
                None,
                attempt,
            );
            transcript.write_prompt(&prompt)?;
            transcript.clear_output()?;
            let agent_request = AgentRequest {
                role: AgentRole::Orient,
                task_id: None,
                workdir: request.workdir.to_path_buf(),
                prompt: prompt.clone(),
                schema_path: schema_path.clone(),
                output_path: transcript.output_path.clone(),
                log_path: transcript.log_path.clone(),
                timeout: Duration::from_secs(self.config.timeout_secs),
                output_limit_bytes: self.config.output_limit_bytes,
            };
            let raw = invoke_and_read(self.agent, &agent_request)?;
            Ok(RawVerdict {
                raw,
                transcript_path: transcript.output_path,
            })
        })
    }
}

fn prompt_inputs(request: &OrientRequest<'_>) -> Result<OrientPromptInputs> {
    let claims = request.claims;
    let comments = claims
        .human
        .data()
        .map(|human| {
            human
                .inputs
                .iter()
                .filter(|input| input.kind == HumanInputKind::Comment)
                .map(|input| input.content.clone())
                .collect()
        })
        .unwrap_or_default();
    Ok(OrientPromptInputs {
        iteration: claims.iteration_number,
        workdir: request.workdir.display().to_string(),
        spec: request.spec.to_string(),
        claims_json: serde_json::to_string_pretty(claims).context("serialize claims")?,
        learnings: request.learnings.to_vec(),
        stagnation: claims.stagnation().map(|flag| flag.message.clone()),
        kickstart: claims.kickstart(),
        degraded: claims
            .degraded_sections()
            .into_iter()
            .map(|(name, err)| (name.to_string(), err.to_string()))
            .collect(),
        comments,
    })
}

/// A verdict that passed validation and the stagnation gate.
#[derive(Debug, Clone)]
pub struct VerifiedVerdict {
    pub verdict: Verdict,
    pub gate: Gate,
}

/// Validate raw output against `claims` and apply the stagnation gate.
pub fn verify(raw: &str, claims: &Claims) -> Result<VerifiedVerdict> {
    let mut verdict = validate_verdict(raw, claims)?;
    let gate = gate_verdict(&mut verdict, claims.stagnation());
    match &gate {
        Gate::Pass => info!(
            spec_satisfied = %verdict.spec_satisfied,
            actionable = verdict.actionable_work_exists,
            planned = verdict.iteration_plan.tasks.len(),
            "verdict accepted"
        ),
        Gate::Demoted { reason } => warn!(reason = %reason, "verdict demoted by stagnation gate"),
    }
    Ok(VerifiedVerdict { verdict, gate })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;

    use super::*;
    use crate::core::claims::Section;
    use crate::core::loop_detect::{Stagnation, StagnationFlag};
    use crate::core::types::TaskStatus;
    use crate::error::{HaltKind, RetriesExhausted, StructuralHalt};
    use crate::test_support::{
        ScriptedAgent, ScriptedResponse, claims_with, planning_verdict, task, verdict_json,
        work_claims,
    };

    fn claims() -> Claims {
        claims_with(work_claims(vec![
            task("root", TaskStatus::Open),
            task("t1", TaskStatus::Open),
        ]))
    }

    fn stagnant(mut claims: Claims) -> Claims {
        if let Section::Collected(project) = &mut claims.project {
            project.stagnation = Some(StagnationFlag {
                signature: Stagnation::RepeatedIntent {
                    intent: "implement listing".to_string(),
                    iterations: 2,
                },
                message: "intent repeated".to_string(),
            });
            project.last_failing_tests = BTreeSet::new();
        }
        claims
    }

    #[test]
    fn agent_reasoner_writes_transcript_and_returns_raw() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ScriptedAgent::new();
        agent.push_verdict(&planning_verdict("Implement listing", &["t1"]));
        let config = AgentConfig::default();
        let cancel = CancelFlag::new();
        let transcripts = temp.path().join("transcripts");
        let schemas = temp.path().join("schemas");
        let reasoner = AgentReasoner::new(
            &agent,
            &config,
            &transcripts,
            &schemas,
            RetryPolicy::immediate(3),
            &cancel,
        );
        let claims = claims();
        let request = OrientRequest {
            run_id: "run-1",
            workdir: temp.path(),
            spec: "# Todo API",
            claims: &claims,
            learnings: &[],
        };
        let raw = reasoner.orient(&request).expect("orient");
        assert!(raw.transcript_path.ends_with("run-1/1/orient.output.json"));
        assert!(transcripts.join("run-1/1/orient.prompt.md").exists());
        assert!(schemas.join("verdict.schema.json").exists());

        let prompt = fs::read_to_string(transcripts.join("run-1/1/orient.prompt.md")).expect("prompt");
        assert!(prompt.contains("# Todo API"));

        let verified = verify(&raw.raw, &claims).expect("verify");
        assert_eq!(verified.gate, Gate::Pass);
        assert_eq!(verified.verdict.iteration_plan.tasks, vec!["t1".to_string()]);
    }

    #[test]
    fn transient_agent_failures_are_retried_then_exhausted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ScriptedAgent::new();
        agent.push(AgentRole::Orient, ScriptedResponse::failure("HTTP 503"));
        agent.push(AgentRole::Orient, ScriptedResponse::failure("HTTP 503"));
        let config = AgentConfig::default();
        let cancel = CancelFlag::new();
        let reasoner = AgentReasoner::new(
            &agent,
            &config,
            temp.path(),
            temp.path(),
            RetryPolicy::immediate(2),
            &cancel,
        );
        let claims = claims();
        let request = OrientRequest {
            run_id: "run-1",
            workdir: temp.path(),
            spec: "# Todo API",
            claims: &claims,
            learnings: &[],
        };
        let err = reasoner.orient(&request).unwrap_err();
        assert!(err.downcast_ref::<RetriesExhausted>().is_some());
        assert_eq!(agent.calls(AgentRole::Orient), 2);
    }

    #[test]
    fn verify_rejects_invalid_output() {
        let err = verify("{}", &claims()).unwrap_err();
        let halt = err.downcast_ref::<StructuralHalt>().expect("halt");
        assert_eq!(halt.kind, HaltKind::SchemaViolation);
    }

    #[test]
    fn verify_demotes_a_repeated_plan_under_stagnation() {
        let claims = stagnant(claims());
        let raw = verdict_json(&planning_verdict("Implement listing", &["t1"]));
        let verified = verify(&raw, &claims).expect("verify");
        assert!(matches!(verified.gate, Gate::Demoted { .. }));
        assert!(!verified.verdict.actionable_work_exists);

        let raw = verdict_json(&planning_verdict("Investigate flaky storage", &["t1"]));
        let verified = verify(&raw, &claims).expect("verify");
        assert_eq!(verified.gate, Gate::Pass);
    }
}
