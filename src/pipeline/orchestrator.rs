//! The run state machine: Draft → (Refine ×N → Synthesize), or one direct call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ConfigurationError, PipelineConfig};
use crate::gateway::{
    Attribution, CompletionClient, CompletionRequest, CompletionResponse, Part, ToolConfig, Turn,
};
use crate::prompts::compose_system_instruction;
use crate::topology::{Mode, PipelineTopology, TopologyTable};

use super::aggregate::aggregate;
use super::executor::{StageError, StageExecutor, StageResult};
use super::progress::{self, ProgressEvent, ProgressObserver};
use super::trace::{StageTrace, TraceError, TraceSink};
use super::{FinalResult, PipelineError, RunStatus, RunUsage, Stage};

/// Trace `error` of a call abandoned through the cancellation token.
const CANCELLED: &str = "cancelled";

// =============================================================================
// Run input and state
// =============================================================================

/// Everything the caller supplies for one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInput {
    pub mode: Mode,
    /// Prior conversation, oldest first. Snapshot; never written back.
    #[serde(default)]
    pub history: Vec<Turn>,
    /// Content of the new user turn. Non-text parts are passed through as-is.
    pub user_parts: Vec<Part>,
    /// Caller persona / system instruction.
    #[serde(default)]
    pub persona: String,
    /// Attach the search tool even if the mode does not.
    #[serde(default)]
    pub enable_search: bool,
}

impl RunInput {
    pub fn new(mode: Mode, user_parts: Vec<Part>) -> Self {
        Self {
            mode,
            history: Vec::new(),
            user_parts,
            persona: String::new(),
            enable_search: false,
        }
    }

    pub fn text(mode: Mode, text: impl Into<String>) -> Self {
        Self::new(mode, vec![Part::text(text)])
    }

    pub fn history(mut self, history: Vec<Turn>) -> Self {
        self.history = history;
        self
    }

    pub fn persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    pub fn search(mut self, enable: bool) -> Self {
        self.enable_search = enable;
        self
    }
}

/// Ephemeral state of one run. Owned by the `run` call that created it.
#[derive(Debug)]
pub struct PipelineRun {
    pub id: Uuid,
    pub mode: Mode,
    pub topology: PipelineTopology,
    pub history: Vec<Turn>,
    pub user_parts: Vec<Part>,
    pub persona: String,
    pub tools: ToolConfig,
    pub draft: Option<CompletionResponse>,
    pub refinements: Option<StageResult>,
    pub status: RunStatus,
    pub usage: RunUsage,
}

impl PipelineRun {
    pub fn new(topology: PipelineTopology, input: RunInput) -> Self {
        let tools = ToolConfig {
            enable_search: topology.extra.enable_search_tool || input.enable_search,
            disable_reasoning: topology.extra.disable_reasoning,
        };
        Self {
            id: Uuid::new_v4(),
            mode: input.mode,
            topology,
            history: input.history,
            user_parts: input.user_parts,
            persona: input.persona,
            tools,
            draft: None,
            refinements: None,
            status: RunStatus::Idle,
            usage: RunUsage::default(),
        }
    }

    fn advance(&mut self, next: RunStatus) {
        debug_assert!(
            self.status.can_advance_to(next),
            "invalid transition {:?} -> {:?}",
            self.status,
            next
        );
        tracing::debug!(run_id = %self.id, from = ?self.status, to = ?next, "run transition");
        self.status = next;
    }

    /// Stage whose calls are outstanding while the run is in its current status.
    fn stage_in_flight(&self) -> Stage {
        match self.status {
            RunStatus::Refining => Stage::Refine,
            RunStatus::Synthesizing => Stage::Synthesize,
            _ if self.topology.is_single_call() => Stage::Single,
            _ => Stage::Draft,
        }
    }

    fn fail(&mut self) {
        if !self.status.is_terminal() {
            self.advance(RunStatus::Failed);
        }
        self.draft = None;
        self.refinements = None;
    }

    fn finish(&mut self, resp: CompletionResponse, draft_fallback: bool) -> FinalResult {
        self.advance(RunStatus::Done);
        FinalResult {
            parts: resp.parts,
            citations: resp.citations,
            draft_fallback,
            usage: self.usage,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct PipelineOrchestrator {
    executor: StageExecutor,
    config: PipelineConfig,
    table: TopologyTable,
    observer: Option<Arc<dyn ProgressObserver>>,
    trace: Option<Arc<dyn TraceSink>>,
}

impl PipelineOrchestrator {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        config: PipelineConfig,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let table = config.topology_table()?;
        let executor =
            StageExecutor::new(client).with_max_concurrency(config.max_refine_concurrency);
        Ok(Self {
            executor,
            config,
            table,
            observer: None,
            trace: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn topology_table(&self) -> &TopologyTable {
        &self.table
    }

    /// Answer one submission.
    ///
    /// Fails on the first stage error, on cancellation, or when the configured
    /// run timeout elapses. No partial answer is returned on failure.
    pub async fn run(
        &self,
        input: RunInput,
        cancel: &CancellationToken,
    ) -> Result<FinalResult, PipelineError> {
        let topology = self.table.resolve(input.mode)?;
        if input.user_parts.is_empty() {
            return Err(PipelineError::InvalidInput(
                "user turn must contain at least one part".into(),
            ));
        }

        let mut run = PipelineRun::new(topology, input);
        let started = Instant::now();

        let outcome = match self.config.run_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.drive(&mut run, cancel))
                .await
                .map_err(|_| limit),
            None => Ok(self.drive(&mut run, cancel).await),
        };
        let outcome = outcome.unwrap_or_else(|limit| {
            Err(PipelineError::TimedOut {
                stage: run.stage_in_flight(),
                limit,
            })
        });

        match outcome {
            Ok(result) => {
                tracing::info!(
                    run_id = %run.id,
                    mode = %run.mode,
                    calls = result.usage.calls,
                    cost_nanodollars = result.usage.cost_nanodollars,
                    draft_fallback = result.draft_fallback,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "pipeline run complete"
                );
                Ok(result)
            }
            Err(err) => {
                tracing::warn!(
                    run_id = %run.id,
                    mode = %run.mode,
                    status = ?run.status,
                    error = %err,
                    "pipeline run failed"
                );
                run.fail();
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> Result<FinalResult, PipelineError> {
        if run.topology.is_single_call() {
            run.advance(RunStatus::Drafting);
            self.emit(run, Stage::Single, progress::single_label()).await;
            let req = self.build_request(
                run,
                Stage::Single,
                1,
                run.history.clone(),
                run.user_parts.clone(),
            );
            let resp = self.call(run, Stage::Single, req, cancel).await?;
            return Ok(run.finish(resp, false));
        }

        // --- Draft ---
        run.advance(RunStatus::Drafting);
        self.emit(run, Stage::Draft, progress::draft_label()).await;
        let req = self.build_request(
            run,
            Stage::Draft,
            1,
            run.history.clone(),
            run.user_parts.clone(),
        );
        let draft = self.call(run, Stage::Draft, req, cancel).await?;

        if draft.is_empty() {
            tracing::debug!(run_id = %run.id, "draft returned no content; answering with it");
            return Ok(run.finish(draft, true));
        }

        // --- Refine ---
        let refiners = run.topology.refine_agents;
        let mut refine_history = run.history.clone();
        refine_history.push(Turn::user(run.user_parts.clone()));
        refine_history.push(Turn::model(draft.parts.clone()));
        run.draft = Some(draft);

        run.advance(RunStatus::Refining);
        self.emit(run, Stage::Refine, progress::refine_label(refiners)).await;
        let requests: Vec<CompletionRequest> = (0..refiners as usize)
            .map(|i| {
                let agent = i + 2;
                self.build_request(run, Stage::Refine, agent, refine_history.clone(), Vec::new())
            })
            .collect();
        let refinements = self.refine(run, requests, cancel).await?;
        let aggregated = aggregate(&refinements);
        run.refinements = Some(refinements);

        // --- Synthesize ---
        run.advance(RunStatus::Synthesizing);
        self.emit(run, Stage::Synthesize, progress::synthesize_label()).await;
        let mut new_turn = run.user_parts.clone();
        new_turn.extend(aggregated);
        let synthesizer = refiners as usize + 2;
        let req = self.build_request(
            run,
            Stage::Synthesize,
            synthesizer,
            run.history.clone(),
            new_turn,
        );
        let synthesis = self.call(run, Stage::Synthesize, req, cancel).await?;

        Ok(run.finish(synthesis, false))
    }

    fn build_request(
        &self,
        run: &PipelineRun,
        stage: Stage,
        agent: usize,
        prior_turns: Vec<Turn>,
        new_turn: Vec<Part>,
    ) -> CompletionRequest {
        let instruction =
            compose_system_instruction(stage, &run.persona, self.config.persona_scope);
        let model = self.config.models.model_for(run.topology.model);
        let mut req = CompletionRequest::new(
            model,
            prior_turns,
            new_turn,
            instruction,
            Attribution::new(stage.as_str()).agent(agent).run(run.id),
        )
        .tools(run.tools);
        if let Some(t) = self.config.temperature {
            req = req.temperature(t);
        }
        if let Some(max) = self.config.max_output_tokens {
            req = req.max_output_tokens(max);
        }
        req
    }

    async fn call(
        &self,
        run: &mut PipelineRun,
        stage: Stage,
        req: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, PipelineError> {
        let model = req.model.clone();
        let agent = req.attribution.agent;
        let started = Instant::now();
        match self.executor.run_one(req, cancel).await {
            Ok(resp) => {
                run.usage.add(&resp);
                self.record_trace(run, stage, agent, &model, Ok(&resp), started.elapsed())?;
                Ok(resp)
            }
            Err(StageError::Provider { source, .. }) => {
                self.record_trace(
                    run,
                    stage,
                    agent,
                    &model,
                    Err(source.to_string()),
                    started.elapsed(),
                )?;
                Err(PipelineError::Stage {
                    stage,
                    agent,
                    source,
                })
            }
            Err(StageError::Cancelled) => {
                self.record_trace(
                    run,
                    stage,
                    agent,
                    &model,
                    Err(CANCELLED.to_string()),
                    started.elapsed(),
                )?;
                Err(PipelineError::Cancelled { stage })
            }
        }
    }

    async fn refine(
        &self,
        run: &mut PipelineRun,
        requests: Vec<CompletionRequest>,
        cancel: &CancellationToken,
    ) -> Result<StageResult, PipelineError> {
        let model = requests
            .first()
            .map(|r| r.model.clone())
            .unwrap_or_default();
        let agents: Vec<usize> = requests.iter().map(|r| r.attribution.agent).collect();
        let started = Instant::now();
        match self.executor.run_parallel(requests, cancel).await {
            Ok(results) => {
                for (agent, resp) in agents.iter().zip(&results) {
                    run.usage.add(resp);
                    self.record_trace(run, Stage::Refine, *agent, &model, Ok(resp), resp.latency)?;
                }
                Ok(results)
            }
            Err(StageError::Provider { index, source }) => {
                let agent = agents.get(index).copied().unwrap_or(index + 2);
                self.record_trace(
                    run,
                    Stage::Refine,
                    agent,
                    &model,
                    Err(source.to_string()),
                    started.elapsed(),
                )?;
                Err(PipelineError::Stage {
                    stage: Stage::Refine,
                    agent,
                    source,
                })
            }
            Err(StageError::Cancelled) => {
                // Finished siblings are discarded with the rest, so every refiner gets a row.
                for agent in &agents {
                    self.record_trace(
                        run,
                        Stage::Refine,
                        *agent,
                        &model,
                        Err(CANCELLED.to_string()),
                        started.elapsed(),
                    )?;
                }
                Err(PipelineError::Cancelled {
                    stage: Stage::Refine,
                })
            }
        }
    }

    async fn emit(&self, run: &PipelineRun, stage: Stage, label: String) {
        let Some(observer) = &self.observer else {
            return;
        };
        let event = ProgressEvent {
            run_id: run.id,
            stage,
            status: run.status,
            label,
        };
        if let Err(e) = observer.on_progress(event).await {
            tracing::warn!(run_id = %run.id, error = %e, "progress observer failed");
        }
    }

    fn record_trace(
        &self,
        run: &PipelineRun,
        stage: Stage,
        agent: usize,
        model: &str,
        outcome: Result<&CompletionResponse, String>,
        latency: Duration,
    ) -> Result<(), TraceError> {
        let Some(trace) = &self.trace else {
            return Ok(());
        };
        let row = StageTrace::new(run.id, run.mode, stage, agent, model, latency);
        trace.record(match outcome {
            Ok(resp) => row.answered(resp),
            Err(reason) => row.failed(reason),
        })
    }
}
