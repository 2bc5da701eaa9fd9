use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use refinery_harness::gateway::{
    parts_text, CompletionClient, CompletionRequest, CompletionResponse, Part, ProviderError, Turn,
};
use refinery_harness::pipeline::{
    ChannelProgress, JsonlTraceSink, PipelineError, PipelineOrchestrator, RunInput, RunStatus,
    Stage, StageTrace,
};
use refinery_harness::prompts::{DRAFT_INSTRUCTION, REFINE_INSTRUCTION, SYNTHESIZE_INSTRUCTION};
use refinery_harness::topology::TopologyOverride;
use refinery_harness::{Mode, PersonaScope, PipelineConfig};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum Reply {
    Text(&'static str),
    Delayed(u64, &'static str),
    Empty,
    Fail,
    Hang,
}

/// Answers by the stage and agent in each request's attribution. Refiner
/// replies are indexed from agent 2. Requests are logged in arrival order.
struct ScriptedClient {
    single: Reply,
    draft: Reply,
    refiners: Vec<Reply>,
    synthesize: Reply,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedClient {
    fn new() -> Self {
        Self {
            single: Reply::Text("single"),
            draft: Reply::Text("D"),
            refiners: vec![Reply::Text("R1"), Reply::Text("R2")],
            synthesize: Reply::Text("S"),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn requests_for(&self, stage: Stage) -> Vec<CompletionRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.attribution.stage == stage.as_str())
            .collect()
    }

    fn call_order(&self) -> Vec<(&'static str, usize)> {
        self.requests()
            .iter()
            .map(|r| (r.attribution.stage, r.attribution.agent))
            .collect()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let reply = match req.attribution.stage {
            "single" => self.single,
            "draft" => self.draft,
            "refine" => self
                .refiners
                .get(req.attribution.agent - 2)
                .copied()
                .unwrap_or(Reply::Text("R")),
            "synthesize" => self.synthesize,
            other => panic!("unexpected stage {other}"),
        };
        self.requests.lock().unwrap().push(req);

        let text = match reply {
            Reply::Text(text) => text,
            Reply::Delayed(ms, text) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                text
            }
            Reply::Empty => return Ok(CompletionResponse::empty()),
            Reply::Fail => return Err(ProviderError::service("stub", "boom", false)),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                "late"
            }
        };

        let mut resp = CompletionResponse::from_text(text);
        resp.input_tokens = 10;
        resp.output_tokens = 5;
        resp.cost_nanodollars = 100;
        Ok(resp)
    }
}

fn orchestrator(client: &Arc<ScriptedClient>) -> PipelineOrchestrator {
    orchestrator_with(client, PipelineConfig::default())
}

fn orchestrator_with(client: &Arc<ScriptedClient>, config: PipelineConfig) -> PipelineOrchestrator {
    PipelineOrchestrator::new(client.clone(), config).unwrap()
}

fn history() -> Vec<Turn> {
    vec![Turn::user_text("hello"), Turn::model_text("hi there")]
}

fn cancel_after(cancel: &CancellationToken, ms: u64) {
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        trigger.cancel();
    });
}

fn flash_input() -> RunInput {
    RunInput::text(Mode::Flash, "What is X?")
        .history(history())
        .persona("You are terse.")
}

#[tokio::test]
async fn flash_runs_draft_two_refiners_and_synthesis() {
    let client = Arc::new(ScriptedClient::new());
    let result = orchestrator(&client)
        .run(flash_input(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.text(), "S");
    assert!(!result.draft_fallback);
    assert_eq!(result.usage.calls, 4);
    assert_eq!(result.usage.input_tokens, 40);
    assert_eq!(result.usage.output_tokens, 20);
    assert_eq!(result.usage.cost_nanodollars, 400);

    let requests = client.requests();
    assert_eq!(requests.len(), 4);
    let run_id = requests[0].attribution.run_id;
    assert!(run_id.is_some());
    assert!(requests.iter().all(|r| r.attribution.run_id == run_id));
    assert!(requests.iter().all(|r| r.model == "gemini-2.5-flash"));
    assert!(requests.iter().all(|r| r.tool_config.enable_search));
    assert!(requests.iter().all(|r| !r.tool_config.disable_reasoning));

    let draft = &client.requests_for(Stage::Draft)[0];
    assert_eq!(draft.prior_turns, history());
    assert_eq!(draft.new_turn, vec![Part::text("What is X?")]);
    assert_eq!(
        draft.system_instruction,
        format!("You are terse.\n\n{DRAFT_INSTRUCTION}")
    );

    let refiners = client.requests_for(Stage::Refine);
    assert_eq!(refiners.len(), 2);
    let mut expected_turns = history();
    expected_turns.push(Turn::user_text("What is X?"));
    expected_turns.push(Turn::model_text("D"));
    for refine in &refiners {
        assert_eq!(refine.prior_turns, expected_turns);
        assert!(refine.new_turn.is_empty());
        assert!(refine.system_instruction.ends_with(REFINE_INSTRUCTION));
    }

    let synth = &client.requests_for(Stage::Synthesize)[0];
    assert_eq!(synth.prior_turns, history());
    assert_eq!(
        parts_text(&synth.new_turn, "\n"),
        "What is X?\n--- Refined Response 1 ---\nR1\n--- Refined Response 2 ---\nR2"
    );
    assert!(synth.system_instruction.ends_with(SYNTHESIZE_INSTRUCTION));
}

#[tokio::test]
async fn quick_mode_is_one_direct_call_with_persona_only() {
    let client = Arc::new(ScriptedClient::new());
    let result = orchestrator(&client)
        .run(
            RunInput::text(Mode::Quick, "hi").persona("  Be kind.  "),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.text(), "single");
    assert_eq!(result.usage.calls, 1);

    let requests = client.requests();
    assert_eq!(requests.len(), 1);
    let req = &requests[0];
    assert_eq!((req.attribution.stage, req.attribution.agent), ("single", 1));
    assert_eq!(req.system_instruction, "Be kind.");
    assert_eq!(req.model, "gemini-2.5-flash");
    assert!(req.tool_config.disable_reasoning);
    assert!(!req.tool_config.enable_search);
}

#[tokio::test]
async fn caller_search_flag_is_merged_with_mode_flags() {
    let client = Arc::new(ScriptedClient::new());
    orchestrator(&client)
        .run(
            RunInput::text(Mode::Quick, "news today?").search(true),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let req = &client.requests()[0];
    assert!(req.tool_config.enable_search);
    assert!(req.tool_config.disable_reasoning);
}

#[tokio::test]
async fn image_mode_is_single_call_on_image_model() {
    let client = Arc::new(ScriptedClient::new());
    let input = RunInput::new(
        Mode::ImageGen,
        vec![Part::text("draw a cat"), Part::inline("image/png", "AAAA")],
    );
    orchestrator(&client)
        .run(input, &CancellationToken::new())
        .await
        .unwrap();

    let requests = client.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].model, "gemini-2.5-flash-image");
    assert_eq!(requests[0].new_turn[1], Part::inline("image/png", "AAAA"));
}

#[tokio::test]
async fn heavy_aggregates_refinements_in_dispatch_order() {
    let mut script = ScriptedClient::new();
    script.refiners = vec![
        Reply::Delayed(80, "R1"),
        Reply::Delayed(0, "R2"),
        Reply::Delayed(40, "R3"),
        Reply::Delayed(10, "R4"),
    ];
    let client = Arc::new(script);

    let result = orchestrator(&client)
        .run(
            RunInput::text(Mode::Heavy, "Q"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.usage.calls, 6);

    let requests = client.requests();
    assert!(requests.iter().all(|r| r.model == "gemini-2.5-pro"));
    assert_eq!(client.requests_for(Stage::Refine).len(), 4);

    let synth = &client.requests_for(Stage::Synthesize)[0];
    assert_eq!(
        parts_text(&synth.new_turn, "\n"),
        "Q\n--- Refined Response 1 ---\nR1\n--- Refined Response 2 ---\nR2\n\
         --- Refined Response 3 ---\nR3\n--- Refined Response 4 ---\nR4"
    );
}

#[tokio::test]
async fn empty_draft_is_returned_without_refinement() {
    let mut script = ScriptedClient::new();
    script.draft = Reply::Empty;
    let client = Arc::new(script);

    let result = orchestrator(&client)
        .run(flash_input(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.parts.is_empty());
    assert!(result.draft_fallback);
    assert_eq!(result.usage.calls, 1);
    assert_eq!(client.requests().len(), 1);
}

#[tokio::test]
async fn empty_refinement_still_gets_a_header() {
    let mut script = ScriptedClient::new();
    script.refiners = vec![Reply::Empty, Reply::Text("R2")];
    let client = Arc::new(script);

    orchestrator(&client)
        .run(flash_input(), &CancellationToken::new())
        .await
        .unwrap();

    let synth = &client.requests_for(Stage::Synthesize)[0];
    assert_eq!(
        parts_text(&synth.new_turn, "\n"),
        "What is X?\n--- Refined Response 1 ---\n--- Refined Response 2 ---\nR2"
    );
}

#[tokio::test]
async fn refiner_failure_fails_the_run_before_synthesis() {
    let mut script = ScriptedClient::new();
    script.refiners = vec![Reply::Delayed(50, "R1"), Reply::Fail];
    let client = Arc::new(script);

    let err = orchestrator(&client)
        .run(flash_input(), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        PipelineError::Stage { stage, agent, .. } => {
            assert_eq!(stage, Stage::Refine);
            assert_eq!(agent, 3);
        }
        other => panic!("expected refine failure, got {other:?}"),
    }
    assert!(client.requests_for(Stage::Synthesize).is_empty());
}

#[tokio::test]
async fn draft_failure_issues_no_further_calls() {
    let mut script = ScriptedClient::new();
    script.draft = Reply::Fail;
    let client = Arc::new(script);

    let err = orchestrator(&client)
        .run(flash_input(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Stage {
            stage: Stage::Draft,
            agent: 1,
            ..
        }
    ));
    assert_eq!(client.requests().len(), 1);
}

#[tokio::test]
async fn synthesis_failure_names_the_last_agent() {
    let mut script = ScriptedClient::new();
    script.synthesize = Reply::Fail;
    let client = Arc::new(script);

    let err = orchestrator(&client)
        .run(flash_input(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Synthesize));
    assert!(matches!(err, PipelineError::Stage { agent: 4, .. }));
}

#[tokio::test]
async fn cancellation_during_refinement_abandons_the_run() {
    let mut script = ScriptedClient::new();
    script.refiners = vec![Reply::Hang, Reply::Hang];
    let client = Arc::new(script);
    let orchestrator = orchestrator(&client);

    let cancel = CancellationToken::new();
    cancel_after(&cancel, 50);

    let started = Instant::now();
    let err = orchestrator.run(flash_input(), &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Cancelled {
            stage: Stage::Refine
        }
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(client.requests_for(Stage::Synthesize).is_empty());
}

#[tokio::test]
async fn cancellation_during_draft_stops_before_refinement() {
    let mut script = ScriptedClient::new();
    script.draft = Reply::Hang;
    let client = Arc::new(script);

    let cancel = CancellationToken::new();
    cancel_after(&cancel, 50);
    let err = orchestrator(&client)
        .run(flash_input(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Cancelled {
            stage: Stage::Draft
        }
    ));
    assert_eq!(client.call_order(), vec![("draft", 1)]);
}

#[tokio::test]
async fn cancellation_during_synthesis_discards_the_refinements() {
    let mut script = ScriptedClient::new();
    script.synthesize = Reply::Hang;
    let client = Arc::new(script);

    let cancel = CancellationToken::new();
    cancel_after(&cancel, 50);
    let err = orchestrator(&client)
        .run(flash_input(), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Synthesize));
    assert!(matches!(err, PipelineError::Cancelled { .. }));
    assert_eq!(client.requests_for(Stage::Refine).len(), 2);
    assert_eq!(client.requests_for(Stage::Synthesize).len(), 1);
}

#[tokio::test]
async fn already_cancelled_token_issues_no_calls() {
    let client = Arc::new(ScriptedClient::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = orchestrator(&client)
        .run(flash_input(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Draft));
    assert!(client.requests().is_empty());
}

#[tokio::test]
async fn run_timeout_aborts_a_stalled_run() {
    let mut script = ScriptedClient::new();
    script.draft = Reply::Hang;
    let client = Arc::new(script);
    let config = PipelineConfig {
        run_timeout_secs: Some(1),
        ..Default::default()
    };

    let err = orchestrator_with(&client, config)
        .run(flash_input(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::TimedOut {
            stage: Stage::Draft,
            limit
        } if limit == Duration::from_secs(1)
    ));
    assert_eq!(client.requests().len(), 1);
}

#[tokio::test]
async fn run_timeout_names_the_refine_stage_when_refiners_stall() {
    let mut script = ScriptedClient::new();
    script.refiners = vec![Reply::Text("R1"), Reply::Hang];
    let client = Arc::new(script);
    let config = PipelineConfig {
        run_timeout_secs: Some(1),
        ..Default::default()
    };

    let err = orchestrator_with(&client, config)
        .run(flash_input(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Refine));
    assert!(matches!(err, PipelineError::TimedOut { .. }));
    assert!(client.requests_for(Stage::Synthesize).is_empty());
}

#[tokio::test]
async fn run_timeout_on_single_call_mode_names_the_single_stage() {
    let mut script = ScriptedClient::new();
    script.single = Reply::Hang;
    let client = Arc::new(script);
    let config = PipelineConfig {
        run_timeout_secs: Some(1),
        ..Default::default()
    };

    let err = orchestrator_with(&client, config)
        .run(RunInput::text(Mode::Quick, "hi"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Single));
}

#[tokio::test]
async fn identical_inputs_produce_identical_requests_and_results() {
    let first = Arc::new(ScriptedClient::new());
    let second = Arc::new(ScriptedClient::new());

    let a = orchestrator(&first)
        .run(flash_input(), &CancellationToken::new())
        .await
        .unwrap();
    let b = orchestrator(&second)
        .run(flash_input(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(a.parts, b.parts);
    assert_eq!(a.usage, b.usage);

    let shape = |client: &ScriptedClient| {
        let mut calls: Vec<_> = client
            .requests()
            .into_iter()
            .map(|r| {
                (
                    r.attribution.stage,
                    r.attribution.agent,
                    r.model,
                    r.system_instruction,
                    r.prior_turns,
                    r.new_turn,
                    r.tool_config.enable_search,
                )
            })
            .collect();
        // Refiners may arrive in any order; agent numbers pin them down.
        calls.sort_by_key(|c| c.1);
        calls
    };
    let calls = shape(first.as_ref());
    assert_eq!(calls.len(), 4);
    assert_eq!(calls, shape(second.as_ref()));
}

#[tokio::test]
async fn calls_follow_draft_then_refiners_then_synthesis() {
    let mut script = ScriptedClient::new();
    script.refiners = vec![
        Reply::Delayed(30, "R1"),
        Reply::Delayed(0, "R2"),
        Reply::Delayed(15, "R3"),
        Reply::Delayed(5, "R4"),
    ];
    let client = Arc::new(script);

    orchestrator(&client)
        .run(RunInput::text(Mode::Heavy, "Q"), &CancellationToken::new())
        .await
        .unwrap();

    let order = client.call_order();
    assert_eq!(order.len(), 6);
    assert_eq!(order[0], ("draft", 1));
    assert_eq!(order[5], ("synthesize", 6));

    let mut refiners: Vec<(&str, usize)> = order[1..5].to_vec();
    assert!(refiners.iter().all(|(stage, _)| *stage == "refine"));
    refiners.sort();
    assert_eq!(
        refiners,
        vec![("refine", 2), ("refine", 3), ("refine", 4), ("refine", 5)]
    );
}

#[tokio::test]
async fn progress_events_follow_stage_transitions() {
    let client = Arc::new(ScriptedClient::new());
    let (progress, mut events) = ChannelProgress::channel();
    let orchestrator = orchestrator(&client).with_observer(Arc::new(progress));

    orchestrator
        .run(flash_input(), &CancellationToken::new())
        .await
        .unwrap();
    drop(orchestrator);

    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        seen.push(event);
    }

    let labels: Vec<&str> = seen.iter().map(|e| e.label.as_str()).collect();
    assert_eq!(
        labels,
        vec![
            "Agent 1: Initial Draft...",
            "Agents 2-3: Refining...",
            "Synthesizing Final Answer..."
        ]
    );
    let statuses: Vec<RunStatus> = seen.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            RunStatus::Drafting,
            RunStatus::Refining,
            RunStatus::Synthesizing
        ]
    );
    assert!(seen.iter().all(|e| e.run_id == seen[0].run_id));
}

#[tokio::test]
async fn dropped_progress_receiver_does_not_fail_the_run() {
    let client = Arc::new(ScriptedClient::new());
    let (progress, events) = ChannelProgress::channel();
    drop(events);

    let result = orchestrator(&client)
        .with_observer(Arc::new(progress))
        .run(flash_input(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.text(), "S");
}

#[tokio::test]
async fn synthesis_only_persona_scope_keeps_persona_out_of_intermediate_stages() {
    let client = Arc::new(ScriptedClient::new());
    let config = PipelineConfig {
        persona_scope: PersonaScope::SynthesisOnly,
        ..Default::default()
    };

    orchestrator_with(&client, config)
        .run(flash_input(), &CancellationToken::new())
        .await
        .unwrap();

    let draft = &client.requests_for(Stage::Draft)[0];
    assert_eq!(draft.system_instruction, DRAFT_INSTRUCTION);
    let refine = &client.requests_for(Stage::Refine)[0];
    assert_eq!(refine.system_instruction, REFINE_INSTRUCTION);
    let synth = &client.requests_for(Stage::Synthesize)[0];
    assert!(synth.system_instruction.starts_with("You are terse."));
}

#[tokio::test]
async fn topology_override_changes_refiner_count_and_sampling() {
    let client = Arc::new(ScriptedClient::new());
    let mut topology = BTreeMap::new();
    topology.insert(
        Mode::Flash,
        TopologyOverride {
            refine_agents: Some(4),
            ..Default::default()
        },
    );
    let config = PipelineConfig {
        topology,
        temperature: Some(0.4),
        max_output_tokens: Some(2048),
        max_refine_concurrency: Some(2),
        ..Default::default()
    };

    let result = orchestrator_with(&client, config)
        .run(flash_input(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.usage.calls, 6);
    assert_eq!(client.requests_for(Stage::Refine).len(), 4);
    assert!(client
        .requests()
        .iter()
        .all(|r| r.temperature == Some(0.4) && r.max_output_tokens == Some(2048)));
}

#[tokio::test]
async fn empty_user_turn_is_rejected_before_any_call() {
    let client = Arc::new(ScriptedClient::new());
    let err = orchestrator(&client)
        .run(RunInput::new(Mode::Flash, Vec::new()), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::InvalidInput(_)));
    assert!(client.requests().is_empty());
}

#[tokio::test]
async fn trace_sink_records_every_call_with_agent_numbers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");
    let (sink, worker) = JsonlTraceSink::create(&path).unwrap();

    let client = Arc::new(ScriptedClient::new());
    let orchestrator = orchestrator(&client).with_trace(Arc::new(sink));
    orchestrator
        .run(flash_input(), &CancellationToken::new())
        .await
        .unwrap();
    drop(orchestrator);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<StageTrace> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 4);

    let shape: Vec<(Stage, usize)> = rows.iter().map(|r| (r.stage, r.agent)).collect();
    assert_eq!(
        shape,
        vec![
            (Stage::Draft, 1),
            (Stage::Refine, 2),
            (Stage::Refine, 3),
            (Stage::Synthesize, 4)
        ]
    );
    assert!(rows.iter().all(|r| r.mode == Mode::Flash));
    assert!(rows.iter().all(|r| r.error.is_none() && r.parts == 1));
    assert!(rows.iter().all(|r| r.run_id == rows[0].run_id));
}

#[tokio::test]
async fn cancelled_refinement_leaves_a_trace_row_per_refiner() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");
    let (sink, worker) = JsonlTraceSink::create(&path).unwrap();

    let mut script = ScriptedClient::new();
    script.refiners = vec![Reply::Hang, Reply::Hang];
    let client = Arc::new(script);
    let orchestrator = orchestrator(&client).with_trace(Arc::new(sink));

    let cancel = CancellationToken::new();
    cancel_after(&cancel, 50);
    let err = orchestrator.run(flash_input(), &cancel).await.unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Refine));
    drop(orchestrator);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<StageTrace> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let shape: Vec<(Stage, usize, Option<&str>)> = rows
        .iter()
        .map(|r| (r.stage, r.agent, r.error.as_deref()))
        .collect();
    assert_eq!(
        shape,
        vec![
            (Stage::Draft, 1, None),
            (Stage::Refine, 2, Some("cancelled")),
            (Stage::Refine, 3, Some("cancelled"))
        ]
    );
}

#[tokio::test]
async fn cancelled_single_call_is_traced() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");
    let (sink, worker) = JsonlTraceSink::create(&path).unwrap();

    let mut script = ScriptedClient::new();
    script.single = Reply::Hang;
    let client = Arc::new(script);
    let orchestrator = orchestrator(&client).with_trace(Arc::new(sink));

    let cancel = CancellationToken::new();
    cancel_after(&cancel, 50);
    let err = orchestrator
        .run(RunInput::text(Mode::Quick, "hi"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Cancelled {
            stage: Stage::Single
        }
    ));
    drop(orchestrator);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let row: StageTrace = serde_json::from_str(raw.trim_end()).unwrap();
    assert_eq!((row.stage, row.agent), (Stage::Single, 1));
    assert_eq!(row.error.as_deref(), Some("cancelled"));
    assert_eq!(row.mode, Mode::Quick);
}
