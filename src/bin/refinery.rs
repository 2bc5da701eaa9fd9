#![forbid(unsafe_code)]

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use refinery_harness::gateway::{
    CompletionClient, NoopUsageSink, Part, ProviderGateway, StderrUsageSink,
};
use refinery_harness::pipeline::{
    ChannelProgress, FinalResult, JsonlTraceSink, PipelineOrchestrator, RunInput, TraceSink,
};
use refinery_harness::{Mode, PipelineConfig};

#[derive(Parser)]
#[command(name = "refinery", version, about = "Draft, refine and synthesize answers")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer one prompt through the pipeline for the chosen mode
    Ask {
        /// Quality mode: quick, flash, pro, heavy, image_gen
        #[arg(long)]
        mode: Option<String>,

        /// Inline prompt text
        #[arg(long, group = "input")]
        prompt: Option<String>,

        /// Read prompt from file
        #[arg(long, group = "input")]
        prompt_file: Option<PathBuf>,

        /// Path to a run input JSON (mode, history, user_parts, persona)
        #[arg(long, group = "input")]
        request: Option<PathBuf>,

        /// Persona / system instruction
        #[arg(long)]
        persona: Option<String>,

        /// Attach the search tool regardless of mode
        #[arg(long)]
        search: bool,

        /// Pipeline config JSON
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write the final result as JSON
        #[arg(long)]
        out: Option<PathBuf>,

        /// JSONL trace of every completion call
        #[arg(long)]
        trace: Option<PathBuf>,

        /// Abort the run after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Print one JSON usage line per provider call to stderr
        #[arg(long)]
        usage: bool,
    },
    /// List quality modes and their pipeline shapes
    Modes {
        /// Pipeline config JSON
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("refinery_harness=info"),
        1 => EnvFilter::new("refinery_harness=debug"),
        _ => EnvFilter::new("refinery_harness=trace"),
    });

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(io::stderr),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Modes { config } => {
            let config = load_config(config.as_ref())?;
            let table = config.topology_table()?;
            for (mode, topology) in table.iter() {
                let shape = if topology.is_single_call() {
                    "single call".to_string()
                } else {
                    format!(
                        "draft + {} refiners + synthesis",
                        topology.refine_agents
                    )
                };
                println!(
                    "{:<10} {:<24} {:<32} search={} reasoning={}",
                    mode.as_str(),
                    config.models.model_for(topology.model),
                    shape,
                    topology.extra.enable_search_tool,
                    if topology.extra.disable_reasoning { "off" } else { "on" },
                );
            }
        }
        Commands::Ask {
            mode,
            prompt,
            prompt_file,
            request,
            persona,
            search,
            config,
            out,
            trace,
            timeout_secs,
            usage,
        } => {
            let mode: Option<Mode> = mode.as_deref().map(str::parse::<Mode>).transpose()?;

            let mut input: RunInput = if let Some(path) = request {
                let mut input: RunInput = read_json(&path)?;
                if let Some(mode) = mode {
                    input.mode = mode;
                }
                input
            } else {
                let text = if let Some(p) = prompt {
                    p
                } else if let Some(path) = prompt_file {
                    std::fs::read_to_string(&path)?
                } else {
                    return Err("ask requires --prompt, --prompt-file, or --request".into());
                };
                RunInput::text(mode.unwrap_or(Mode::Flash), text)
            };
            if let Some(persona) = persona {
                input.persona = persona;
            }
            input.enable_search |= search;

            let mut config = load_config(config.as_ref())?;
            if timeout_secs.is_some() {
                config.run_timeout_secs = timeout_secs;
            }

            let client: Arc<dyn CompletionClient> = if usage {
                Arc::new(ProviderGateway::from_env(Arc::new(StderrUsageSink))?)
            } else {
                Arc::new(ProviderGateway::from_env(Arc::new(NoopUsageSink))?)
            };

            let (trace_sink, trace_worker) = match trace {
                Some(path) => {
                    let (sink, worker) = JsonlTraceSink::create(path)?;
                    (Some(Arc::new(sink)), Some(worker))
                }
                None => (None, None),
            };

            let (progress, mut events) = ChannelProgress::channel();
            let printer = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    eprintln!("[refinery] {}", event.label);
                }
            });

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("[refinery] interrupted, cancelling run...");
                    interrupt.cancel();
                }
            });

            let mut orchestrator =
                PipelineOrchestrator::new(client, config)?.with_observer(Arc::new(progress));
            if let Some(sink) = &trace_sink {
                orchestrator = orchestrator.with_trace(sink.clone() as Arc<dyn TraceSink>);
            }

            let result = orchestrator.run(input, &cancel).await;

            drop(orchestrator);
            drop(trace_sink);
            if let Some(worker) = trace_worker {
                worker.join()?;
            }
            let _ = printer.await;

            let result = result?;
            print_result(&result);

            if let Some(out) = out {
                write_json(&out, &result)?;
                eprintln!("[refinery] result written to {}", out.display());
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(PipelineConfig::from_path(path)?),
        None => Ok(PipelineConfig::default()),
    }
}

fn print_result(result: &FinalResult) {
    for part in &result.parts {
        match part {
            Part::Text { text } => print!("{text}"),
            Part::InlineData { inline_data } => eprintln!(
                "[refinery] {} attachment ({} bytes base64); use --out to keep it",
                inline_data.mime_type,
                inline_data.data.len()
            ),
        }
    }
    println!();

    if !result.citations.is_empty() {
        println!("\nSources:");
        for (i, citation) in result.citations.iter().enumerate() {
            println!("  [{}] {} <{}>", i + 1, citation.title, citation.uri);
        }
    }

    if result.draft_fallback {
        eprintln!("[refinery] draft was empty; refinement skipped");
    }
    eprintln!(
        "[refinery] {} calls, {} in / {} out tokens, ${:.6}",
        result.usage.calls,
        result.usage.input_tokens,
        result.usage.output_tokens,
        result.usage.cost_nanodollars as f64 / 1e9
    );
}

fn read_json<T: serde::de::DeserializeOwned>(
    path: &PathBuf,
) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: serde::Serialize>(path: &PathBuf, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}
