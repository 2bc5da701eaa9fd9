#![forbid(unsafe_code)]

//! # refinery-harness
//!
//! Better answers from one model by letting it argue with itself.
//!
//! A query is answered by a small pipeline of completion calls instead of one:
//! a draft, several independent refinements of that draft run concurrently,
//! and a synthesis pass that merges the refinements into the final answer.
//! The quality mode picks the shape (model tier, refiner count, tools); cheap
//! modes skip the pipeline and make one direct call.

pub mod config;
pub mod gateway;
pub mod pipeline;
pub mod prompts;
pub mod topology;

pub use config::{ConfigurationError, ModelIds, PipelineConfig};
pub use gateway::{
    Attribution, CompletionClient, CompletionRequest, CompletionResponse, Part, ProviderError,
    ProviderGateway, Turn, UsageSink,
};
pub use pipeline::{
    ChannelProgress, FinalResult, JsonlTraceSink, PipelineError, PipelineOrchestrator, RunInput,
    Stage, TraceSink, TraceWorker,
};
pub use prompts::PersonaScope;
pub use topology::{Mode, PipelineTopology, TopologyTable};
