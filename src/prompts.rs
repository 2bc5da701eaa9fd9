//! Stage instructions for the draft / refine / synthesize agents.
//!
//! Provider-agnostic. The caller's persona instruction is composed with the
//! stage instruction according to [`PersonaScope`].

use serde::{Deserialize, Serialize};

use crate::pipeline::Stage;

pub const DRAFT_INSTRUCTION: &str = "\
You are the first agent in a team that answers the user together. \
Write a complete, accurate first answer to the user's latest message. \
Be direct and thorough. Other agents will review and improve your answer, \
so favor substance over polish.";

pub const REFINE_INSTRUCTION: &str = "\
You are a refinement agent. The conversation ends with a draft answer to the \
user's latest message. Review that draft critically: correct factual and \
logical errors, fill in anything missing, and improve structure and clarity. \
Reply with a complete improved answer, not a list of comments about the draft.";

pub const SYNTHESIZE_INSTRUCTION: &str = "\
You are the final agent in a team that answers the user together. The user's \
message is followed by several independently refined answers, each introduced \
by a '--- Refined Response N ---' header. Merge them into one final answer: \
keep the most accurate and useful content from each, and resolve any \
disagreement in favor of the best-supported claim. Answer the user directly \
and do not mention the refined responses or how the answer was produced.";

/// Which stages see the caller's persona instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaScope {
    /// Persona is prepended to the draft, refine and synthesize instructions.
    #[default]
    EveryStage,
    /// Persona only shapes the synthesized answer the user sees.
    SynthesisOnly,
}

/// Fixed instruction for `stage`, or `None` for the single-call path.
pub fn stage_instruction(stage: Stage) -> Option<&'static str> {
    match stage {
        Stage::Single => None,
        Stage::Draft => Some(DRAFT_INSTRUCTION),
        Stage::Refine => Some(REFINE_INSTRUCTION),
        Stage::Synthesize => Some(SYNTHESIZE_INSTRUCTION),
    }
}

/// System instruction sent for `stage`.
///
/// The single-call path uses the persona alone; staged calls append the stage
/// instruction after the persona (when the scope includes that stage).
pub fn compose_system_instruction(stage: Stage, persona: &str, scope: PersonaScope) -> String {
    let persona = persona.trim();
    let Some(instruction) = stage_instruction(stage) else {
        return persona.to_string();
    };

    let include_persona = match scope {
        PersonaScope::EveryStage => true,
        PersonaScope::SynthesisOnly => stage == Stage::Synthesize,
    };

    if include_persona && !persona.is_empty() {
        format!("{persona}\n\n{instruction}")
    } else {
        instruction.to_string()
    }
}
