//! One module per completion-service role.
//!
//! Agents own their output schema and prompt budget; callers hand them the
//! completion service and the usage sink for the current invocation.

use crate::io::completion::{CallerIds, CompletionRequest, Profile, ValidationOptions};
use crate::io::prompt::PromptPack;

pub mod executor;
pub mod planner;
pub mod repair;
pub mod reporter;

/// Budget and retry settings shared by every agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSettings {
    pub prompt_budget_bytes: usize,
    pub max_retries: u32,
}

pub(crate) fn completion_request(
    pack: PromptPack,
    caller: CallerIds,
    profile: Profile,
    output_schema: &'static str,
    settings: AgentSettings,
) -> CompletionRequest {
    CompletionRequest {
        system_prompt: pack.system,
        user_prompt: pack.user,
        caller,
        profile,
        output_schema,
        validation: ValidationOptions::strict(settings.max_retries),
        attempt: 0,
    }
}
