use anyhow::{anyhow, Context};
use axum::{extract::State, Json};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    api::{
        extract::ChatJson,
        types::{GenerationRequest, GenerationResult},
        AppState, AuthenticatedCaller,
    },
    conversation::{extract_reply, with_system_prompt},
    error::ChatError,
};

#[instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
pub async fn chat(
    State(state): State<AppState>,
    _caller: AuthenticatedCaller,
    ChatJson(req): ChatJson<GenerationRequest>,
) -> Result<Json<GenerationResult>, ChatError> {
    let params = req.sampling_params(&state.settings.sampling)?;
    info!(turns = req.messages.len(), ?params, "chat request accepted");

    let messages = with_system_prompt(req.messages, state.settings.system_prompt.as_deref());
    let prompt = state
        .template
        .render(&messages)
        .context("failed to build prompt")?;

    let outputs = state.infer.generate(prompt, params).await?;
    let generated = outputs
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("generator returned no candidates"))?;

    let response = extract_reply(&generated, &state.settings.assistant_delimiter).to_string();
    info!(chars = response.len(), "chat reply ready");

    Ok(Json(GenerationResult { response }))
}
