use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use tinychat::{
    api::{self, AppState, ChatSettings, ServiceToken},
    config::ServiceConfig,
    conversation::ChatTemplate,
    inference::{
        llama::{load_model_files, select_device, LlamaGenerator},
        InferenceService,
    },
    logging,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // -----------------------------
    // Logging
    // -----------------------------
    logging::init("info,tower_http=info");

    let cfg = ServiceConfig::from_env()?;
    info!(model = %cfg.model.model_id, device = ?cfg.model.device, "starting chat service");

    // -----------------------------
    // Model (loaded once, blocking)
    // -----------------------------
    let model_cfg = cfg.model.clone();
    let (generator, template) = tokio::task::spawn_blocking(move || {
        let files = load_model_files(&model_cfg)?;
        let template = ChatTemplate::resolve(
            model_cfg.chat_template_path.as_deref(),
            files.tokenizer_config.as_deref(),
        )?;
        let device = select_device(model_cfg.device)?;
        let generator = LlamaGenerator::load(&files, device)?;
        anyhow::Ok((generator, template))
    })
    .await
    .context("model loader panicked")??;

    // -----------------------------
    // Shared state
    // -----------------------------
    let state = AppState {
        token: ServiceToken::new(cfg.service_token.as_str()),
        infer: Arc::new(InferenceService::new(
            Arc::new(generator),
            cfg.max_concurrent_generations,
        )),
        template: Arc::new(template),
        settings: Arc::new(ChatSettings {
            sampling: cfg.sampling,
            assistant_delimiter: cfg.model.assistant_delimiter.clone(),
            system_prompt: cfg.system_prompt.clone(),
        }),
    };

    let app = api::app(state);

    info!(
        addr = %cfg.bind_addr,
        permits = cfg.max_concurrent_generations,
        "HTTP listening, chat endpoint at /api/v1/chat"
    );
    let listener = TcpListener::bind(cfg.bind_addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
