use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use tinychat::{
    api::{self, AppState, ChatSettings, ServiceToken},
    config::SamplingPolicy,
    conversation::ChatTemplate,
    inference::{InferenceService, SamplingParams, TextGenerator},
};

const TOKEN: &str = "myllservicetoken2024";

/// Echoes the prompt followed by a canned assistant reply, like a pipeline
/// that returns the full generated text.
#[derive(Default)]
struct EchoGenerator {
    calls: AtomicUsize,
    fail: bool,
    last: Mutex<Option<(String, SamplingParams)>>,
}

impl TextGenerator for EchoGenerator {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> anyhow::Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some((prompt.to_string(), *params));
        if self.fail {
            return Err(anyhow!("CUDA out of memory at layer 7"));
        }
        Ok(vec![format!("{prompt}  Hello! How can I help?  ")])
    }
}

fn app_with(generator: Arc<EchoGenerator>, system_prompt: Option<&str>) -> Router {
    api::app(AppState {
        token: ServiceToken::new(TOKEN),
        infer: Arc::new(InferenceService::new(generator, 1)),
        template: Arc::new(ChatTemplate::default()),
        settings: Arc::new(ChatSettings {
            sampling: SamplingPolicy::default(),
            assistant_delimiter: "<|assistant|>".into(),
            system_prompt: system_prompt.map(str::to_string),
        }),
    })
}

fn chat_request(token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/v1/chat")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn json_body(res: axum::response::Response) -> Value {
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

const HELLO: &str = r#"{"messages":[{"role":"user","content":"Hello"}]}"#;

#[tokio::test]
async fn valid_token_returns_response_string() {
    let generator = Arc::new(EchoGenerator::default());
    let res = app_with(generator.clone(), None)
        .oneshot(chat_request(Some(TOKEN), HELLO))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["response"], json!("Hello! How can I help?"));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

    let (prompt, params) = generator.last.lock().unwrap().clone().unwrap();
    assert!(prompt.contains("<|user|>\nHello</s>"));
    assert!(prompt.trim_end().ends_with("<|assistant|>"));
    assert_eq!(params.max_new_tokens, 100);
    assert!(!params.do_sample);
}

#[tokio::test]
async fn invalid_token_is_rejected_without_generation() {
    let generator = Arc::new(EchoGenerator::default());
    let res = app_with(generator.clone(), None)
        .oneshot(chat_request(Some("invalidtoken"), HELLO))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(res.headers()[header::WWW_AUTHENTICATE], "Bearer");
    let body = json_body(res).await;
    assert_eq!(body["detail"], "Invalid authentication credentials");
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_token_is_rejected() {
    let generator = Arc::new(EchoGenerator::default());
    let res = app_with(generator.clone(), None)
        .oneshot(chat_request(None, HELLO))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(res.headers()[header::WWW_AUTHENTICATE], "Bearer");
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_bodies_are_unprocessable() {
    let generator = Arc::new(EchoGenerator::default());
    let app = app_with(generator.clone(), None);
    for body in [
        "not json",
        r#"{"text":"Hello"}"#,
        r#"{"messages":[{"role":"wizard","content":"Hello"}]}"#,
        r#"{"messages":[{"role":"user","content":"Hello"}],"temperature":3.0}"#,
        r#"{"messages":[]}"#,
    ] {
        let res = app
            .clone()
            .oneshot(chat_request(Some(TOKEN), body))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY, "body: {body}");
        assert!(json_body(res).await["detail"].is_string());
    }
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn top_p_forces_sampling_end_to_end() {
    let generator = Arc::new(EchoGenerator::default());
    let body = r#"{"messages":[{"role":"user","content":"Hi"}],"do_sample":false,"top_p":0.8,"temperature":0.5,"top_k":20,"max_new_tokens":64}"#;
    let res = app_with(generator.clone(), None)
        .oneshot(chat_request(Some(TOKEN), body))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let (_, params) = generator.last.lock().unwrap().clone().unwrap();
    assert_eq!(
        params,
        SamplingParams {
            max_new_tokens: 64,
            do_sample: true,
            temperature: 0.5,
            top_k: 20,
            top_p: Some(0.8),
        }
    );
}

#[tokio::test]
async fn generation_failure_hides_details() {
    let generator = Arc::new(EchoGenerator {
        fail: true,
        ..EchoGenerator::default()
    });
    let res = app_with(generator, None)
        .oneshot(chat_request(Some(TOKEN), HELLO))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(res).await;
    assert_eq!(body, json!({ "detail": "Internal Server Error" }));
}

#[tokio::test]
async fn configured_system_prompt_leads_the_prompt() {
    let generator = Arc::new(EchoGenerator::default());
    let res = app_with(generator.clone(), Some("Answer briefly."))
        .oneshot(chat_request(Some(TOKEN), HELLO))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let (prompt, _) = generator.last.lock().unwrap().clone().unwrap();
    assert!(prompt.starts_with("<|system|>\nAnswer briefly.</s>"));
}

#[tokio::test]
async fn reply_follows_last_assistant_marker() {
    let generator = Arc::new(EchoGenerator::default());
    let body = json!({
        "messages": [
            { "role": "user", "content": "Hi" },
            { "role": "assistant", "content": "Earlier answer" },
            { "role": "user", "content": "And now?" }
        ]
    })
    .to_string();
    let res = app_with(generator, None)
        .oneshot(chat_request(Some(TOKEN), &body))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await["response"], "Hello! How can I help?");
}
