use std::sync::Arc;
use std::time::Duration;

use fl_agents::runtime::{confirmer_for, AgentRuntime, RuntimeError};
use fl_agents::EngineTaskHandler;
use fl_core::config::Config;
use fl_core::task_store::TaskStore;
use fl_core::types::NewTask;
use fl_harness::model_pool::NoopLoader;
use fl_harness::provider::{LlmProvider, Purpose, ScriptedProvider, StubProvider};
use fl_harness::tools::ToolError;
use serde_json::json;

fn config() -> Config {
    let mut config = Config::default();
    config.agents.max_concurrent = 3;
    config.agents.poll_interval_ms = 250;
    config.engine.max_iterations = 7;
    config.engine.validation_attempts = 2;
    config.models.pinned = vec!["code".into()];
    config
}

async fn store() -> Arc<TaskStore> {
    Arc::new(TaskStore::open_in_memory().await.unwrap())
}

#[tokio::test]
async fn build_applies_every_config_section() {
    let runtime = AgentRuntime::build(
        &config(),
        store().await,
        Arc::new(StubProvider::new("none")),
        Arc::new(NoopLoader),
    )
    .unwrap();

    assert_eq!(runtime.workers.max_concurrent(), 3);
    assert_eq!(runtime.workers.poll_interval(), Duration::from_millis(250));
    assert_eq!(runtime.engine.config().max_iterations, 7);

    let pool = runtime.engine.model_pool().expect("model pool attached");
    assert!(pool.is_pinned(Purpose::Code));
    assert!(!pool.is_pinned(Purpose::Chat));

    let tools = runtime.engine.tools();
    assert!(tools.contains("build"));
    assert!(tools.contains("claim_task"));
}

#[tokio::test]
async fn unknown_pinned_purpose_fails_the_build() {
    let mut config = config();
    config.models.pinned.push("vision".into());
    let result = AgentRuntime::build(
        &config,
        store().await,
        Arc::new(StubProvider::new("none")),
        Arc::new(NoopLoader),
    );
    assert!(matches!(result, Err(RuntimeError::Pinned(msg)) if msg.contains("vision")));
}

#[tokio::test]
async fn auto_confirm_off_denies_build_without_a_terminal() {
    let missing = json!({"path": "/nonexistent/forgeloop-project"});

    let denied = AgentRuntime::assemble(
        &config(),
        store().await,
        Arc::new(StubProvider::new("none")),
        Arc::new(NoopLoader),
        confirmer_for(false, false),
    )
    .unwrap();
    let err = denied.engine.tools().execute("build", missing.clone()).await.unwrap_err();
    assert!(matches!(err, ToolError::Denied(ref name) if name == "build"), "{err:?}");

    let allowed = AgentRuntime::assemble(
        &config(),
        store().await,
        Arc::new(StubProvider::new("none")),
        Arc::new(NoopLoader),
        confirmer_for(true, false),
    )
    .unwrap();
    // Confirmed, so the tool itself runs and rejects the path.
    let err = allowed.engine.tools().execute("build", missing).await.unwrap_err();
    assert!(matches!(err, ToolError::Execution(ref msg) if msg.contains("not a directory")), "{err:?}");
}

#[tokio::test]
async fn handler_uses_configured_validation_attempts() {
    let store = store().await;
    let provider = Arc::new(ScriptedProvider::new([
        "I would start by writing main.go.",
        "Let me think about it.",
        "Still thinking.",
    ]));
    let runtime = AgentRuntime::build(
        &config(),
        store.clone(),
        provider.clone() as Arc<dyn LlmProvider>,
        Arc::new(NoopLoader),
    )
    .unwrap();

    let task = store.create_task(NewTask::new("write a server")).await.unwrap();
    let started = runtime.workers.dispatch().await.unwrap();
    assert_eq!(started, vec![task.key.clone()]);

    let reports = runtime.workers.drain().await;
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].success);
    assert_eq!(provider.call_count(), 2);
    assert_eq!(provider.remaining(), 1);

    let handler = EngineTaskHandler::from_config(runtime.engine.clone(), &config().engine);
    assert_eq!(handler.validation_attempts(), 2);
}

#[tokio::test]
async fn stub_provider_fails_the_task_cleanly() {
    let store = store().await;
    let runtime = AgentRuntime::build(
        &config(),
        store.clone(),
        Arc::new(StubProvider::new("none")),
        Arc::new(NoopLoader),
    )
    .unwrap();
    store.create_task(NewTask::new("anything")).await.unwrap();

    runtime.workers.dispatch().await.unwrap();
    let reports = runtime.workers.drain().await;
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].success);
    let error = reports[0].error.as_deref().unwrap_or_default();
    assert!(error.contains("not configured"), "{error}");
}
