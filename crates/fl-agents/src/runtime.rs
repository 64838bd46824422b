//! Wires the agent stack together from a loaded [`Config`].

use std::io::IsTerminal;
use std::str::FromStr;
use std::sync::Arc;

use fl_core::config::{Config, ModelsConfig};
use fl_core::task_store::TaskStore;
use fl_harness::model_pool::{ModelLoader, ModelPool};
use fl_harness::provider::{LlmProvider, Purpose};
use fl_harness::tools::{AutoConfirm, Confirmer, DenyRisky, StdinConfirmer, ToolRegistry};
use tracing::info;

use crate::builtin_tools::register_builtin_tools;
use crate::engine::{EngineConfig, ToolExecutionEngine};
use crate::feedback::QueueFeedbackChannel;
use crate::queue_tools::register_queue_tools;
use crate::worker::{EngineTaskHandler, WorkerPool};

/// Sender name on escalation messages.
const ENGINE_SENDER: &str = "engine";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("models.pinned: {0}")]
    Pinned(String),
}

/// `engine.auto_confirm` wins; otherwise ask on a terminal and refuse
/// risky tools everywhere else.
pub fn confirmer_for(auto_confirm: bool, interactive: bool) -> Arc<dyn Confirmer> {
    if auto_confirm {
        Arc::new(AutoConfirm)
    } else if interactive {
        Arc::new(StdinConfirmer)
    } else {
        Arc::new(DenyRisky)
    }
}

/// Parse `models.pinned`, rejecting unknown purposes.
pub fn pinned_purposes(cfg: &ModelsConfig) -> Result<Vec<Purpose>, RuntimeError> {
    let mut purposes = Vec::with_capacity(cfg.pinned.len());
    for name in &cfg.pinned {
        let purpose = Purpose::from_str(name).map_err(|e| RuntimeError::Pinned(e.to_string()))?;
        if !purposes.contains(&purpose) {
            purposes.push(purpose);
        }
    }
    Ok(purposes)
}

/// Everything a worker process needs, built from one config.
pub struct AgentRuntime {
    pub store: Arc<TaskStore>,
    pub engine: Arc<ToolExecutionEngine>,
    pub workers: WorkerPool,
}

impl AgentRuntime {
    /// Picks the confirmer from `engine.auto_confirm` and whether stdin is
    /// a terminal.
    pub fn build(
        config: &Config,
        store: Arc<TaskStore>,
        provider: Arc<dyn LlmProvider>,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<Self, RuntimeError> {
        let confirmer = confirmer_for(config.engine.auto_confirm, std::io::stdin().is_terminal());
        Self::assemble(config, store, provider, loader, confirmer)
    }

    pub fn assemble(
        config: &Config,
        store: Arc<TaskStore>,
        provider: Arc<dyn LlmProvider>,
        loader: Arc<dyn ModelLoader>,
        confirmer: Arc<dyn Confirmer>,
    ) -> Result<Self, RuntimeError> {
        let pinned = pinned_purposes(&config.models)?;

        let mut registry = ToolRegistry::new().with_confirmer(confirmer);
        register_builtin_tools(&mut registry, provider.clone());
        register_queue_tools(&mut registry, store.clone());

        let feedback = Arc::new(QueueFeedbackChannel::new(store.clone(), ENGINE_SENDER));
        let engine = Arc::new(
            ToolExecutionEngine::new(provider, Arc::new(registry), feedback)
                .with_config(EngineConfig::from(&config.engine))
                .with_model_pool(ModelPool::with_pinned(loader, pinned.iter().copied())),
        );

        let handler = Arc::new(EngineTaskHandler::from_config(engine.clone(), &config.engine));
        let workers = WorkerPool::from_config(store.clone(), handler, &config.agents);

        info!(
            max_concurrent = workers.max_concurrent(),
            poll_interval_ms = workers.poll_interval().as_millis() as u64,
            pinned = ?pinned,
            tools = engine.tools().len(),
            "agent runtime ready"
        );
        Ok(Self { store, engine, workers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_purposes_parse_and_dedupe() {
        let cfg = ModelsConfig {
            pinned: vec!["code".into(), "chat".into(), "code".into()],
        };
        assert_eq!(pinned_purposes(&cfg).unwrap(), vec![Purpose::Code, Purpose::Chat]);
        assert!(pinned_purposes(&ModelsConfig::default()).unwrap().is_empty());
    }

    #[test]
    fn unknown_pinned_purpose_is_an_error() {
        let cfg = ModelsConfig {
            pinned: vec!["code".into(), "vision".into()],
        };
        let err = pinned_purposes(&cfg).unwrap_err();
        assert!(err.to_string().contains("vision"), "{err}");
    }
}
