//! Step targets: the external collaborators a workflow step dispatches to.

use crate::error::{EngineError, EngineResult};
use crate::types::{Payload, StepKind};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Provider name that selects the default AI provider
pub const AUTO_PROVIDER: &str = "auto";

/// Result reported by a collaborator
#[derive(Debug, Clone, PartialEq)]
pub enum TargetOutcome {
    Success { output: Value },
    Failure { error: String },
}

impl TargetOutcome {
    pub fn success(output: impl Into<Value>) -> Self {
        TargetOutcome::Success {
            output: output.into(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        TargetOutcome::Failure {
            error: error.into(),
        }
    }
}

/// Anything a step can execute: a tool, a module or an AI provider client.
/// A returned `Err` is treated like [`TargetOutcome::Failure`].
#[async_trait::async_trait]
pub trait Collaborator: Send + Sync {
    async fn execute(&self, input: Payload) -> anyhow::Result<TargetOutcome>;
}

#[async_trait::async_trait]
impl<F, Fut> Collaborator for F
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<TargetOutcome>> + Send + 'static,
{
    async fn execute(&self, input: Payload) -> anyhow::Result<TargetOutcome> {
        (self)(input).await
    }
}

/// A resolved step target
#[derive(Clone)]
pub enum Target {
    Tool(Arc<dyn Collaborator>),
    Module(Arc<dyn Collaborator>),
    Ai {
        provider: String,
        auto_selected: bool,
        client: Arc<dyn Collaborator>,
    },
}

impl Target {
    pub fn kind(&self) -> StepKind {
        match self {
            Target::Tool(_) => StepKind::Tool,
            Target::Module(_) => StepKind::Module,
            Target::Ai { .. } => StepKind::Ai,
        }
    }

    /// Run the target on `input`
    pub async fn invoke(&self, input: Payload) -> anyhow::Result<TargetOutcome> {
        match self {
            Target::Tool(collaborator) | Target::Module(collaborator) => {
                collaborator.execute(input).await
            }
            Target::Ai {
                provider,
                auto_selected,
                client,
            } => {
                let mut request = input;
                let prompt = prompt_of(&request);
                request.insert("prompt".to_string(), Value::String(prompt));

                Ok(match client.execute(request).await? {
                    TargetOutcome::Success { output } => TargetOutcome::success(serde_json::json!({
                        "response": output,
                        "provider": provider,
                        "was_auto_selected": auto_selected,
                    })),
                    failure => failure,
                })
            }
        }
    }
}

/// Prompt sent to an AI provider: `prompt`, else `message`, else the whole
/// input as JSON
fn prompt_of(input: &Payload) -> String {
    ["prompt", "message"]
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| Value::Object(input.clone()).to_string())
}

/// Named collaborators available to workflow steps
#[derive(Clone, Default)]
pub struct TargetRegistry {
    tools: HashMap<String, Arc<dyn Collaborator>>,
    modules: HashMap<String, Arc<dyn Collaborator>>,
    ai_providers: HashMap<String, Arc<dyn Collaborator>>,
    default_ai_provider: Option<String>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tool(&mut self, name: impl Into<String>, tool: impl Collaborator + 'static) {
        self.tools.insert(name.into(), Arc::new(tool));
    }

    pub fn register_module(&mut self, name: impl Into<String>, module: impl Collaborator + 'static) {
        self.modules.insert(name.into(), Arc::new(module));
    }

    pub fn register_ai_provider(
        &mut self,
        name: impl Into<String>,
        client: impl Collaborator + 'static,
    ) {
        self.ai_providers.insert(name.into(), Arc::new(client));
    }

    /// Provider used by AI steps targeting `auto`
    pub fn set_default_ai_provider(&mut self, name: impl Into<String>) {
        self.default_ai_provider = Some(name.into());
    }

    pub fn default_ai_provider(&self) -> Option<&str> {
        self.default_ai_provider.as_deref()
    }

    /// Resolve the target of a step
    pub fn resolve(&self, kind: StepKind, name: &str) -> EngineResult<Target> {
        match kind {
            StepKind::Tool => self
                .tools
                .get(name)
                .map(|c| Target::Tool(c.clone()))
                .ok_or_else(|| EngineError::not_found("tool", name)),
            StepKind::Module => self
                .modules
                .get(name)
                .map(|c| Target::Module(c.clone()))
                .ok_or_else(|| EngineError::not_found("module", name)),
            StepKind::Ai => {
                let auto_selected = name == AUTO_PROVIDER;
                let provider = if auto_selected {
                    self.default_ai_provider
                        .as_deref()
                        .ok_or_else(|| EngineError::not_found("ai provider", AUTO_PROVIDER))?
                } else {
                    name
                };

                let client = self
                    .ai_providers
                    .get(provider)
                    .ok_or_else(|| EngineError::not_found("ai provider", provider))?;

                Ok(Target::Ai {
                    provider: provider.to_string(),
                    auto_selected,
                    client: client.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait::async_trait]
    impl Collaborator for Echo {
        async fn execute(&self, input: Payload) -> anyhow::Result<TargetOutcome> {
            Ok(TargetOutcome::success(Value::Object(input)))
        }
    }

    #[test]
    fn test_unknown_target_not_found() {
        let registry = TargetRegistry::new();
        assert!(matches!(
            registry.resolve(StepKind::Tool, "extract"),
            Err(EngineError::NotFound { kind: "tool", .. })
        ));
        assert!(matches!(
            registry.resolve(StepKind::Ai, AUTO_PROVIDER),
            Err(EngineError::NotFound { kind: "ai provider", .. })
        ));
    }

    #[tokio::test]
    async fn test_auto_uses_default_provider() {
        let mut registry = TargetRegistry::new();
        registry.register_ai_provider("anthropic", Echo);
        registry.set_default_ai_provider("anthropic");

        let target = registry.resolve(StepKind::Ai, AUTO_PROVIDER).unwrap();
        assert_eq!(target.kind(), StepKind::Ai);

        let mut input = Payload::new();
        input.insert("message".to_string(), Value::from("summarise the deposition"));

        let outcome = target.invoke(input).await.unwrap();
        let TargetOutcome::Success { output } = outcome else {
            panic!("expected success");
        };
        assert_eq!(output["provider"], "anthropic");
        assert_eq!(output["was_auto_selected"], true);
        assert_eq!(output["response"]["prompt"], "summarise the deposition");
    }
}
