//! Contract of the external component code generator.
//!
//! `create` and `improve` workflow steps call it and persist what it returns
//! as `component` records.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedComponent {
    pub name: String,
    pub description: String,
    pub code: String,
    pub component_type: String,
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> anyhow::Result<GeneratedComponent>;

    async fn improve(
        &self,
        existing: &GeneratedComponent,
        instructions: &str,
    ) -> anyhow::Result<GeneratedComponent>;
}

/// Stand-in used when no generator is wired up; every call fails, which fails
/// the step that needed it.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnconfiguredGenerator;

#[async_trait]
impl CodeGenerator for UnconfiguredGenerator {
    async fn generate(&self, _prompt: &str) -> anyhow::Result<GeneratedComponent> {
        anyhow::bail!("no code generator configured")
    }

    async fn improve(
        &self,
        existing: &GeneratedComponent,
        _instructions: &str,
    ) -> anyhow::Result<GeneratedComponent> {
        anyhow::bail!("no code generator configured to improve '{}'", existing.name)
    }
}
