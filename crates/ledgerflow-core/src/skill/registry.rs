//! SkillRegistry -- id-addressed lookup of type-erased skills.
//!
//! [`Skill`] uses RPITIT and cannot be a trait object directly, so the
//! registry stores skills behind the object-safe [`SkillDyn`] trait:
//! 1. `SkillDyn` mirrors `Skill` with boxed futures
//! 2. a blanket impl covers every `T: Skill`
//! 3. the registry hands out `Arc<dyn SkillDyn>`

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use serde_json::Value;

use super::executor::{Skill, SkillContext, SkillError};

/// Object-safe version of [`Skill`] with boxed futures.
pub trait SkillDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        inputs: &'a Value,
        ctx: &'a SkillContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, SkillError>> + Send + 'a>>;

    fn version_dyn(&self) -> Option<Version>;
}

impl<T: Skill> SkillDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        inputs: &'a Value,
        ctx: &'a SkillContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, SkillError>> + Send + 'a>> {
        Box::pin(self.execute(inputs, ctx))
    }

    fn version_dyn(&self) -> Option<Version> {
        self.version()
    }
}

/// Run `skill`, failing with [`SkillError::Timeout`] once `timeout_ms` elapses.
pub async fn execute_with_timeout(
    skill: &dyn SkillDyn,
    inputs: &Value,
    ctx: &SkillContext,
    timeout_ms: Option<u64>,
) -> Result<Value, SkillError> {
    match timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), skill.execute_boxed(inputs, ctx))
            .await
            .unwrap_or(Err(SkillError::Timeout { after_ms: Some(ms) })),
        None => skill.execute_boxed(inputs, ctx).await,
    }
}

/// Skills keyed by id. Cloning is cheap; entries are shared.
#[derive(Clone, Default)]
pub struct SkillRegistry {
    skills: HashMap<String, Arc<dyn SkillDyn>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `skill` under `id`, replacing any previous entry.
    pub fn register<S: Skill + 'static>(&mut self, id: impl Into<String>, skill: S) -> &mut Self {
        self.skills.insert(id.into(), Arc::new(skill));
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<S: Skill + 'static>(mut self, id: impl Into<String>, skill: S) -> Self {
        self.register(id, skill);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn SkillDyn>> {
        self.skills.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.skills.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.skills.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

impl std::fmt::Debug for SkillRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillRegistry")
            .field("skills", &self.ids())
            .finish()
    }
}
