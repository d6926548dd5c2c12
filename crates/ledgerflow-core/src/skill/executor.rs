//! Skill execution trait, invocation context and raw failure type.
//!
//! A skill is an opaque unit of work addressed by id. The engine hands it the
//! step inputs plus a [`SkillContext`]; the skill returns a JSON result or a
//! [`SkillError`], which the error taxonomy then classifies.

use std::future::Future;
use std::sync::Arc;

use semver::Version;
use serde_json::Value;
use thiserror::Error;

use crate::guard::{ExternalCallBlockedError, ExternalCallGuard};
use crate::policy::PolicyViolation;

// ---------------------------------------------------------------------------
// Failure type
// ---------------------------------------------------------------------------

/// A raw skill failure, before classification.
#[derive(Debug, Clone, Error)]
pub enum SkillError {
    #[error("timed out{}", .after_ms.map(|ms| format!(" after {ms}ms")).unwrap_or_default())]
    Timeout { after_ms: Option<u64> },

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Policy(#[from] PolicyViolation),

    #[error("skill '{0}' is not registered")]
    NotFound(String),

    #[error("invalid skill: {0}")]
    Invalid(String),

    #[error(transparent)]
    Blocked(#[from] ExternalCallBlockedError),

    #[error("{0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Per-invocation context handed to a skill.
#[derive(Debug, Clone)]
pub struct SkillContext {
    /// Set during verify-mode replay: the skill must not perform side
    /// effects and should return a stubbed result where it cannot compute
    /// one locally.
    pub stub: bool,
    pub guard: Arc<ExternalCallGuard>,
}

impl SkillContext {
    /// Context for a normal (live) invocation.
    pub fn live(guard: Arc<ExternalCallGuard>) -> Self {
        Self { stub: false, guard }
    }

    /// Context for a side-effect-free replay invocation.
    pub fn stubbed(guard: Arc<ExternalCallGuard>) -> Self {
        Self { stub: true, guard }
    }

    /// Ask the guard before an outbound call.
    pub fn check_external_call(&self, call_type: &str, target: &str) -> Result<(), SkillError> {
        self.guard
            .check_external_call_allowed(call_type, target, &[])
            .map_err(SkillError::from)
    }
}

// ---------------------------------------------------------------------------
// Skill trait
// ---------------------------------------------------------------------------

/// A callable unit of work.
///
/// Skills are expected to be pure functions of their inputs for replay to
/// verify. Non-deterministic skills belong in `transient` steps.
pub trait Skill: Send + Sync {
    fn execute(
        &self,
        inputs: &Value,
        ctx: &SkillContext,
    ) -> impl Future<Output = Result<Value, SkillError>> + Send;

    /// Version recorded on every audit op this skill produces.
    fn version(&self) -> Option<Version> {
        None
    }
}

/// Adapter turning a synchronous closure into a [`Skill`].
pub struct FnSkill<F> {
    f: F,
    version: Option<Version>,
}

impl<F> FnSkill<F>
where
    F: Fn(&Value, &SkillContext) -> Result<Value, SkillError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f, version: None }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }
}

impl<F> Skill for FnSkill<F>
where
    F: Fn(&Value, &SkillContext) -> Result<Value, SkillError> + Send + Sync,
{
    async fn execute(&self, inputs: &Value, ctx: &SkillContext) -> Result<Value, SkillError> {
        (self.f)(inputs, ctx)
    }

    fn version(&self) -> Option<Version> {
        self.version.clone()
    }
}
