//! Retry and failure-disposition rules for step execution.
//!
//! Stateless: all logic is in associated functions that take the step's
//! configuration as parameters.

use std::time::Duration;

use ledgerflow_types::error::WorkflowError;
use ledgerflow_types::workflow::{ExhaustedAction, OnError, RetryPolicy, StepDescriptor};

/// What the run does after a step has definitively failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Mark the step failed and proceed with the next one.
    Continue,
    /// Halt the run with status failed.
    Abort,
}

pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should follow failed attempt number
    /// `attempt` (1-based). Only retryable errors are retried.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, error: &WorkflowError) -> bool {
        error.retryable && attempt < policy.max_attempts
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(policy: &RetryPolicy, retry: u32) -> Duration {
        Duration::from_millis(policy.backoff_for(retry))
    }

    /// Disposition of a step whose failure is final: policy rejections,
    /// exhausted retries, or a plain failure under ABORT/CONTINUE.
    pub fn disposition(step: &StepDescriptor) -> FailureDisposition {
        match step.on_error {
            OnError::Continue => FailureDisposition::Continue,
            OnError::Retry => match step.effective_retry_policy().on_exhausted {
                ExhaustedAction::Continue => FailureDisposition::Continue,
                ExhaustedAction::Abort => FailureDisposition::Abort,
            },
            OnError::Abort | OnError::Fallback => FailureDisposition::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::workflow_error;
    use ledgerflow_types::error::ErrorCode;

    #[test]
    fn retries_only_retryable_errors_within_budget() {
        let policy = RetryPolicy::default();
        let transient = workflow_error(ErrorCode::ServiceUnavailable, "503");
        let permanent = workflow_error(ErrorCode::StepFailed, "bad input");

        assert!(RetryHandler::should_retry(&policy, 1, &transient));
        assert!(RetryHandler::should_retry(&policy, 2, &transient));
        assert!(!RetryHandler::should_retry(&policy, 3, &transient));
        assert!(!RetryHandler::should_retry(&policy, 1, &permanent));
    }

    #[test]
    fn backoff_uses_policy() {
        let policy = RetryPolicy {
            backoff_ms: 20,
            backoff_multiplier: 2.0,
            ..RetryPolicy::default()
        };
        assert_eq!(RetryHandler::backoff(&policy, 1), Duration::from_millis(20));
        assert_eq!(RetryHandler::backoff(&policy, 3), Duration::from_millis(80));
    }

    #[test]
    fn dispositions() {
        let mut step = StepDescriptor::new("s", "x");
        assert_eq!(RetryHandler::disposition(&step), FailureDisposition::Abort);

        step.on_error = OnError::Continue;
        assert_eq!(RetryHandler::disposition(&step), FailureDisposition::Continue);

        step.on_error = OnError::Retry;
        assert_eq!(RetryHandler::disposition(&step), FailureDisposition::Abort);
        step.retry_policy = Some(RetryPolicy {
            on_exhausted: ExhaustedAction::Continue,
            ..RetryPolicy::default()
        });
        assert_eq!(RetryHandler::disposition(&step), FailureDisposition::Continue);

        step.on_error = OnError::Fallback;
        assert_eq!(RetryHandler::disposition(&step), FailureDisposition::Abort);
    }
}
