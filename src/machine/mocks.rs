// Mock hooks and storage for state machine tests - no side effects

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::machine::traits::{EntityHandle, TransitionHooks};
use crate::machine::types::{State, TransitionContext, TransitionResult};
use crate::storage::{IsolationLevel, Storage, StorageError, StorageTransaction};

/// Which hook a recorded call went to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookCall {
    BusinessRules { from: String, to: String },
    PreTransition { from: String, to: String },
    PostTransition { from: String, to: String },
}

/// Hooks with scripted rejections that record every call
#[derive(Debug, Default)]
pub struct MockHooks {
    pub business_rejections: Mutex<HashMap<String, String>>,
    pub pre_rejections: Mutex<HashMap<String, String>>,
    pub business_warning: Mutex<Option<String>>,
    pub fail_post: Mutex<bool>,
    pub calls: Mutex<Vec<HookCall>>,
}

impl MockHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_business(&self, target: &str, message: &str) {
        self.business_rejections
            .lock()
            .unwrap()
            .insert(target.to_string(), message.to_string());
    }

    pub fn reject_pre(&self, target: &str, message: &str) {
        self.pre_rejections
            .lock()
            .unwrap()
            .insert(target.to_string(), message.to_string());
    }

    pub fn warn_business(&self, warning: &str) {
        *self.business_warning.lock().unwrap() = Some(warning.to_string());
    }

    pub fn set_fail_post(&self, fail: bool) {
        *self.fail_post.lock().unwrap() = fail;
    }

    pub fn get_calls(&self) -> Vec<HookCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransitionHooks for MockHooks {
    async fn validate_business_rules(
        &self,
        _entity: &dyn EntityHandle,
        from: &State,
        to: &State,
        _context: &TransitionContext,
    ) -> TransitionResult {
        self.calls.lock().unwrap().push(HookCall::BusinessRules {
            from: from.to_string(),
            to: to.to_string(),
        });
        let rejection = self.business_rejections.lock().unwrap().get(to.as_str()).cloned();
        match rejection {
            Some(message) => TransitionResult::rejected(from.clone(), to.clone(), message),
            None => {
                let result = TransitionResult::success(from.clone(), to.clone());
                match self.business_warning.lock().unwrap().clone() {
                    Some(warning) => result.with_warning(warning),
                    None => result,
                }
            }
        }
    }

    async fn pre_transition(
        &self,
        _entity: &dyn EntityHandle,
        from: &State,
        to: &State,
        _context: &TransitionContext,
    ) -> TransitionResult {
        self.calls.lock().unwrap().push(HookCall::PreTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
        let rejection = self.pre_rejections.lock().unwrap().get(to.as_str()).cloned();
        match rejection {
            // Hooks may leave the kind unset; the machine classifies it
            Some(message) => TransitionResult {
                success: false,
                error: Some(message),
                ..TransitionResult::success(from.clone(), to.clone())
            },
            None => TransitionResult::success(from.clone(), to.clone()),
        }
    }

    async fn post_transition(
        &self,
        _entity: &dyn EntityHandle,
        from: &State,
        to: &State,
        _context: &TransitionContext,
    ) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(HookCall::PostTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
        if *self.fail_post.lock().unwrap() {
            anyhow::bail!("notification service unavailable");
        }
        Ok(())
    }
}

/// Storage whose `begin` always fails
#[derive(Debug, Default)]
pub struct UnavailableStorage;

#[async_trait]
impl Storage for UnavailableStorage {
    async fn begin(
        &self,
        _isolation: Option<IsolationLevel>,
    ) -> Result<Box<dyn StorageTransaction>, StorageError> {
        Err(StorageError::Backend("connection refused".to_string()))
    }
}
