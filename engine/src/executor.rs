//! Executor seam for business packs.
//!
//! A pack is a pure computation: inputs in, envelope data and an actual cost
//! out. Packs must not perform their own uploads or ledger calls. All
//! external side-effects belong to the finalizer, which is what keeps the
//! abort-on-lost-lease path side-effect-free.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use tollgate_common::Money;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Pack rejected inputs: {0}")]
    BadInputs(String),

    #[error("Pack failed: {0}")]
    Failed(String),
}

/// What a pack produced: envelope payload plus the metered cost.
#[derive(Clone, Debug)]
pub struct PackOutput {
    pub data: Value,
    pub artifacts: Option<Value>,
    pub actual_amount: Money,
}

/// Inputs handed to a pack. The worker assembles this from the run row.
#[derive(Clone, Debug)]
pub struct PackRequest {
    pub run_id: String,
    pub tenant_id: String,
    pub inputs: Value,
    pub reserved_amount: Money,
}

#[async_trait]
pub trait PackExecutor: Send + Sync {
    fn pack_type(&self) -> &str;

    async fn execute(&self, request: &PackRequest) -> Result<PackOutput, ExecutorError>;
}

/// Pack lookup by type tag. Built once at worker startup.
#[derive(Default)]
pub struct ExecutorRegistry {
    packs: HashMap<String, Arc<dyn PackExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn PackExecutor>) {
        self.packs
            .insert(executor.pack_type().to_string(), executor);
    }

    pub fn get(&self, pack_type: &str) -> Option<Arc<dyn PackExecutor>> {
        self.packs.get(pack_type).cloned()
    }

    pub fn known_types(&self) -> Vec<&str> {
        self.packs.keys().map(String::as_str).collect()
    }
}
