use async_trait::async_trait;
use serde_json::json;

use tollgate_common::Money;
use tollgate_engine::executor::{ExecutorError, PackExecutor, PackOutput, PackRequest};

// Flat metered cost per echo invocation, in micros.
const ECHO_UNIT_COST: i64 = 1_000;

/// Diagnostic pack: returns its inputs unchanged for a flat fee. Useful for
/// end-to-end smoke tests of the submit/execute/settle pipeline without any
/// real business logic in the loop.
pub struct EchoPack;

#[async_trait]
impl PackExecutor for EchoPack {
    fn pack_type(&self) -> &str {
        "echo"
    }

    async fn execute(&self, request: &PackRequest) -> Result<PackOutput, ExecutorError> {
        Ok(PackOutput {
            data: json!({ "echo": request.inputs }),
            artifacts: None,
            actual_amount: Money::from_micros(ECHO_UNIT_COST),
        })
    }
}
