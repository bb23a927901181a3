use serde_json::{json, Value};

use crate::commands::CommandResult;
use expensa_core::condition::{evaluate, ApprovalContext};

/// Evaluates one condition expression against a flat JSON context object.
pub fn run(expression: &str, context_json: &str) -> CommandResult {
    let raw: Value = match serde_json::from_str(context_json) {
        Ok(value) => value,
        Err(error) => {
            return CommandResult::failure(
                "evaluate",
                "invalid_context",
                format!("context is not valid JSON: {error}"),
                2,
            );
        }
    };
    if !raw.is_object() {
        return CommandResult::failure(
            "evaluate",
            "invalid_context",
            "context must be a JSON object of field -> value",
            2,
        );
    }

    let context = ApprovalContext::from_json(&raw);
    match evaluate(expression, &context) {
        Ok(result) => CommandResult::success_with_data(
            "evaluate",
            format!("condition evaluated to {result}"),
            Some(json!({ "expression": expression, "result": result })),
        ),
        Err(error) => CommandResult::failure(
            "evaluate",
            "condition_parse",
            format!("condition does not parse: {error}"),
            2,
        ),
    }
}
