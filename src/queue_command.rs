use crate::queue::{format_utc, OperationQueue, OperationStatus};
use chrono::Utc;
use rmcp::schemars;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::str::FromStr;

const ACTIONS: [&str; 6] = ["add", "execute", "list", "clear", "stats", "remove"];

/// Generic queue management request as submitted by the driving assistant.
/// Every field except `action` is optional at the schema level; per-action
/// requirements are validated here so the caller always gets a structured
/// error envelope instead of a deserialization fault.
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
pub struct QueueCommand {
    #[serde(default)]
    #[schemars(description = "Action to perform: add, execute, list, clear, stats, or remove")]
    pub action: Option<String>,
    #[serde(default)]
    #[schemars(description = "Tool name to queue (required for add)")]
    pub tool: Option<String>,
    #[serde(default)]
    #[schemars(description = "Parameters document for the queued tool (required for add)")]
    pub parameters: Option<JsonValue>,
    #[serde(default)]
    #[schemars(description = "Status filter for list and clear: pending, executed, or failed")]
    pub status: Option<String>,
    #[serde(default)]
    #[schemars(description = "Maximum number of operations to return for list")]
    pub limit: Option<u32>,
    #[serde(default)]
    #[schemars(description = "Operation id to remove (required for remove)")]
    pub operation_id: Option<String>,
}

/// Structured response envelope. Every facade call produces one of these; no
/// error from the queue or router layer escapes as a fault.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Envelope {
    Success {
        message: String,
        data: JsonValue,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestion: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        valid_values: Option<Vec<String>>,
        error_code: String,
    },
}

impl Envelope {
    pub fn success(message: impl Into<String>, data: JsonValue) -> Self {
        Self::Success {
            message: message.into(),
            data,
        }
    }

    pub fn error(
        message: impl Into<String>,
        context: impl Into<String>,
        suggestion: impl Into<String>,
        valid_values: Option<Vec<String>>,
        error_code: impl Into<String>,
    ) -> Self {
        Self::Error {
            message: message.into(),
            context: Some(context.into()),
            suggestion: Some(suggestion.into()),
            valid_values,
            error_code: error_code.into(),
        }
    }

    /// Catch-all for unexpected faults crossing the facade boundary.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            context: None,
            suggestion: None,
            valid_values: None,
            error_code: "INTERNAL_ERROR".to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

fn to_json<T: Serialize>(value: &T) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

fn action_list() -> Vec<String> {
    ACTIONS.iter().map(|a| a.to_string()).collect()
}

fn status_list() -> Vec<String> {
    OperationStatus::VALUES.iter().map(|s| s.to_string()).collect()
}

/// Parses an optional status filter field, reporting an invalid value as a
/// structured error rather than silently matching nothing.
fn parse_status_filter(raw: Option<&str>) -> Result<Option<OperationStatus>, Envelope> {
    match raw {
        None => Ok(None),
        Some(raw) => OperationStatus::from_str(raw).map(Some).map_err(|()| {
            Envelope::error(
                format!("Invalid status filter: '{raw}'"),
                "Status filter does not name a known operation status",
                "Use one of: pending, executed, failed",
                Some(status_list()),
                "INVALID_STATUS",
            )
        }),
    }
}

/// Single entry point for queue management: validate the request, call the
/// queue, and format the outcome.
pub async fn handle(queue: &OperationQueue, command: QueueCommand) -> Envelope {
    let action = match command.action.as_deref() {
        Some(action) if !action.is_empty() => action.to_lowercase(),
        _ => {
            return Envelope::error(
                "Action parameter is required",
                "Queue management requires an action to be specified",
                "Use one of: add, execute, list, clear, stats, remove",
                Some(action_list()),
                "MISSING_ACTION",
            )
        }
    };

    match action.as_str() {
        "add" => add_operation(queue, command).await,
        "execute" => execute_batch(queue).await,
        "list" => list_operations(queue, command).await,
        "clear" => clear_queue(queue, command).await,
        "stats" => queue_stats(queue).await,
        "remove" => remove_operation(queue, command).await,
        other => Envelope::error(
            format!("Unknown queue action: '{other}'"),
            "Queue management action not recognized",
            "Use one of: add, execute, list, clear, stats, remove",
            Some(action_list()),
            "UNKNOWN_ACTION",
        ),
    }
}

async fn add_operation(queue: &OperationQueue, command: QueueCommand) -> Envelope {
    let tool = match command.tool.as_deref() {
        Some(tool) if !tool.is_empty() => tool,
        _ => {
            return Envelope::error(
                "Tool parameter is required for add action",
                "Adding an operation requires naming the tool to execute",
                "Specify a registered tool name",
                Some(queue.registry().tool_names()),
                "MISSING_TOOL",
            )
        }
    };
    let parameters = match command.parameters {
        Some(parameters) => parameters,
        None => {
            return Envelope::error(
                "Parameters object is required for add action",
                "Adding an operation requires a parameters document for the tool",
                "Provide a parameters object with the fields the tool expects",
                None,
                "MISSING_PARAMETERS",
            )
        }
    };

    let id = queue.enqueue(tool, parameters).await;
    let stats = queue.stats().await;
    Envelope::success(
        format!("Operation queued successfully with ID: {id}"),
        json!({
            "operation_id": id,
            "tool": tool,
            "queued_at": format_utc(&Utc::now()),
            "queue_stats": to_json(&stats),
        }),
    )
}

async fn execute_batch(queue: &OperationQueue) -> Envelope {
    let summary = queue.execute_batch().await;
    let message = if summary.total_operations == 0 {
        "No pending operations to execute.".to_string()
    } else {
        format!(
            "Batch executed: {} successful, {} failed",
            summary.successful, summary.failed
        )
    };
    Envelope::success(message, to_json(&summary))
}

async fn list_operations(queue: &OperationQueue, command: QueueCommand) -> Envelope {
    let filter = match parse_status_filter(command.status.as_deref()) {
        Ok(filter) => filter,
        Err(envelope) => return envelope,
    };

    let mut operations = queue.query(filter).await;
    if let Some(limit) = command.limit {
        if limit > 0 {
            operations.truncate(limit as usize);
        }
    }

    let status_filter = filter.map(|s| s.to_string());
    let message = match &status_filter {
        Some(status) => format!("Found {} operations with status '{status}'", operations.len()),
        None => format!("Found {} operations", operations.len()),
    };
    let stats = queue.stats().await;
    Envelope::success(
        message,
        json!({
            "operations": to_json(&operations),
            "total_count": operations.len(),
            "status_filter": status_filter,
            "queue_stats": to_json(&stats),
        }),
    )
}

async fn clear_queue(queue: &OperationQueue, command: QueueCommand) -> Envelope {
    let filter = match parse_status_filter(command.status.as_deref()) {
        Ok(filter) => filter,
        Err(envelope) => return envelope,
    };

    let removed = queue.clear(filter).await;
    let status_filter = filter.map(|s| s.to_string());
    let message = match &status_filter {
        Some(status) => format!("Cleared {removed} operations with status '{status}'"),
        None => format!("Cleared {removed} completed operations from queue"),
    };
    let stats = queue.stats().await;
    Envelope::success(
        message,
        json!({
            "removed_count": removed,
            "status_filter": status_filter,
            "queue_stats": to_json(&stats),
        }),
    )
}

async fn queue_stats(queue: &OperationQueue) -> Envelope {
    let stats = queue.stats().await;
    Envelope::success("Queue statistics retrieved", to_json(&stats))
}

async fn remove_operation(queue: &OperationQueue, command: QueueCommand) -> Envelope {
    let id = match command.operation_id.as_deref() {
        Some(id) if !id.is_empty() => id,
        _ => {
            return Envelope::error(
                "Operation ID is required for remove action",
                "Removing a specific operation requires its id",
                "Use the list action to see queued operation ids",
                None,
                "MISSING_OPERATION_ID",
            )
        }
    };

    if queue.remove(id).await {
        let stats = queue.stats().await;
        Envelope::success(
            format!("Operation {id} removed from queue"),
            json!({
                "operation_id": id,
                "queue_stats": to_json(&stats),
            }),
        )
    } else {
        Envelope::error(
            format!("Operation {id} not found in queue"),
            "Specified operation id does not exist in the queue",
            "Use the list action to see queued operation ids",
            None,
            "OPERATION_NOT_FOUND",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{FnHandler, ToolRegistry};
    use std::sync::Arc;

    fn facade_queue() -> OperationQueue {
        let mut registry = ToolRegistry::new();
        registry.register(FnHandler::new("echo", |params| Ok(params)));
        OperationQueue::new(Arc::new(registry))
    }

    fn command(action: &str) -> QueueCommand {
        QueueCommand {
            action: Some(action.to_string()),
            ..QueueCommand::default()
        }
    }

    fn error_code(envelope: &Envelope) -> &str {
        match envelope {
            Envelope::Error { error_code, .. } => error_code,
            Envelope::Success { .. } => panic!("expected error envelope"),
        }
    }

    fn success_data(envelope: &Envelope) -> &JsonValue {
        match envelope {
            Envelope::Success { data, .. } => data,
            Envelope::Error { message, .. } => panic!("expected success envelope: {message}"),
        }
    }

    #[tokio::test]
    async fn missing_action_is_a_structured_error() {
        let queue = facade_queue();
        let response = handle(&queue, QueueCommand::default()).await;
        assert_eq!(error_code(&response), "MISSING_ACTION");
    }

    #[tokio::test]
    async fn unknown_action_is_a_structured_error() {
        let queue = facade_queue();
        let response = handle(&queue, command("teleport")).await;
        assert_eq!(error_code(&response), "UNKNOWN_ACTION");
        match &response {
            Envelope::Error { valid_values, .. } => {
                assert_eq!(valid_values.as_deref(), Some(&ACTIONS.map(String::from)[..]));
            }
            _ => panic!("expected error envelope"),
        }
    }

    #[tokio::test]
    async fn add_requires_tool_and_parameters() {
        let queue = facade_queue();

        let response = handle(&queue, command("add")).await;
        assert_eq!(error_code(&response), "MISSING_TOOL");

        let mut with_tool = command("add");
        with_tool.tool = Some("echo".to_string());
        let response = handle(&queue, with_tool).await;
        assert_eq!(error_code(&response), "MISSING_PARAMETERS");
    }

    #[tokio::test]
    async fn invalid_status_filter_is_rejected() {
        let queue = facade_queue();
        let mut list = command("list");
        list.status = Some("finished".to_string());
        let response = handle(&queue, list).await;
        assert_eq!(error_code(&response), "INVALID_STATUS");
    }

    #[tokio::test]
    async fn list_honours_the_limit() {
        let queue = facade_queue();
        for n in 0..5 {
            queue.enqueue("echo", json!({"n": n})).await;
        }
        let mut list = command("list");
        list.limit = Some(2);
        let response = handle(&queue, list).await;
        let data = success_data(&response);
        assert_eq!(data["operations"].as_array().map(Vec::len), Some(2));
        assert_eq!(data["total_count"], json!(2));
    }

    #[tokio::test]
    async fn remove_missing_operation_is_not_found() {
        let queue = facade_queue();
        let mut remove = command("remove");
        remove.operation_id = Some("op_99".to_string());
        let response = handle(&queue, remove).await;
        assert_eq!(error_code(&response), "OPERATION_NOT_FOUND");

        let response = handle(&queue, command("remove")).await;
        assert_eq!(error_code(&response), "MISSING_OPERATION_ID");
    }

    #[tokio::test]
    async fn envelope_serializes_with_status_tag() {
        let success = Envelope::success("ok", json!({"k": "v"}));
        let rendered = serde_json::to_value(&success).expect("serialize");
        assert_eq!(rendered["status"], json!("success"));
        assert_eq!(rendered["message"], json!("ok"));
        assert_eq!(rendered["data"]["k"], json!("v"));

        let error = Envelope::internal_error("boom");
        let rendered = serde_json::to_value(&error).expect("serialize");
        assert_eq!(rendered["status"], json!("error"));
        assert_eq!(rendered["error_code"], json!("INTERNAL_ERROR"));
        assert!(rendered.get("context").is_none());
    }

    #[tokio::test]
    async fn full_queue_lifecycle_round_trip() {
        let queue = facade_queue();

        // add
        let mut add = command("add");
        add.tool = Some("echo".to_string());
        add.parameters = Some(json!({"msg": "hi"}));
        let response = handle(&queue, add).await;
        let data = success_data(&response);
        let operation_id = data["operation_id"].as_str().expect("operation id");
        assert!(!operation_id.is_empty());
        assert_eq!(data["queue_stats"]["pending"], json!(1));

        // execute
        let response = handle(&queue, command("execute")).await;
        let data = success_data(&response);
        assert_eq!(data["total_operations"], json!(1));
        assert_eq!(data["successful"], json!(1));
        assert_eq!(data["failed"], json!(0));
        assert_eq!(data["results"][0]["status"], json!("success"));
        assert_eq!(data["results"][0]["result"]["msg"], json!("hi"));

        // list
        let response = handle(&queue, command("list")).await;
        let data = success_data(&response);
        assert_eq!(data["operations"].as_array().map(Vec::len), Some(1));
        assert_eq!(data["operations"][0]["status"], json!("executed"));

        // clear
        let response = handle(&queue, command("clear")).await;
        let data = success_data(&response);
        assert_eq!(data["removed_count"], json!(1));

        // stats
        let response = handle(&queue, command("stats")).await;
        let data = success_data(&response);
        assert_eq!(data["total_operations"], json!(0));
    }

    #[tokio::test]
    async fn executing_an_empty_queue_is_a_success() {
        let queue = facade_queue();
        let response = handle(&queue, command("execute")).await;
        assert!(response.is_success());
        let data = success_data(&response);
        assert_eq!(data["total_operations"], json!(0));
        match &response {
            Envelope::Success { message, .. } => {
                assert_eq!(message, "No pending operations to execute.")
            }
            _ => unreachable!(),
        }
    }
}
