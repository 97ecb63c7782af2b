use crate::router::ToolRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Lifecycle position of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Executed,
    Failed,
}

impl OperationStatus {
    pub const VALUES: [&'static str; 3] = ["pending", "executed", "failed"];
}

impl FromStr for OperationStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "executed" => Ok(Self::Executed),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Executed => write!(f, "executed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status plus its associated payload. A record carries a result exactly when
/// it is executed, and an error exactly when it is failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OperationState {
    Pending,
    Executed { result: JsonValue },
    Failed { error: String },
}

impl OperationState {
    pub fn status(&self) -> OperationStatus {
        match self {
            Self::Pending => OperationStatus::Pending,
            Self::Executed { .. } => OperationStatus::Executed,
            Self::Failed { .. } => OperationStatus::Failed,
        }
    }
}

/// One queued tool invocation. Callers only ever see clones of these; the
/// queue keeps the sole mutable copy.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedOperation {
    pub id: String,
    pub tool: String,
    pub parameters: JsonValue,
    #[serde(serialize_with = "serialize_utc")]
    pub queued_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: OperationState,
}

/// Per-record outcome reported inside a batch summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchEntry {
    pub id: String,
    pub tool: String,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BatchOutcome {
    Success { result: JsonValue },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total_operations: usize,
    pub successful: usize,
    pub failed: usize,
    #[serde(serialize_with = "serialize_utc")]
    pub execution_time: DateTime<Utc>,
    pub results: Vec<BatchEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total_operations: usize,
    pub pending: usize,
    pub executed: usize,
    pub failed: usize,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_utc"
    )]
    pub oldest_operation: Option<DateTime<Utc>>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_utc"
    )]
    pub newest_operation: Option<DateTime<Utc>>,
}

pub fn format_utc(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn serialize_utc<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_utc(ts))
}

fn serialize_opt_utc<S: Serializer>(
    ts: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match ts {
        Some(ts) => serialize_utc(ts, serializer),
        None => serializer.serialize_none(),
    }
}

struct QueueState {
    next_id: u64,
    operations: Vec<QueuedOperation>,
}

/// Thread-safe buffer of tool invocations with atomic batch execution.
///
/// All shared state (the record collection and the id counter) lives behind a
/// single mutex, so id allocation plus append is atomic and a batch's snapshot
/// of pending records cannot race with a concurrent enqueue, clear, or remove.
/// The lock is held for the whole batch, handler execution included; handlers
/// must not call back into the queue.
pub struct OperationQueue {
    registry: Arc<ToolRegistry>,
    inner: Mutex<QueueState>,
}

impl OperationQueue {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            inner: Mutex::new(QueueState {
                next_id: 1,
                operations: Vec::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Appends a pending record and returns its freshly allocated id. The tool
    /// name is not checked against the registry here; an unknown tool is only
    /// reported when the batch runs.
    pub async fn enqueue(&self, tool: &str, parameters: JsonValue) -> String {
        let mut state = self.inner.lock().await;
        let id = format!("op_{}", state.next_id);
        state.next_id += 1;
        state.operations.push(QueuedOperation {
            id: id.clone(),
            tool: tool.to_string(),
            parameters,
            queued_at: Utc::now(),
            state: OperationState::Pending,
        });
        tracing::debug!(%id, %tool, "operation queued");
        id
    }

    /// Executes every record that is pending when the call acquires the lock,
    /// in enqueue order. A failing handler marks its own record failed and the
    /// batch moves on; records enqueued while the batch runs wait for the next
    /// call.
    pub async fn execute_batch(&self) -> BatchSummary {
        let mut state = self.inner.lock().await;
        let selected: Vec<usize> = state
            .operations
            .iter()
            .enumerate()
            .filter(|(_, op)| op.state.status() == OperationStatus::Pending)
            .map(|(idx, _)| idx)
            .collect();

        if selected.is_empty() {
            return BatchSummary {
                total_operations: 0,
                successful: 0,
                failed: 0,
                execution_time: Utc::now(),
                results: Vec::new(),
            };
        }

        tracing::info!(count = selected.len(), "executing operation batch");
        let mut results = Vec::with_capacity(selected.len());
        let mut successful = 0;
        let mut failed = 0;

        for idx in selected.iter().copied() {
            let (id, tool, params) = {
                let op = &state.operations[idx];
                (op.id.clone(), op.tool.clone(), op.parameters.clone())
            };
            let outcome = match self.registry.resolve(&tool) {
                Ok(handler) => handler
                    .execute(params)
                    .await
                    .map_err(|err| err.to_string()),
                Err(err) => Err(err.to_string()),
            };
            let op = &mut state.operations[idx];
            match outcome {
                Ok(result) => {
                    op.state = OperationState::Executed {
                        result: result.clone(),
                    };
                    successful += 1;
                    results.push(BatchEntry {
                        id,
                        tool,
                        outcome: BatchOutcome::Success { result },
                    });
                }
                Err(error) => {
                    tracing::error!(%id, %tool, %error, "operation failed");
                    op.state = OperationState::Failed {
                        error: error.clone(),
                    };
                    failed += 1;
                    results.push(BatchEntry {
                        id,
                        tool,
                        outcome: BatchOutcome::Failed { error },
                    });
                }
            }
        }

        BatchSummary {
            total_operations: selected.len(),
            successful,
            failed,
            execution_time: Utc::now(),
            results,
        }
    }

    /// Returns snapshots of all records, oldest first, optionally narrowed to
    /// one status.
    pub async fn query(&self, filter: Option<OperationStatus>) -> Vec<QueuedOperation> {
        let state = self.inner.lock().await;
        let mut snapshot: Vec<QueuedOperation> = state
            .operations
            .iter()
            .filter(|op| filter.map_or(true, |status| op.state.status() == status))
            .cloned()
            .collect();
        snapshot.sort_by_key(|op| op.queued_at);
        snapshot
    }

    /// Without a filter, drops every executed or failed record and leaves
    /// pending work alone. With a filter, drops exactly the matching status,
    /// pending included.
    pub async fn clear(&self, filter: Option<OperationStatus>) -> usize {
        let mut state = self.inner.lock().await;
        let before = state.operations.len();
        match filter {
            None => state
                .operations
                .retain(|op| op.state.status() == OperationStatus::Pending),
            Some(status) => state.operations.retain(|op| op.state.status() != status),
        }
        let removed = before - state.operations.len();
        tracing::debug!(removed, "cleared operations from queue");
        removed
    }

    /// Removes a single record by id, whatever its status. Returns whether a
    /// record was found.
    pub async fn remove(&self, id: &str) -> bool {
        let mut state = self.inner.lock().await;
        let before = state.operations.len();
        state.operations.retain(|op| op.id != id);
        before != state.operations.len()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.inner.lock().await;
        let count_with = |status: OperationStatus| {
            state
                .operations
                .iter()
                .filter(|op| op.state.status() == status)
                .count()
        };
        QueueStats {
            total_operations: state.operations.len(),
            pending: count_with(OperationStatus::Pending),
            executed: count_with(OperationStatus::Executed),
            failed: count_with(OperationStatus::Failed),
            oldest_operation: state.operations.iter().map(|op| op.queued_at).min(),
            newest_operation: state.operations.iter().map(|op| op.queued_at).max(),
        }
    }
}
