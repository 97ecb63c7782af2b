use crate::router::ToolHandler;
use async_trait::async_trait;
use color_eyre::eyre::{eyre, OptionExt, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

/// One tool invocation handed to the editor plugin over the long-poll channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeCommand {
    pub id: Uuid,
    pub tool: String,
    pub params: JsonValue,
}

/// Reply posted back by the plugin. Carries either a result payload or an
/// error string, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeReply {
    pub id: Uuid,
    #[serde(default)]
    pub result: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Shared channel state between tool handlers and the plugin-facing HTTP
/// endpoints: outbound invocations waiting for pickup, reply senders keyed by
/// invocation id, and a watch pair to wake long-pollers.
pub struct BridgeState {
    dispatch_queue: VecDeque<BridgeCommand>,
    reply_map: HashMap<Uuid, mpsc::UnboundedSender<Result<JsonValue>>>,
    waiter: watch::Receiver<()>,
    trigger: watch::Sender<()>,
}

pub type SharedBridge = Arc<Mutex<BridgeState>>;

impl BridgeState {
    pub fn new() -> Self {
        let (trigger, waiter) = watch::channel(());
        Self {
            dispatch_queue: VecDeque::new(),
            reply_map: HashMap::new(),
            waiter,
            trigger,
        }
    }

    pub fn shared() -> SharedBridge {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn pop_next(&mut self) -> Option<BridgeCommand> {
        self.dispatch_queue.pop_front()
    }

    pub fn waiter(&self) -> watch::Receiver<()> {
        self.waiter.clone()
    }

    /// Routes a plugin reply to whoever is awaiting that invocation id.
    pub fn complete(&mut self, reply: BridgeReply) -> Result<()> {
        let tx = self
            .reply_map
            .remove(&reply.id)
            .ok_or_eyre("Unknown invocation id")?;
        let outcome = match reply.error {
            Some(error) => Err(eyre!(error)),
            None => Ok(reply.result.unwrap_or(JsonValue::Null)),
        };
        tx.send(outcome)
            .map_err(|_| eyre!("Invocation was abandoned before the reply arrived"))
    }
}

impl Default for BridgeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Tool handler that performs its work inside the editor: the invocation is
/// queued for the plugin to pick up and the handler blocks until the plugin
/// posts the outcome back.
pub struct BridgeHandler {
    name: String,
    state: SharedBridge,
}

impl BridgeHandler {
    pub fn new(name: &str, state: SharedBridge) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state,
        })
    }
}

#[async_trait]
impl ToolHandler for BridgeHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, params: JsonValue) -> Result<JsonValue> {
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let trigger = {
            let mut state = self.state.lock().await;
            state.dispatch_queue.push_back(BridgeCommand {
                id,
                tool: self.name.clone(),
                params,
            });
            state.reply_map.insert(id, tx);
            state.trigger.clone()
        };
        trigger
            .send(())
            .map_err(|err| eyre!("Unable to wake the plugin channel: {err}"))?;
        tracing::debug!(%id, tool = %self.name, "invocation dispatched to editor");

        let result = rx
            .recv()
            .await
            .ok_or_eyre("Reply channel closed before the editor responded");
        {
            let mut state = self.state.lock().await;
            state.reply_map.remove(&id);
        }
        result?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Drives the plugin side of the channel in-process: picks up every
    /// dispatched invocation and replies using the given function.
    fn spawn_fake_plugin<F>(state: SharedBridge, reply_with: F)
    where
        F: Fn(&BridgeCommand) -> BridgeReply + Send + 'static,
    {
        tokio::spawn(async move {
            let mut waiter = { state.lock().await.waiter() };
            loop {
                let command = { state.lock().await.pop_next() };
                match command {
                    Some(command) => {
                        let reply = reply_with(&command);
                        state.lock().await.complete(reply).expect("reply routed");
                    }
                    None => {
                        if waiter.changed().await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn handler_round_trips_through_the_channel() {
        let state = BridgeState::shared();
        spawn_fake_plugin(Arc::clone(&state), |command| BridgeReply {
            id: command.id,
            result: Some(json!({"echoed": command.params.clone()})),
            error: None,
        });

        let handler = BridgeHandler::new("manage_scene", state);
        let out = handler
            .execute(json!({"action": "load", "name": "Main"}))
            .await
            .expect("plugin replied");
        assert_eq!(out["echoed"]["action"], json!("load"));
    }

    #[tokio::test]
    async fn error_reply_fails_the_invocation() {
        let state = BridgeState::shared();
        spawn_fake_plugin(Arc::clone(&state), |command| BridgeReply {
            id: command.id,
            result: None,
            error: Some("scene is read-only".to_string()),
        });

        let handler = BridgeHandler::new("manage_scene", state);
        let err = handler
            .execute(json!({"action": "save"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("scene is read-only"));
    }

    #[tokio::test]
    async fn reply_for_unknown_invocation_is_rejected() {
        let state = BridgeState::shared();
        let err = state
            .lock()
            .await
            .complete(BridgeReply {
                id: Uuid::new_v4(),
                result: Some(json!({})),
                error: None,
            })
            .unwrap_err();
        assert!(err.to_string().contains("Unknown invocation id"));
    }
}
