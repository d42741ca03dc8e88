use crate::context::ConversationContext;
use crate::crm_client::CrmApi;
use crate::flows::{self, FlowNode};
use crate::openai_types::{OpenAIMessage, OpenAITool, OpenAIToolCall};
use crate::tools::{self, ToolCall, ToolOutcome};

use chrono::NaiveDateTime;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Drives one call through the conversation graph.
pub struct FlowManager {
    node: FlowNode,
    ctx: ConversationContext,
    /// user, assistant and tool messages, oldest first
    history: Vec<OpenAIMessage>,
    crm: Arc<dyn CrmApi>,
    /// Whether the assistant has replied since the active node was entered
    replied_in_node: bool,
}

impl FlowManager {
    pub fn new(ctx: ConversationContext, crm: Arc<dyn CrmApi>) -> Self {
        let node = flows::initial_node(&ctx);
        info!(node = node.name, "starting conversation flow");
        Self {
            node,
            ctx,
            history: vec![],
            crm,
            replied_in_node: false,
        }
    }

    pub fn node(&self) -> &FlowNode {
        &self.node
    }

    pub fn context(&self) -> &ConversationContext {
        &self.ctx
    }

    pub fn history(&self) -> &[OpenAIMessage] {
        &self.history
    }

    /// Messages for the next completion request.
    pub fn messages(&self) -> Vec<OpenAIMessage> {
        self.node
            .role_messages
            .iter()
            .chain(self.node.task_messages.iter())
            .chain(self.history.iter())
            .cloned()
            .collect()
    }

    pub fn tools(&self) -> Vec<OpenAITool> {
        self.node.functions.iter().map(|f| f.to_tool()).collect()
    }

    pub fn record_user(&mut self, text: &str) {
        let text = text.trim();
        if !text.is_empty() {
            self.history.push(OpenAIMessage::user(text));
        }
    }

    pub fn record_assistant(&mut self, text: &str) {
        let text = text.trim();
        if !text.is_empty() {
            self.history.push(OpenAIMessage::assistant(text));
            self.replied_in_node = true;
        }
    }

    pub fn record_tool_calls(&mut self, content: Option<String>, calls: Vec<OpenAIToolCall>) {
        let content = content.filter(|c| !c.trim().is_empty());
        self.history
            .push(OpenAIMessage::assistant_tool_calls(content, calls));
    }

    /// Run one tool call and append its result to the history.
    pub async fn handle_tool_call(&mut self, call: &OpenAIToolCall, now: NaiveDateTime) {
        let name = call.function.name.as_str();
        let outcome = if !self.node.offers(name) {
            warn!(function = name, node = self.node.name, "function not offered by active node");
            ToolOutcome::error(format!("The function {name} is not available right now."))
        } else {
            match ToolCall::parse(name, &call.function.arguments) {
                Ok(parsed) => tools::handle(parsed, &mut self.ctx, self.crm.as_ref(), now).await,
                Err(e) => {
                    warn!(error=%e, "failed to parse tool call");
                    ToolOutcome::error(e)
                }
            }
        };
        debug!(function = name, result=%outcome.result, "tool call finished");
        self.history
            .push(OpenAIMessage::tool_result(&call.id, outcome.result.to_string()));
        if let Some(next) = outcome.next_node {
            self.set_node(next);
        }
    }

    fn set_node(&mut self, node: FlowNode) {
        info!(from = self.node.name, to = node.name, "flow transition");
        self.node = node;
        self.replied_in_node = false;
    }

    /// True once the reply of a node that ends the conversation has been produced.
    pub fn should_end(&self) -> bool {
        self.node.ends_conversation() && self.replied_in_node
    }
}
