use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::IntegrationError;
use crate::flows::registry::FlowRegistry;

/// Replies to free text that starts no flow.
#[async_trait]
pub trait AnswerSource: Send + Sync {
    async fn answer(&self, message: &str) -> Result<String, IntegrationError>;
}

/// Points the user at the products the bot can sell.
pub struct FlowMenuAnswerSource {
    registry: Arc<FlowRegistry>,
}

impl FlowMenuAnswerSource {
    pub fn new(registry: Arc<FlowRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl AnswerSource for FlowMenuAnswerSource {
    async fn answer(&self, _message: &str) -> Result<String, IntegrationError> {
        let names: Vec<&str> =
            self.registry.flows().map(|flow| flow.display_name.as_str()).collect();
        if names.is_empty() {
            return Ok("I can connect you with one of our agents. Just ask for a human.".to_owned());
        }
        Ok(format!(
            "I can help you buy {}. Tell me which cover you need, or ask for a human agent.",
            names.join(", ")
        ))
    }
}
