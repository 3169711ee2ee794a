use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Outbound delivery to whatever chat surface a conversation is attached to.
/// Failures are logged by callers and never roll back runtime state.
#[async_trait]
pub trait ChannelDelivery: Send + Sync {
    async fn deliver(
        &self,
        conversation_id: &str,
        channel_target: Option<&str>,
        text: &str,
    ) -> Result<(), String>;
}

#[derive(Default)]
pub struct NoopChannel;

#[async_trait]
impl ChannelDelivery for NoopChannel {
    async fn deliver(
        &self,
        _conversation_id: &str,
        _channel_target: Option<&str>,
        _text: &str,
    ) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub conversation_id: String,
    pub channel_target: Option<String>,
    pub text: String,
}

/// Keeps every delivery in memory; used by embedders that poll for output.
#[derive(Clone, Default)]
pub struct BufferedChannel {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl BufferedChannel {
    pub fn snapshot(&self) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ChannelDelivery for BufferedChannel {
    async fn deliver(
        &self,
        conversation_id: &str,
        channel_target: Option<&str>,
        text: &str,
    ) -> Result<(), String> {
        self.deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Delivery {
                conversation_id: conversation_id.to_string(),
                channel_target: channel_target.map(str::to_string),
                text: text.to_string(),
            });
        Ok(())
    }
}
