use crate::AgentError;
use crate::channel::ChannelDelivery;
use crate::conversation::ConversationStore;
use crate::events::{EventEmitter, EventKind, RuntimeEvent, emit_quiet};
use chrono::{DateTime, Utc};
use relay_llm::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledReminder {
    pub id: String,
    pub conversation_id: String,
    pub fire_at: DateTime<Utc>,
}

pub struct ReminderScheduler {
    conversations: Arc<ConversationStore>,
    channel: Arc<dyn ChannelDelivery>,
    emitter: Arc<dyn EventEmitter>,
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ReminderScheduler {
    pub fn new(
        conversations: Arc<ConversationStore>,
        channel: Arc<dyn ChannelDelivery>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            conversations,
            channel,
            emitter,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn schedule(
        &self,
        conversation_id: &str,
        text: &str,
        delay: Duration,
    ) -> Result<ScheduledReminder, AgentError> {
        if !self.conversations.contains(conversation_id) {
            return Err(AgentError::ConversationNotFound(
                conversation_id.to_string(),
            ));
        }

        let reminder = ScheduledReminder {
            id: format!("rem-{}", Uuid::new_v4().simple()),
            conversation_id: conversation_id.to_string(),
            fire_at: chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| Utc::now().checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        let conversations = self.conversations.clone();
        let channel = self.channel.clone();
        let emitter = self.emitter.clone();
        let conversation_id = conversation_id.to_string();
        let text = text.to_string();
        let reminder_id = reminder.id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(
                &conversations,
                channel.as_ref(),
                emitter.as_ref(),
                &reminder_id,
                &conversation_id,
                &text,
            )
            .await;
        });

        let mut pending = self.pending();
        pending.retain(|_, handle| !handle.is_finished());
        pending.insert(reminder.id.clone(), handle);
        tracing::debug!(
            reminder_id = %reminder.id,
            conversation_id = %reminder.conversation_id,
            delay_secs = delay.as_secs(),
            "reminder scheduled"
        );
        Ok(reminder)
    }

    pub fn cancel(&self, reminder_id: &str) -> bool {
        match self.pending().remove(reminder_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    pub fn shutdown(&self) {
        for (_, handle) in self.pending().drain() {
            handle.abort();
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn fire(
    conversations: &ConversationStore,
    channel: &dyn ChannelDelivery,
    emitter: &dyn EventEmitter,
    reminder_id: &str,
    conversation_id: &str,
    text: &str,
) {
    let Some(conversation) = conversations.get(conversation_id) else {
        tracing::debug!(reminder_id, conversation_id, "reminder target conversation is gone");
        return;
    };
    let body = format!("Reminder: {text}");
    {
        let _turn = conversations.acquire_turn(conversation_id).await.ok();
        if let Err(error) = conversations.append(conversation_id, Message::system(body.clone())) {
            tracing::warn!(reminder_id, conversation_id, %error, "failed to record reminder");
        }
    }
    if let Err(error) = channel
        .deliver(conversation_id, conversation.channel_target.as_deref(), &body)
        .await
    {
        tracing::warn!(reminder_id, conversation_id, %error, "reminder delivery failed");
    }
    tracing::info!(reminder_id, conversation_id, "reminder fired");
    emit_quiet(
        emitter,
        RuntimeEvent::new(EventKind::ReminderFired, Some(conversation_id))
            .with("reminder_id", reminder_id),
    );
}
