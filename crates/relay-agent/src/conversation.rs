use crate::AgentError;
use chrono::{DateTime, Utc};
use relay_llm::Message;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

pub fn child_queue_key(child_conversation_id: &str) -> String {
    format!("subagent:{child_conversation_id}")
}

#[derive(Clone, Debug, PartialEq)]
pub struct Conversation {
    pub id: String,
    /// Turns holding the same key run one at a time.
    pub queue_key: String,
    pub parent_conversation_id: Option<String>,
    pub channel_target: Option<String>,
    pub model_override: Option<String>,
    pub thinking_override: Option<String>,
    /// Zero for user-facing conversations, parent depth + 1 for children.
    pub depth: usize,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct NewConversation {
    pub id: Option<String>,
    pub parent_conversation_id: Option<String>,
    pub channel_target: Option<String>,
    pub model_override: Option<String>,
    pub thinking_override: Option<String>,
    pub depth: usize,
}

impl NewConversation {
    pub fn child_of(parent: &Conversation) -> Self {
        Self {
            parent_conversation_id: Some(parent.id.clone()),
            channel_target: parent.channel_target.clone(),
            depth: parent.depth + 1,
            ..Self::default()
        }
    }
}

/// In-memory conversation histories plus the per-queue-key turn locks.
#[derive(Default)]
pub struct ConversationStore {
    conversations: Mutex<HashMap<String, Conversation>>,
    queues: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Child conversations get a dedicated queue key so they never wait on
    /// the parent's inbound traffic.
    pub fn create(&self, request: NewConversation) -> Conversation {
        let id = request.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let queue_key = if request.parent_conversation_id.is_some() {
            child_queue_key(&id)
        } else {
            id.clone()
        };
        let conversation = Conversation {
            id: id.clone(),
            queue_key,
            parent_conversation_id: request.parent_conversation_id,
            channel_target: request.channel_target,
            model_override: request.model_override,
            thinking_override: request.thinking_override,
            depth: request.depth,
            messages: Vec::new(),
            created_at: Utc::now(),
        };
        self.lock().insert(id, conversation.clone());
        conversation
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn messages(&self, id: &str) -> Result<Vec<Message>, AgentError> {
        self.lock()
            .get(id)
            .map(|conversation| conversation.messages.clone())
            .ok_or_else(|| AgentError::ConversationNotFound(id.to_string()))
    }

    pub fn append(&self, id: &str, message: Message) -> Result<(), AgentError> {
        self.extend(id, vec![message])
    }

    pub fn extend(&self, id: &str, messages: Vec<Message>) -> Result<(), AgentError> {
        let mut conversations = self.lock();
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| AgentError::ConversationNotFound(id.to_string()))?;
        conversation.messages.extend(messages);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<Conversation> {
        let removed = self.lock().remove(id);
        if let Some(conversation) = &removed {
            self.queues
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&conversation.queue_key);
        }
        removed
    }

    /// Waits for exclusive use of the conversation's queue key.
    pub async fn acquire_turn(&self, id: &str) -> Result<OwnedMutexGuard<()>, AgentError> {
        let queue_key = self
            .get(id)
            .map(|conversation| conversation.queue_key)
            .ok_or_else(|| AgentError::ConversationNotFound(id.to_string()))?;
        let queue = self
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(queue_key)
            .or_default()
            .clone();
        Ok(queue.lock_owned().await)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Conversation>> {
        self.conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
