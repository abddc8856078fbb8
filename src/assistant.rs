use crate::errors::AppResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SUGGESTED_QUESTIONS: [&str; 3] = ["Explain the Trinity", "Law vs Grace?", "Why trust the Bible?"];

const RELATED_LESSON_ID: &str = "law-and-grace-1";

const CANNED_ANSWERS: [&str; 3] = [
    "The relationship between Law and Grace is beautifully explained in Romans 6:14: 'For sin will have no dominion over you, since you are not under law but under grace.' This doesn't mean the moral law is discarded, but rather that we're empowered by the Holy Spirit to fulfill its intent. Augustine wrote: 'The New Testament is concealed in the Old; the Old Testament is revealed in the New.'",
    "This is a deep theological question. The doctrine of the Trinity holds that God exists eternally as three distinct persons (Father, Son, and Holy Spirit) yet remains one God in essence. This is not tritheism (three gods) but rather a mystery revealed progressively through Scripture.",
    "Great question! The distinction between Israel and the Church is important for understanding God's covenant faithfulness. While believers are grafted into the promises through Christ (Romans 11), there remain specific promises to ethnic Israel that will be fulfilled in God's timing.",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantReply {
    pub answer: String,
    pub related_lesson_id: Option<String>,
}

/// Answers theology questions for the Ask Shield overlay.
pub trait Assistant: Send + Sync {
    fn ask(&self, question: &str) -> AppResult<AssistantReply>;
}

/// Picks one of a fixed set of answers, regardless of the question.
#[derive(Debug, Default, Clone, Copy)]
pub struct CannedAssistant;

impl Assistant for CannedAssistant {
    fn ask(&self, question: &str) -> AppResult<AssistantReply> {
        let index = rand::random_range(0..CANNED_ANSWERS.len());
        tracing::debug!(question_len = question.len(), answer = index, "canned assistant reply");
        Ok(AssistantReply {
            answer: CANNED_ANSWERS[index].to_string(),
            related_lesson_id: Some(RELATED_LESSON_ID.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_lesson_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Messages exchanged in the overlay since it was last reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Appends a user question. Blank questions are ignored and return `None`.
    pub fn push_question(&mut self, question: &str) -> Option<ChatMessage> {
        if question.trim().is_empty() {
            return None;
        }
        Some(self.push(ChatRole::User, question.to_string(), None))
    }

    pub fn push_reply(&mut self, reply: AssistantReply) -> ChatMessage {
        self.push(ChatRole::Assistant, reply.answer, reply.related_lesson_id)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    fn push(&mut self, role: ChatRole, content: String, related_lesson_id: Option<String>) -> ChatMessage {
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            related_lesson_id,
            created_at: Utc::now(),
        };
        self.messages.push(message.clone());
        message
    }
}
