//! Fine-tuning capability contract and the records exchanged through it.

use crate::models::{FunctionDescriptor, FunctionExample, ModelConfig, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a provider fine-tune job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    ValidatingFiles,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Any status this crate does not know about; treated as still running
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// A fine-tune job as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinetuneJob {
    pub id: String,
    pub status: JobStatus,
    /// Name of the resulting model, present once the job succeeded
    #[serde(default)]
    pub fine_tuned_model: Option<String>,
    /// Unix seconds
    #[serde(default)]
    pub created_at: Option<i64>,
}

/// One chat message of a training record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One example in the provider's chat fine-tuning schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinetuneRecord {
    pub messages: Vec<ChatMessage>,
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl FinetuneRecord {
    /// Format an example with the prompt templates of `model`.
    pub fn from_example(
        descriptor: &FunctionDescriptor,
        model: &ModelConfig,
        example: &FunctionExample,
    ) -> Self {
        let args = Value::Array(example.args.clone());
        let kwargs = serde_json::to_string(&example.kwargs).unwrap_or_default();
        let prompt = format!(
            "{}\nFunction: {}\n---\nInputs:\nArgs: {}\nKwargs: {}\nOutput:",
            model.instructions,
            descriptor.describe(),
            args,
            kwargs
        );
        Self {
            messages: vec![
                ChatMessage::system(model.system_message.clone()),
                ChatMessage::user(prompt),
                ChatMessage::assistant(render(&example.output)),
            ],
        }
    }
}

/// Everything needed to submit one fine-tune job.
#[derive(Debug, Clone)]
pub struct FinetuneRequest {
    /// Model to fine-tune
    pub base_model: String,
    /// Suffix embedded in the resulting model name
    pub suffix: String,
    pub records: Vec<FinetuneRecord>,
}

impl FinetuneRequest {
    /// Training file contents, one record per line.
    pub fn to_jsonl(&self) -> String {
        self.records
            .iter()
            .filter_map(|record| serde_json::to_string(record).ok())
            .map(|line| line + "\n")
            .collect()
    }
}

/// Provider capable of training and reporting fine-tuned models.
#[async_trait]
pub trait Finetunable: Send + Sync {
    /// Most recent fine-tune jobs, newest first.
    async fn list_finetuned(&self, limit: usize) -> Result<Vec<FinetuneJob>>;

    /// Current state of one job.
    async fn get_finetuned(&self, job_id: &str) -> Result<FinetuneJob>;

    /// Submit a new job.
    async fn finetune(&self, request: FinetuneRequest) -> Result<FinetuneJob>;
}
