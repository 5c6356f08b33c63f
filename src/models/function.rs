//! Function identity, model assignment and persisted per-function state.

use super::example::approximate_token_count;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Maximum number of fault flags kept per function.
pub const FAULT_HISTORY: usize = 100;

/// Number of most recent flags averaged when deciding on reversion.
pub const FAULT_WINDOW: usize = 10;

/// Reversion fires when the windowed fault rate is strictly above this.
pub const FAULT_THRESHOLD: f64 = 0.5;

/// Whether a function produces values or embeddings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    #[default]
    Symbolic,
    Embeddable,
}

/// Resolved description of a patched function.
///
/// Produced by the signature extractor; treated here as an opaque value whose
/// identity depends only on the description, never on call arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,
    #[serde(default)]
    pub docstring: String,
    #[serde(default)]
    pub input_type_hints: BTreeMap<String, String>,
    pub output_type_hint: String,
    #[serde(default)]
    pub kind: FunctionKind,
}

impl FunctionDescriptor {
    pub fn new(
        name: impl Into<String>,
        docstring: impl Into<String>,
        input_type_hints: BTreeMap<String, String>,
        output_type_hint: impl Into<String>,
        kind: FunctionKind,
    ) -> Self {
        Self {
            name: name.into(),
            docstring: docstring.into(),
            input_type_hints,
            output_type_hint: output_type_hint.into(),
            kind,
        }
    }

    fn canonical(&self) -> String {
        let inputs: Vec<String> = self
            .input_type_hints
            .iter()
            .map(|(name, hint)| format!("{name}:{hint}"))
            .collect();
        let kind = match self.kind {
            FunctionKind::Symbolic => "symbolic",
            FunctionKind::Embeddable => "embeddable",
        };
        format!(
            "{}\n{}\n{}\n{}\n{}",
            self.name,
            self.docstring,
            inputs.join(";"),
            self.output_type_hint,
            kind
        )
    }

    /// Content hash naming this function's datasets and config record.
    pub fn hash(&self) -> String {
        let digest = format!("{:x}", Sha256::digest(self.canonical().as_bytes()));
        digest[..32].to_string()
    }

    /// Short tag embedded in provider model names.
    pub fn finetune_hash(&self) -> String {
        let digest = format!(
            "{:x}",
            Sha256::digest(format!("finetune\n{}", self.canonical()).as_bytes())
        );
        digest[..8].to_string()
    }

    /// Human-readable description used in fine-tuning prompts.
    pub fn describe(&self) -> String {
        let inputs: Vec<String> = self
            .input_type_hints
            .iter()
            .map(|(name, hint)| format!("{name}: {hint}"))
            .collect();
        format!(
            "def {}({}) -> {}\n\"\"\"{}\"\"\"",
            self.name,
            inputs.join(", "),
            self.output_type_hint,
            self.docstring
        )
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_system_message() -> String {
    "You are a skillful and accurate language model, who applies a described function on input data. \
     Make sure the function is applied accurately and correctly and the outputs follow the output type hints \
     and are valid outputs given the output types."
        .to_string()
}

fn default_instructions() -> String {
    "You are given below a function description and input data. The function description of what the \
     function must carry out can be found in the Function section, with input and output type hints. \
     The input data can be found in Input section. Using the function description, apply the function \
     to the Input and return a valid output type, that is acceptable by the output_class_definition and \
     output_class_hint."
        .to_string()
}

/// One model endpoint and its prompt templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider model name; empty for a distilled model that is not trained yet
    #[serde(default)]
    pub model_name: String,

    /// Provider that serves and fine-tunes this model
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Maximum prompt + completion tokens
    pub context_length: usize,

    #[serde(default = "default_system_message")]
    pub system_message: String,

    #[serde(default = "default_instructions")]
    pub instructions: String,

    /// Cached approximate token count of `system_message`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message_token_count: Option<usize>,

    /// Cached approximate token count of `instructions`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_token_count: Option<usize>,
}

impl ModelConfig {
    pub fn new(model_name: impl Into<String>, provider: impl Into<String>, context_length: usize) -> Self {
        Self {
            model_name: model_name.into(),
            provider: provider.into(),
            context_length,
            system_message: default_system_message(),
            instructions: default_instructions(),
            system_message_token_count: None,
            instruction_token_count: None,
        }
        .with_token_counts()
    }

    /// Fill in the cached template token counts.
    pub fn with_token_counts(mut self) -> Self {
        if self.system_message_token_count.is_none() {
            self.system_message_token_count = Some(approximate_token_count(&self.system_message));
        }
        if self.instruction_token_count.is_none() {
            self.instruction_token_count = Some(approximate_token_count(&self.instructions));
        }
        self
    }

    /// Same endpoint and templates under another model name.
    pub fn renamed(&self, model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..self.clone()
        }
    }

    /// Tokens consumed by the templates before any function input.
    pub fn prompt_overhead_tokens(&self) -> usize {
        let system = self
            .system_message_token_count
            .unwrap_or_else(|| approximate_token_count(&self.system_message));
        let instructions = self
            .instruction_token_count
            .unwrap_or_else(|| approximate_token_count(&self.instructions));
        system + instructions
    }

    /// Whether a prompt of `prompt_tokens` fits in this model's context.
    pub fn fits(&self, prompt_tokens: usize) -> bool {
        self.prompt_overhead_tokens() + prompt_tokens <= self.context_length
    }

    pub fn is_trained(&self) -> bool {
        !self.model_name.is_empty()
    }
}

/// Statistics of the currently deployed distilled model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStats {
    /// Datapoints the current distilled model was trained on
    pub trained_on_datapoints: usize,

    /// Most recent fault flags, oldest first (1 = fault)
    #[serde(default)]
    pub running_faults: Vec<u8>,
}

/// Summary of the last completed fine-tune.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastTrainingRun {
    pub trained_on_datapoints: usize,
}

/// A submitted, not yet terminal fine-tune job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRun {
    pub job_id: String,
    pub trained_on_datapoints: usize,
    pub last_checked: DateTime<Utc>,
}

/// Persisted model assignment and training history for one function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub distilled_model: ModelConfig,
    pub teacher_models: Vec<ModelConfig>,
    #[serde(default)]
    pub current_model_stats: ModelStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_training_run: Option<LastTrainingRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_training_run: Option<TrainingRun>,
    #[serde(default)]
    pub nr_of_training_runs: u32,
}

impl FunctionConfig {
    /// Fresh config: untrained distilled model, given teachers, no history.
    pub fn new(student: &ModelConfig, teachers: Vec<ModelConfig>) -> Self {
        Self {
            distilled_model: student.renamed(""),
            teacher_models: teachers,
            current_model_stats: ModelStats::default(),
            last_training_run: None,
            current_training_run: None,
            nr_of_training_runs: 0,
        }
    }

    /// Rebuild history from a provider model name whose run index was decoded.
    pub fn reconstructed(
        distilled: ModelConfig,
        teachers: Vec<ModelConfig>,
        prior_index: u32,
        base_threshold: usize,
    ) -> Self {
        let trained_on = training_threshold(base_threshold, prior_index);
        Self {
            distilled_model: distilled,
            teacher_models: teachers,
            current_model_stats: ModelStats {
                trained_on_datapoints: trained_on,
                running_faults: Vec::new(),
            },
            last_training_run: Some(LastTrainingRun {
                trained_on_datapoints: trained_on,
            }),
            current_training_run: None,
            nr_of_training_runs: prior_index + 1,
        }
    }

    pub fn is_training(&self) -> bool {
        self.current_training_run.is_some()
    }

    /// Datapoints required before the next fine-tune is requested.
    pub fn finetune_threshold(&self, base_threshold: usize) -> usize {
        training_threshold(base_threshold, self.nr_of_training_runs)
    }

    /// Faults among the most recent `FAULT_WINDOW` flags, divided by
    /// `FAULT_WINDOW`. A short history counts its missing flags as clean.
    pub fn recent_fault_rate(&self) -> f64 {
        let faults = &self.current_model_stats.running_faults;
        let window = &faults[faults.len().saturating_sub(FAULT_WINDOW)..];
        window.iter().map(|&f| f as f64).sum::<f64>() / FAULT_WINDOW as f64
    }

    /// Record one outcome. Returns true if the distilled model was reverted.
    pub fn record_fault(&mut self, was_fault: bool) -> bool {
        let faults = &mut self.current_model_stats.running_faults;
        faults.push(u8::from(was_fault));
        if faults.len() > FAULT_HISTORY {
            let excess = faults.len() - FAULT_HISTORY;
            faults.drain(..excess);
        }

        if self.recent_fault_rate() > FAULT_THRESHOLD {
            self.distilled_model.model_name.clear();
            self.current_model_stats = ModelStats::default();
            return true;
        }
        false
    }

    /// Idle -> Requested.
    pub fn begin_training(&mut self, job_id: impl Into<String>, datapoints: usize, now: DateTime<Utc>) {
        self.current_training_run = Some(TrainingRun {
            job_id: job_id.into(),
            trained_on_datapoints: datapoints,
            last_checked: now,
        });
    }

    /// Requested -> Idle after a successful job: promote the new model.
    pub fn complete_training(&mut self, model_name: impl Into<String>) {
        let trained_on = self
            .current_training_run
            .take()
            .map(|run| run.trained_on_datapoints)
            .unwrap_or_default();
        self.distilled_model.model_name = model_name.into();
        self.last_training_run = Some(LastTrainingRun {
            trained_on_datapoints: trained_on,
        });
        self.current_model_stats = ModelStats {
            trained_on_datapoints: trained_on,
            running_faults: Vec::new(),
        };
        self.nr_of_training_runs += 1;
    }

    /// Requested -> Idle after a failed job.
    pub fn fail_training(&mut self) {
        self.current_training_run = None;
    }
}

/// `base · 2^runs`, saturating.
pub fn training_threshold(base_threshold: usize, runs: u32) -> usize {
    2usize
        .checked_pow(runs)
        .and_then(|factor| base_threshold.checked_mul(factor))
        .unwrap_or(usize::MAX)
}

/// Per-function behavior switches, held next to the function's config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionPolicy {
    /// Do not reconcile a freshly defaulted config against the provider
    pub skip_finetune_fetch: bool,
    /// Never evaluate the fine-tune threshold or poll jobs
    pub skip_finetune_execution: bool,
    /// Keep examples in memory only
    pub skip_data_storage: bool,
    /// Environment id encoded into model names (engine default when `None`)
    pub environment_id: Option<u32>,
    /// Teacher model names replacing the persisted teachers, in order
    pub teacher_override: Vec<String>,
}
