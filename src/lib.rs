//! distillery - Adaptive teacher-to-student distillation for LLM-backed functions.
//!
//! ## Architecture
//!
//! Each patched function starts on large teacher models. Every call feeds a
//! deduplicated dataset; once it is big enough a cheaper student model is
//! fine-tuned on it and takes over, and falls back to the teachers again if
//! it starts producing faults.
//!
//! - **Storage**: Bloom-filter deduplication, buffered append-only datasets,
//!   atomic per-function config records
//! - **Provider**: fine-tuning backends behind the async `Finetunable` trait
//! - **Engine**: model selection, example capture and the fine-tune lifecycle
//!
//! ## Fine-tune lifecycle
//!
//! - Idle → Requested once `alignments + patches > base · 2^runs`
//! - Requested → Idle when the polled job succeeds (model promoted) or fails
//! - A recent fault rate above one half reverts to the teachers

pub mod engine;
pub mod models;
pub mod provider;
pub mod storage;

// Re-exports for convenience
pub use engine::{DistillationEngine, ModelChoice, ModelSelection};
pub use models::{
    Config, DistilleryError, FunctionConfig, FunctionDescriptor, FunctionExample, FunctionPolicy,
    ModelConfig, Result,
};
pub use provider::{Finetunable, OpenAiClient, ProviderRegistry};
pub use storage::{FilesystemAdapter, PersistenceAdapter};
