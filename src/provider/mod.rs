//! Provider module - fine-tuning backends.

mod finetune;
mod openai;
mod registry;

pub use finetune::*;
pub use openai::*;
pub use registry::*;
