//! Prompt construction for LLM-driven passes

pub mod prompt;

pub use prompt::{PromptBuilder, TagExample};
