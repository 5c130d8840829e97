//! Concrete LLM providers.

mod openai;

pub use openai::{register_openai, OpenAiProvider};
