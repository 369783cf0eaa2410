pub mod adapter;
pub mod llm_adapter;
pub mod llm_service;

pub use adapter::{BlockingAdapter, FnAdapter, ItemAdapter};
pub use llm_adapter::{parse_llm_answer, render_prompt, LlmAdapter};
pub use llm_service::LlmService;
