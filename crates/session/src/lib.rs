//! The Corvid session engine.
//!
//! Prompts enter through [`SessionPrompt`]. Each session runs at most one
//! generation at a time; prompts arriving meanwhile queue behind it and are
//! either spliced into the live generation or run right after it. The
//! generation's events are written through [`SessionStore`] as they happen,
//! tools run through the [`ToolPipeline`], and long conversations are kept
//! within the model's context by the [`compaction`] module.

pub mod command;
pub mod compaction;
pub mod generation;
pub mod input;
pub mod lock;
pub mod pipeline;
pub mod processor;
pub mod prompt;
pub mod replay;
pub mod retry;
pub mod shell;
pub mod store;
pub mod stream_event;
pub mod system;
pub mod title;
pub mod usage;

pub use command::CommandInput;
pub use generation::{EventSource, Generation, GenerationRequest};
pub use input::{PartInput, PromptInput};
pub use lock::LockRegistry;
pub use pipeline::{ResolvedTools, ToolPipeline};
pub use processor::StreamProcessor;
pub use prompt::SessionPrompt;
pub use retry::RetryPolicy;
pub use shell::ShellInput;
pub use store::SessionStore;
pub use stream_event::GenerationEvent;
