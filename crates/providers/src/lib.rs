//! Model providers for Corvid.
//!
//! Every backend implements `corvid_core::provider::LanguageModel`. The
//! [`ConfigRegistry`] resolves `provider/model` references from configuration.

pub mod openai_compat;
pub mod registry;
pub mod scripted;

pub use openai_compat::OpenAiCompatModel;
pub use registry::ConfigRegistry;
pub use scripted::{ScriptError, ScriptStep, ScriptedModel};
