#[cfg(feature = "openai")]
pub mod client;
pub mod generator;
pub mod prompts;
pub mod provider;
pub mod stub;
pub mod types;

#[cfg(feature = "openai")]
pub use client::*;
pub use generator::*;
pub use provider::*;
pub use stub::*;
pub use types::*;
