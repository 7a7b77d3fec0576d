//! Creevey Common Library
//!
//! Shared types, skip rules, configuration and image layout for the Creevey
//! visual regression runner.

pub mod config;
pub mod error;
pub mod images;
pub mod protocol;
pub mod skip;
pub mod story;
pub mod sync;
pub mod types;

// Re-export commonly used types
pub use config::{BrowserSettings, Config, Viewport};
pub use error::{Error, Result};
pub use images::{ImageKind, ImageStore};
pub use protocol::{ApprovePayload, Request, Response, WorkerCommand, WorkerMessage};
pub use skip::{should_skip, SkipContext, SkipOptions, SkipRule};
pub use story::StoryDescriptor;
pub use sync::StatusMirror;
pub use types::*;

/// Creevey version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
