pub mod config;
pub mod events;
pub mod frontmatter;
pub mod layout;
pub mod parse;
pub mod types;

pub use config::Config;
pub use events::{EventKind, LoopEvent};
pub use layout::{ArtifactKind, ArtifactLayout, ClassifiedPath};
pub use types::*;
