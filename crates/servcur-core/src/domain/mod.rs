//! Domain types for servcur.

pub mod error;
pub mod project;
pub mod resource;
pub mod stream;

pub use error::{CoreError, CoreResult, ErrorKind};
pub use project::{validate_key, GitAuth, NewProject};
pub use resource::{PruneReport, Resource, ResourceKind, RuntimeEvent, SystemInfo, Verb};
pub use stream::{Channel, LogLine};
