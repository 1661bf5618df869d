//! Graph construction: arenas, builders, and the capture registry.
mod arena;
mod builder;
pub mod capture;

pub use arena::{GraphArena, GraphId};
pub(crate) use arena::{GraphInner, NodeKind};
pub use builder::{GraphBuilder, TracedTensor};
pub use capture::{begin_capture, CaptureMap, CaptureScope};
