//! Thread-scoped capture registry.
//!
//! While a trace runs, eager tensors referenced by the traced body are imported
//! through [`resolve`], which hands out one placeholder per tensor identity and
//! remembers the pair so the tensor can be passed positionally at call time.
//! At most one capture scope is active per thread. The active graph is tracked in
//! a thread-local that only gates ambient access; the capture map itself lives in
//! the graph arena and is reached through the builder.

use std::cell::Cell;

use anyhow::Result;
use tracing::trace;

use crate::backend::spec::PortableBackend;
use crate::error::TraceError;
use crate::tensor::DeviceTensor;

use super::arena::GraphId;
use super::builder::{GraphBuilder, TracedTensor};

thread_local! {
    static ACTIVE_CAPTURE: Cell<Option<GraphId>> = const { Cell::new(None) };
}

/// Returns true when a capture scope is active on this thread.
pub fn is_capturing() -> bool {
    ACTIVE_CAPTURE.with(Cell::get).is_some()
}

/// Graph currently capturing on this thread, if any.
pub fn active_graph() -> Option<GraphId> {
    ACTIVE_CAPTURE.with(Cell::get)
}

/// RAII guard for an open capture pass. Thread state is cleared on drop, including
/// when the traced body fails.
#[must_use = "dropping the scope ends the capture pass"]
pub struct CaptureScope {
    graph: GraphId,
    active: bool,
}

/// Opens an empty capture map for `graph` on the current thread.
pub fn begin_capture(graph: GraphId) -> Result<CaptureScope> {
    ACTIVE_CAPTURE.with(|cell| {
        if let Some(active) = cell.get() {
            return Err(TraceError::CaptureAlreadyActive { active }.into());
        }
        cell.set(Some(graph));
        trace!(graph = %graph, "capture scope opened");
        Ok(CaptureScope {
            graph,
            active: true,
        })
    })
}

/// Captured tensors in first-resolution order, each with its placeholder.
pub struct CaptureMap<B: PortableBackend + 'static> {
    entries: Vec<(DeviceTensor<B>, TracedTensor)>,
}

impl<B: PortableBackend + 'static> CaptureMap<B> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(DeviceTensor<B>, TracedTensor)] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<(DeviceTensor<B>, TracedTensor)> {
        self.entries
    }
}

impl CaptureScope {
    pub fn graph(&self) -> GraphId {
        self.graph
    }

    /// Closes the pass and returns the capture map collected in `builder`'s graph.
    pub fn end<B: PortableBackend + 'static>(
        mut self,
        builder: &mut GraphBuilder<'_, B>,
    ) -> Result<CaptureMap<B>> {
        if builder.graph_id() != self.graph {
            return Err(anyhow::anyhow!(
                "capture scope for graph {} closed against graph {}",
                self.graph,
                builder.graph_id()
            ));
        }
        self.release();
        let mut entries = Vec::new();
        for record in builder.drain_captures() {
            let placeholder = builder.traced(record.placeholder)?;
            entries.push((record.tensor, placeholder));
        }
        trace!(graph = %self.graph, captures = entries.len(), "capture scope closed");
        Ok(CaptureMap { entries })
    }

    fn release(&mut self) {
        if self.active {
            ACTIVE_CAPTURE.with(|cell| cell.set(None));
            self.active = false;
        }
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        self.release();
    }
}

/// Returns the placeholder standing in for `tensor` inside `builder`'s graph,
/// creating it on first use.
pub fn resolve<B: PortableBackend + 'static>(
    builder: &mut GraphBuilder<'_, B>,
    tensor: &DeviceTensor<B>,
) -> Result<TracedTensor> {
    let graph = builder.graph_id();
    if active_graph() != Some(graph) {
        return Err(TraceError::OutsideTracingContext {
            tensor: tensor.id(),
            graph,
        }
        .into());
    }
    if let Some(existing) = builder.lookup_capture(tensor) {
        return builder.traced(existing);
    }
    let placeholder = builder.record_capture(tensor);
    trace!(graph = %graph, tensor = %tensor.id(), value = placeholder.value().0, "captured external tensor");
    Ok(placeholder)
}

/// Suspends the current thread's capture scope until dropped.
pub struct ParkedCapture {
    previous: Option<GraphId>,
}

/// Parks whatever scope is active so a nested trace can open its own.
pub fn park() -> ParkedCapture {
    let previous = ACTIVE_CAPTURE.with(|cell| cell.replace(None));
    ParkedCapture { previous }
}

impl Drop for ParkedCapture {
    fn drop(&mut self) {
        ACTIVE_CAPTURE.with(|cell| cell.set(self.previous));
    }
}
