use std::fmt;
use std::sync::{
    atomic::{AtomicU64, Ordering as AtomicOrdering},
    Arc,
};

use anyhow::Result;

use crate::backend::spec::{Function, PortableBackend, ValueId};
use crate::graph::GraphArena;

static FRAGMENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of one sealed fragment object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FragmentId(u64);

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fragment#{}", self.0)
    }
}

/// Declared inputs and outputs over a region of a graph arena. Sealed fragments
/// are registered at most once and are not `Clone`.
pub struct GraphFragment<B: PortableBackend + 'static> {
    id: FragmentId,
    arena: Arc<GraphArena<B>>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
}

impl<B: PortableBackend + 'static> GraphFragment<B> {
    pub(crate) fn new(arena: Arc<GraphArena<B>>, inputs: Vec<ValueId>, outputs: Vec<ValueId>) -> Self {
        GraphFragment {
            id: FragmentId(FRAGMENT_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)),
            arena,
            inputs,
            outputs,
        }
    }

    pub fn id(&self) -> FragmentId {
        self.id
    }

    pub fn arena(&self) -> &Arc<GraphArena<B>> {
        &self.arena
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    /// Lowers the fragment into a function definition named `name`.
    pub fn lower(&self, name: &str) -> Result<Function> {
        self.arena.lower(name, &self.inputs, &self.outputs)
    }
}

impl<B: PortableBackend + 'static> fmt::Debug for GraphFragment<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphFragment")
            .field("id", &self.id)
            .field("graph", &self.arena.id())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}
