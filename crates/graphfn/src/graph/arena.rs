//! Shared arena that stores graphs under construction.
//!
//! Each trace owns one arena. Nodes are appended under the arena mutex through a
//! [`GraphBuilder`] handed to a closure by [`GraphArena::with_builder`]; value
//! identifiers are allocated monotonically, so ascending id order is always a
//! valid topological order. The arena outlives the trace: backward synthesis
//! appends the gradient region to the same arena later on.

use std::collections::HashMap;
use std::fmt;
use std::sync::{
    atomic::{AtomicUsize, Ordering as AtomicOrdering},
    Arc, Mutex,
};

use anyhow::Result;

use crate::backend::spec::{Function, Operand, Operation, PortableBackend, ValueId, ValueType};
use crate::function::lower;
use crate::tensor::{DeviceTensor, TensorId};

use super::builder::GraphBuilder;

static ARENA_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Process-unique identity of a graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GraphId(usize);

impl GraphId {
    fn next() -> Self {
        GraphId(ARENA_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
    /// Unbound input slot: a declared argument, a capture, or a gradient seed.
    Placeholder,
    Op {
        op: Operation,
        operands: Vec<Operand>,
    },
    /// Element `index` of a tuple-valued node (the result of a call).
    Projection { tuple: ValueId, index: usize },
}

#[derive(Debug, Clone)]
pub(crate) struct NodeRecord {
    pub(crate) kind: NodeKind,
    pub(crate) ty: ValueType,
}

impl NodeRecord {
    /// Values this node reads.
    pub(crate) fn dependencies(&self) -> Vec<ValueId> {
        match &self.kind {
            NodeKind::Placeholder => Vec::new(),
            NodeKind::Projection { tuple, .. } => vec![*tuple],
            NodeKind::Op { operands, .. } => operands
                .iter()
                .filter_map(|operand| match operand {
                    Operand::Value(id) => Some(*id),
                    Operand::TupleElement { tuple, .. } => Some(*tuple),
                    Operand::Literal(_) => None,
                })
                .collect(),
        }
    }
}

pub(crate) struct CaptureRecord<B: PortableBackend + 'static> {
    pub(crate) tensor: DeviceTensor<B>,
    pub(crate) placeholder: ValueId,
}

pub(crate) struct GraphInner<B: PortableBackend + 'static> {
    next_value: u32,
    pub(crate) nodes: HashMap<ValueId, NodeRecord>,
    pub(crate) captures: Vec<CaptureRecord<B>>,
    pub(crate) capture_lookup: HashMap<TensorId, ValueId>,
    pub(crate) projections: HashMap<(ValueId, usize), ValueId>,
}

impl<B: PortableBackend + 'static> GraphInner<B> {
    fn new() -> Self {
        GraphInner {
            next_value: 0,
            nodes: HashMap::new(),
            captures: Vec::new(),
            capture_lookup: HashMap::new(),
            projections: HashMap::new(),
        }
    }

    pub(crate) fn next_value_id(&self) -> ValueId {
        ValueId(self.next_value)
    }

    pub(crate) fn insert(&mut self, kind: NodeKind, ty: ValueType) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        self.nodes.insert(id, NodeRecord { kind, ty });
        id
    }
}

/// Storage for one dataflow graph built against a single backend instance.
pub struct GraphArena<B: PortableBackend + 'static> {
    backend: Arc<B>,
    inner: Mutex<GraphInner<B>>,
    id: GraphId,
    label: String,
}

impl<B: PortableBackend + 'static> GraphArena<B> {
    pub fn new(backend: Arc<B>, label: impl Into<String>) -> Arc<Self> {
        Arc::new(GraphArena {
            backend,
            inner: Mutex::new(GraphInner::new()),
            id: GraphId::next(),
            label: label.into(),
        })
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    /// Runs `f` with exclusive access to the graph. Nodes emitted by `f` stay in the
    /// arena whether or not `f` succeeds.
    pub fn with_builder<F, R>(self: &Arc<Self>, f: F) -> Result<R>
    where
        F: FnOnce(&mut GraphBuilder<'_, B>) -> Result<R>,
    {
        let mut inner = self.inner.lock().expect("graph arena poisoned");
        let mut builder = GraphBuilder {
            arena: Arc::clone(self),
            inner: &mut inner,
        };
        f(&mut builder)
    }

    /// Lowers the closure of `outputs` over `inputs` into a function definition.
    pub(crate) fn lower(
        &self,
        name: &str,
        inputs: &[ValueId],
        outputs: &[ValueId],
    ) -> Result<Function> {
        let inner = self.inner.lock().expect("graph arena poisoned");
        lower::lower_function(&inner, name, inputs, outputs)
    }
}

impl<B: PortableBackend + 'static> fmt::Debug for GraphArena<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphArena")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("backend", &self.backend.backend_name())
            .finish()
    }
}
