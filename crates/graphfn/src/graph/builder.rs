//! Mutable builder used to stage operations inside a [`GraphArena`](super::arena::GraphArena).

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::backend::spec::{
    CallSpec, DType, Operand, Operation, PortableBackend, Shape, TensorSpec, ValueId, ValueType,
};
use crate::error::TraceError;
use crate::function::{library, GraphFragment};
use crate::tensor::DeviceTensor;

use super::arena::{CaptureRecord, GraphArena, GraphId, GraphInner, NodeKind, NodeRecord};
use super::capture;

/// Symbolic tensor living in one graph under construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TracedTensor {
    graph: GraphId,
    value: ValueId,
    spec: TensorSpec,
}

impl TracedTensor {
    pub fn graph(&self) -> GraphId {
        self.graph
    }

    pub fn value(&self) -> ValueId {
        self.value
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn dtype(&self) -> DType {
        self.spec.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.spec.shape
    }
}

/// Context passed to graph capture closures for importing tensors and emitting nodes.
pub struct GraphBuilder<'a, B: PortableBackend + 'static> {
    pub(super) arena: Arc<GraphArena<B>>,
    pub(super) inner: &'a mut GraphInner<B>,
}

impl<'a, B: PortableBackend + 'static> GraphBuilder<'a, B> {
    pub fn graph_id(&self) -> GraphId {
        self.arena.id()
    }

    /// Returns the arena backing the builder.
    pub fn arena(&self) -> Arc<GraphArena<B>> {
        Arc::clone(&self.arena)
    }

    pub fn backend(&self) -> Arc<B> {
        self.arena.backend()
    }

    /// Creates an unbound input slot of the given type.
    pub fn placeholder(&mut self, spec: TensorSpec) -> TracedTensor {
        let value = self
            .inner
            .insert(NodeKind::Placeholder, ValueType::Tensor(spec.clone()));
        self.wrap(value, spec)
    }

    /// Imports an eager tensor through the active capture scope.
    pub fn capture(&mut self, tensor: &DeviceTensor<B>) -> Result<TracedTensor> {
        capture::resolve(self, tensor)
    }

    /// Verifies that `tensor` belongs to this graph and returns its value id.
    pub fn check(&self, tensor: &TracedTensor) -> Result<ValueId> {
        if tensor.graph != self.graph_id() {
            return Err(TraceError::ForeignGraphValue {
                value: tensor.value.0,
                owner: tensor.graph,
                graph: self.graph_id(),
            }
            .into());
        }
        match self.inner.nodes.get(&tensor.value) {
            Some(record) if record.ty.as_tensor().is_some() => Ok(tensor.value),
            Some(_) => Err(anyhow!("value %{} is a tuple, not a tensor", tensor.value.0)),
            None => Err(anyhow!(
                "value %{} is not defined in graph {}",
                tensor.value.0,
                self.graph_id()
            )),
        }
    }

    /// Emits a node producing a single tensor.
    pub(crate) fn emit(
        &mut self,
        op: Operation,
        operands: Vec<Operand>,
        spec: TensorSpec,
    ) -> TracedTensor {
        let value = self.inner.insert(
            NodeKind::Op { op, operands },
            ValueType::Tensor(spec.clone()),
        );
        self.wrap(value, spec)
    }

    /// Projects element `index` out of a tuple-valued node. Repeated projections
    /// of the same element share one node.
    pub(crate) fn project(&mut self, tuple: ValueId, index: usize) -> Result<TracedTensor> {
        if let Some(existing) = self.inner.projections.get(&(tuple, index)).copied() {
            return self.traced(existing);
        }
        let spec = match self.inner.nodes.get(&tuple).map(|record| &record.ty) {
            Some(ValueType::Tuple(elements)) => match elements.get(index) {
                Some(ValueType::Tensor(spec)) => spec.clone(),
                _ => return Err(anyhow!("%{}[{}] is not a tensor element", tuple.0, index)),
            },
            _ => return Err(anyhow!("%{} is not a tuple", tuple.0)),
        };
        let value = self.inner.insert(
            NodeKind::Projection { tuple, index },
            ValueType::Tensor(spec.clone()),
        );
        self.inner.projections.insert((tuple, index), value);
        Ok(self.wrap(value, spec))
    }

    /// Re-wraps an existing tensor value of this graph.
    pub(crate) fn traced(&self, value: ValueId) -> Result<TracedTensor> {
        let spec = self
            .inner
            .nodes
            .get(&value)
            .and_then(|record| record.ty.as_tensor())
            .cloned()
            .ok_or_else(|| anyhow!("value %{} is not a tensor in graph {}", value.0, self.graph_id()))?;
        Ok(self.wrap(value, spec))
    }

    /// Emits a call node invoking the registered function `name` and returns one
    /// tensor per callee output.
    pub fn call_function(&mut self, name: &str, inputs: &[TracedTensor]) -> Result<Vec<TracedTensor>> {
        let entry = library::lookup(name).ok_or_else(|| TraceError::UnknownFunction {
            name: name.to_string(),
        })?;
        let function = entry.function();
        if function.parameters.len() != inputs.len() {
            return Err(TraceError::ArityMismatch {
                function: name.to_string(),
                expected: function.parameters.len(),
                actual: inputs.len(),
            }
            .into());
        }
        let mut operands = Vec::with_capacity(inputs.len());
        for (position, (input, expected)) in inputs.iter().zip(&function.parameters).enumerate() {
            let value = self.check(input)?;
            if expected.as_tensor() != Some(input.spec()) {
                return Err(TraceError::InvalidOperands {
                    op: "call",
                    reason: format!(
                        "argument {position} of `{name}` has type {:?}, expected {:?}",
                        input.spec(),
                        expected
                    ),
                }
                .into());
            }
            operands.push(Operand::Value(value));
        }
        let tuple = self.inner.insert(
            NodeKind::Op {
                op: Operation::Call(CallSpec {
                    target: name.to_string(),
                }),
                operands,
            },
            ValueType::Tuple(function.results.clone()),
        );
        (0..function.results.len())
            .map(|index| self.project(tuple, index))
            .collect()
    }

    /// Seals `inputs` and `outputs` as a fragment eligible for registration.
    pub fn fragment(&self, inputs: &[ValueId], outputs: &[ValueId]) -> Result<GraphFragment<B>> {
        for value in inputs.iter().chain(outputs) {
            if !self.inner.nodes.contains_key(value) {
                return Err(anyhow!(
                    "value %{} is not defined in graph {}",
                    value.0,
                    self.graph_id()
                ));
            }
        }
        Ok(GraphFragment::new(
            Arc::clone(&self.arena),
            inputs.to_vec(),
            outputs.to_vec(),
        ))
    }

    pub(crate) fn node(&self, value: ValueId) -> Option<&NodeRecord> {
        self.inner.nodes.get(&value)
    }

    /// Id the next emitted node will receive; every existing node sorts below it.
    pub(crate) fn next_value_id(&self) -> ValueId {
        self.inner.next_value_id()
    }

    pub(crate) fn lookup_capture(&self, tensor: &DeviceTensor<B>) -> Option<ValueId> {
        self.inner.capture_lookup.get(&tensor.id()).copied()
    }

    pub(crate) fn record_capture(&mut self, tensor: &DeviceTensor<B>) -> TracedTensor {
        let placeholder = self.placeholder(tensor.spec().clone());
        self.inner.capture_lookup.insert(tensor.id(), placeholder.value);
        self.inner.captures.push(CaptureRecord {
            tensor: tensor.clone(),
            placeholder: placeholder.value,
        });
        placeholder
    }

    pub(crate) fn drain_captures(&mut self) -> Vec<CaptureRecord<B>> {
        self.inner.capture_lookup.clear();
        std::mem::take(&mut self.inner.captures)
    }

    fn wrap(&self, value: ValueId, spec: TensorSpec) -> TracedTensor {
        TracedTensor {
            graph: self.graph_id(),
            value,
            spec,
        }
    }
}
