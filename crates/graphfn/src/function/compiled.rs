use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use once_cell::sync::OnceCell;

use crate::backend::spec::{PortableBackend, TensorSpec, ValueId};
use crate::graph::{GraphArena, TracedTensor};
use crate::nest::{Nest, Structure};
use crate::tensor::DeviceTensor;

use super::backward::{synthesize_backward, BackwardFunction};
use super::fragment::GraphFragment;
use super::library::{Differentiable, RegisteredFunction};

/// How flattened results map back onto the traced body's return structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLayout {
    /// The body returned a bare value rather than a sequence.
    Single(Option<usize>),
    /// Nested result; `slots` holds one output position per leaf, `None` for
    /// leaves that were `None`.
    Nested {
        structure: Structure,
        slots: Vec<Option<usize>>,
    },
}

impl OutputLayout {
    /// Rebuilds the body's result shape from the function's outputs.
    pub fn rebuild<T: Clone>(&self, outputs: &[T]) -> Result<Nest<Option<T>>> {
        let fetch = |slot: &Option<usize>| -> Result<Option<T>> {
            match slot {
                Some(index) => outputs
                    .get(*index)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| anyhow!("output {index} missing from {} results", outputs.len())),
                None => Ok(None),
            }
        };
        match self {
            OutputLayout::Single(slot) => Ok(Nest::Leaf(fetch(slot)?)),
            OutputLayout::Nested { structure, slots } => {
                let leaves = slots.iter().map(fetch).collect::<Result<Vec<_>>>()?;
                Ok(structure.rebuild(leaves)?)
            }
        }
    }
}

/// A traced, registered function plus the metadata needed to call it.
pub struct CompiledFunction<B: PortableBackend + 'static> {
    pub(crate) name: String,
    pub(crate) inference: Arc<RegisteredFunction>,
    pub(crate) arena: Arc<GraphArena<B>>,
    pub(crate) fragment: GraphFragment<B>,
    pub(crate) arg_placeholders: Vec<TracedTensor>,
    pub(crate) capture_placeholders: Vec<TracedTensor>,
    pub(crate) extra_inputs: Vec<DeviceTensor<B>>,
    pub(crate) layout: OutputLayout,
    pub(crate) output_index: HashMap<ValueId, usize>,
    pub(crate) output_specs: Vec<TensorSpec>,
    pub(crate) backward: OnceCell<Arc<BackwardFunction>>,
}

impl<B: PortableBackend + 'static> CompiledFunction<B> {
    /// Base name the generated function names derive from.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inference(&self) -> &Arc<RegisteredFunction> {
        &self.inference
    }

    pub fn inference_name(&self) -> &str {
        self.inference.name()
    }

    pub fn arena(&self) -> &Arc<GraphArena<B>> {
        &self.arena
    }

    pub fn fragment(&self) -> &GraphFragment<B> {
        &self.fragment
    }

    pub fn arg_placeholders(&self) -> &[TracedTensor] {
        &self.arg_placeholders
    }

    pub fn capture_placeholders(&self) -> &[TracedTensor] {
        &self.capture_placeholders
    }

    /// Captured external tensors, passed positionally after the arguments.
    pub fn extra_inputs(&self) -> &[DeviceTensor<B>] {
        &self.extra_inputs
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Position of a fragment output among the function's results.
    pub fn output_position(&self, value: ValueId) -> Option<usize> {
        self.output_index.get(&value).copied()
    }

    pub fn output_specs(&self) -> &[TensorSpec] {
        &self.output_specs
    }

    pub fn backend(&self) -> Arc<B> {
        self.arena.backend()
    }

    /// Backward pair, synthesized on first use.
    pub fn backward(&self) -> Result<Arc<BackwardFunction>> {
        self.backward
            .get_or_try_init(|| synthesize_backward(self))
            .cloned()
    }

    pub fn has_backward(&self) -> bool {
        self.backward.get().is_some()
    }
}

impl<B: PortableBackend + 'static> Differentiable for CompiledFunction<B> {
    fn backward_function(&self) -> Result<Arc<BackwardFunction>> {
        self.backward()
    }
}

impl<B: PortableBackend + 'static> fmt::Debug for CompiledFunction<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("name", &self.name)
            .field("inference", &self.inference.name())
            .field("args", &self.arg_placeholders.len())
            .field("captures", &self.extra_inputs.len())
            .field("outputs", &self.output_specs)
            .finish()
    }
}
