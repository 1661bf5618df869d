//! Backward-graph synthesis.
//!
//! The gradient region is appended to the forward function's own arena, after a
//! watermark. Forward values that the gradient region reads are exported from a
//! dedicated forward function as side outputs and fed back into the backward
//! function, so the backward pass never recomputes them.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::autodiff;
use crate::backend::spec::{PortableBackend, TensorSpec, ValueId};
use crate::graph::NodeKind;
use crate::profiling;

use super::compiled::CompiledFunction;
use super::library::{
    self, Differentiable, FunctionRole, GradientLink, RegisteredFunction, RegistrationName,
};

/// Registered forward/backward pair for one compiled function.
#[derive(Debug)]
pub struct BackwardFunction {
    forward: Arc<RegisteredFunction>,
    backward: Arc<RegisteredFunction>,
    real_outputs: usize,
    side_outputs: usize,
    seed_specs: Vec<TensorSpec>,
    gradient_slots: Vec<Option<usize>>,
    gradient_specs: Vec<TensorSpec>,
}

impl BackwardFunction {
    /// Forward function: the original outputs followed by the side outputs.
    pub fn forward(&self) -> &Arc<RegisteredFunction> {
        &self.forward
    }

    /// Backward function: inputs are one seed per forward output followed by
    /// the side outputs; outputs are the present gradients.
    pub fn backward(&self) -> &Arc<RegisteredFunction> {
        &self.backward
    }

    pub fn forward_name(&self) -> &str {
        self.forward.name()
    }

    pub fn backward_name(&self) -> &str {
        self.backward.name()
    }

    pub fn real_outputs(&self) -> usize {
        self.real_outputs
    }

    pub fn side_outputs(&self) -> usize {
        self.side_outputs
    }

    pub fn seed_specs(&self) -> &[TensorSpec] {
        &self.seed_specs
    }

    /// One entry per forward input: the index of its gradient among the backward
    /// outputs, or `None` when no differentiable path reaches it.
    pub fn gradient_slots(&self) -> &[Option<usize>] {
        &self.gradient_slots
    }

    pub fn gradient_specs(&self) -> &[TensorSpec] {
        &self.gradient_specs
    }
}

/// Differentiable handle for functions whose backward pair already exists.
struct Synthesized(Arc<BackwardFunction>);

impl Differentiable for Synthesized {
    fn backward_function(&self) -> Result<Arc<BackwardFunction>> {
        Ok(Arc::clone(&self.0))
    }
}

pub(crate) fn synthesize_backward<B: PortableBackend + 'static>(
    compiled: &CompiledFunction<B>,
) -> Result<Arc<BackwardFunction>> {
    let fragment = compiled.fragment();
    let inputs = fragment.inputs().to_vec();
    let outputs = fragment.outputs().to_vec();
    let seed_specs = compiled.output_specs().to_vec();

    let (forward_fragment, backward_fragment, gradient_slots, gradient_specs, side_outputs) =
        compiled.arena().with_builder(|builder| {
            let watermark = builder.next_value_id();
            let seeds: Vec<ValueId> = seed_specs
                .iter()
                .map(|spec| builder.placeholder(spec.clone()).value())
                .collect();
            let grads = autodiff::gradients(builder, &outputs, &inputs, &seeds)?;

            // Forward values read by the gradient region become side outputs.
            let mut captured = BTreeSet::new();
            let mut visited = HashSet::new();
            let mut stack: Vec<ValueId> = grads.iter().flatten().copied().collect();
            while let Some(id) = stack.pop() {
                if !visited.insert(id) {
                    continue;
                }
                if id < watermark {
                    captured.insert(id);
                    continue;
                }
                let Some(record) = builder.node(id) else {
                    continue;
                };
                if let NodeKind::Projection { tuple, .. } = &record.kind {
                    if *tuple < watermark {
                        captured.insert(id);
                        continue;
                    }
                }
                stack.extend(record.dependencies());
            }
            let side: Vec<ValueId> = captured.into_iter().collect();

            let mut forward_outputs = outputs.clone();
            forward_outputs.extend(&side);
            let forward_fragment = builder.fragment(&inputs, &forward_outputs)?;

            let mut present = Vec::new();
            let mut gradient_slots = Vec::with_capacity(grads.len());
            let mut gradient_specs = Vec::new();
            for grad in &grads {
                match grad {
                    Some(value) => {
                        gradient_slots.push(Some(present.len()));
                        present.push(*value);
                        gradient_specs.push(builder.traced(*value)?.spec().clone());
                    }
                    None => gradient_slots.push(None),
                }
            }
            let mut backward_inputs = seeds.clone();
            backward_inputs.extend(&side);
            let backward_fragment = builder.fragment(&backward_inputs, &present)?;
            Ok((
                forward_fragment,
                backward_fragment,
                gradient_slots,
                gradient_specs,
                side.len(),
            ))
        })?;

    let base = compiled.name();
    let forward = library::register(
        RegistrationName::generated(FunctionRole::Forward, base),
        &forward_fragment,
    )?;
    let backward = library::register(
        RegistrationName::generated(FunctionRole::Backward, base),
        &backward_fragment,
    )?;

    let function = Arc::new(BackwardFunction {
        forward,
        backward,
        real_outputs: outputs.len(),
        side_outputs,
        seed_specs,
        gradient_slots,
        gradient_specs,
    });
    library::attach_gradient(
        function.forward_name(),
        GradientLink {
            source: Arc::new(Synthesized(Arc::clone(&function))),
            side_outputs_exported: true,
        },
    );
    profiling::cache_event("backward_synthesized");
    debug!(
        function = base,
        forward = function.forward_name(),
        backward = function.backward_name(),
        side_outputs,
        gradients = function.gradient_specs.len(),
        "backward function synthesized"
    );
    Ok(function)
}
