//! Tracing a body into a compiled function.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::backend::spec::PortableBackend;
use crate::defun::{Kwargs, TraceBody};
use crate::graph::{capture, GraphArena, TracedTensor};
use crate::nest::{Nest, Structure};
use crate::tensor::Value;

use super::compiled::{CompiledFunction, OutputLayout};
use super::library::{self, FunctionRole, GradientLink, RegistrationName};

/// Runs `body` once against placeholders and registers the result.
///
/// Tensor leaves of `args` (eager or symbolic) become declared inputs; every
/// other leaf reaches the body unchanged. Eager tensors the body imports through
/// [`GraphBuilder::capture`](crate::graph::GraphBuilder::capture) become extra
/// inputs in first-capture order.
pub(crate) fn trace<B: PortableBackend + 'static>(
    backend: Arc<B>,
    name: &str,
    forced_name: Option<&str>,
    body: &TraceBody<B>,
    args: &Nest<Value<B>>,
    kwargs: &Kwargs<B>,
) -> Result<Arc<CompiledFunction<B>>> {
    let arena = GraphArena::new(backend, name);
    debug!(function = name, graph = %arena.id(), "tracing function");

    let traced = arena.with_builder(|builder| {
        // Declared before the scope so it drops after it, restoring any outer trace.
        let _parked = capture::park();
        let scope = capture::begin_capture(builder.graph_id())?;

        let mut arg_placeholders: Vec<TracedTensor> = Vec::new();
        let symbolic_args = args.try_map_ref(|value| -> Result<Value<B>> {
            let spec = match value {
                Value::Tensor(tensor) => tensor.spec().clone(),
                Value::Traced(traced) => traced.spec().clone(),
                other => return Ok(other.clone()),
            };
            let placeholder = builder.placeholder(spec);
            arg_placeholders.push(placeholder.clone());
            Ok(Value::Traced(placeholder))
        })?;

        let result = body(builder, &symbolic_args, kwargs)?;

        let (leaves, structure) = result.flatten();
        let mut outputs = Vec::new();
        let mut output_index = HashMap::new();
        let mut slots = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            match leaf {
                None => slots.push(None),
                Some(tensor) => {
                    let value = builder.check(&tensor)?;
                    let position = *output_index.entry(value).or_insert_with(|| {
                        outputs.push(value);
                        outputs.len() - 1
                    });
                    slots.push(Some(position));
                }
            }
        }

        let captures = scope.end(builder)?;
        let (extra_inputs, capture_placeholders): (Vec<_>, Vec<_>) =
            captures.into_entries().into_iter().unzip();

        let inputs: Vec<_> = arg_placeholders
            .iter()
            .chain(&capture_placeholders)
            .map(TracedTensor::value)
            .collect();
        let fragment = builder.fragment(&inputs, &outputs)?;
        let output_specs = outputs
            .iter()
            .map(|value| builder.traced(*value).map(|tensor| tensor.spec().clone()))
            .collect::<Result<Vec<_>>>()?;
        let layout = match structure {
            Structure::Leaf => OutputLayout::Single(slots.first().copied().flatten()),
            structure => OutputLayout::Nested { structure, slots },
        };
        debug!(
            function = name,
            args = arg_placeholders.len(),
            captures = extra_inputs.len(),
            outputs = outputs.len(),
            nodes = builder.next_value_id().0,
            "trace finished"
        );
        Ok((
            fragment,
            arg_placeholders,
            capture_placeholders,
            extra_inputs,
            layout,
            output_index,
            output_specs,
        ))
    })?;
    let (fragment, arg_placeholders, capture_placeholders, extra_inputs, layout, output_index, output_specs) =
        traced;

    let registration = match forced_name {
        Some(forced) => RegistrationName::Forced(forced.to_string()),
        None => RegistrationName::generated(FunctionRole::Inference, name),
    };
    let inference = library::register(registration, &fragment)?;

    let compiled = Arc::new(CompiledFunction {
        name: name.to_string(),
        inference,
        arena,
        fragment,
        arg_placeholders,
        capture_placeholders,
        extra_inputs,
        layout,
        output_index,
        output_specs,
        backward: OnceCell::new(),
    });
    library::attach_gradient(
        compiled.inference_name(),
        GradientLink {
            source: Arc::clone(&compiled) as Arc<dyn library::Differentiable>,
            side_outputs_exported: false,
        },
    );
    Ok(compiled)
}
