//! Per-call execution strategy.
//!
//! The mode is resolved once per call from the ambient context (eager caller vs.
//! a graph under construction) and whether an active gradient tape tracks any of
//! the call's tensors, then passed down explicitly.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::backend::spec::PortableBackend;
use crate::error::TraceError;
use crate::function::{library, CompiledFunction};
use crate::graph::{GraphBuilder, TracedTensor};
use crate::nest::Nest;
use crate::profiling;
use crate::tape;
use crate::tensor::{DeviceTensor, Value};

/// Where the call is made from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ambient {
    Eager,
    Graph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run the inference function immediately.
    Eager,
    /// Emit a call node into the enclosing graph.
    GraphCall,
    /// Run the forward function so the call can be differentiated later.
    Recorded(Ambient),
}

impl ExecutionMode {
    pub fn resolve(ambient: Ambient, tracked: bool) -> Self {
        match (ambient, tracked) {
            (_, true) => ExecutionMode::Recorded(ambient),
            (Ambient::Eager, false) => ExecutionMode::Eager,
            (Ambient::Graph, false) => ExecutionMode::GraphCall,
        }
    }
}

/// Eager tensors of `args` in leaf order; symbolic leaves are rejected.
fn eager_arguments<B: PortableBackend + 'static>(
    compiled: &CompiledFunction<B>,
    args: &Nest<Value<B>>,
) -> Result<Vec<DeviceTensor<B>>> {
    let mut tensors = Vec::new();
    for leaf in args.leaves() {
        match leaf {
            Value::Tensor(tensor) => tensors.push(tensor.clone()),
            Value::Traced(_) => {
                return Err(TraceError::SymbolicValueInEagerCall {
                    function: compiled.name().to_string(),
                }
                .into())
            }
            Value::Array(_) | Value::Literal(_) => {}
        }
    }
    check_arguments(compiled, tensors.iter().map(DeviceTensor::spec))?;
    Ok(tensors)
}

fn check_arguments<'s, B: PortableBackend + 'static>(
    compiled: &CompiledFunction<B>,
    specs: impl ExactSizeIterator<Item = &'s crate::backend::spec::TensorSpec>,
) -> Result<()> {
    let expected = compiled.arg_placeholders().len();
    if specs.len() != expected {
        return Err(TraceError::ArityMismatch {
            function: compiled.inference_name().to_string(),
            expected,
            actual: specs.len(),
        }
        .into());
    }
    for (position, (spec, placeholder)) in specs.zip(compiled.arg_placeholders()).enumerate() {
        if spec != placeholder.spec() {
            return Err(anyhow!(
                "argument {position} of `{}` is {:?}, traced as {:?}",
                compiled.name(),
                spec,
                placeholder.spec()
            ));
        }
    }
    Ok(())
}

/// Calls `compiled` from eager code.
pub(crate) fn call_eager<B: PortableBackend + 'static>(
    compiled: &Arc<CompiledFunction<B>>,
    args: &Nest<Value<B>>,
) -> Result<Nest<Option<DeviceTensor<B>>>> {
    let arguments = eager_arguments(compiled, args)?;
    let tracked = tape::any_tracked(arguments.iter().chain(compiled.extra_inputs()));
    match ExecutionMode::resolve(Ambient::Eager, tracked) {
        ExecutionMode::Eager => run_inference(compiled, &arguments),
        ExecutionMode::Recorded(_) => run_recorded(compiled, &arguments),
        ExecutionMode::GraphCall => Err(anyhow!("graph call requested from eager code")),
    }
}

fn run_inference<B: PortableBackend + 'static>(
    compiled: &Arc<CompiledFunction<B>>,
    arguments: &[DeviceTensor<B>],
) -> Result<Nest<Option<DeviceTensor<B>>>> {
    profiling::cache_event("dispatch_eager");
    debug!(function = compiled.inference_name(), "dispatching eagerly");
    let program = library::program_for(compiled.inference())?;
    let backend = compiled.backend();
    let handles: Vec<_> = arguments
        .iter()
        .chain(compiled.extra_inputs())
        .map(|tensor| tensor.handle().clone())
        .collect();
    let results = backend.run_program(&program, &handles)?;
    let outputs = wrap_results(&backend, compiled, results)?;
    compiled.layout().rebuild(&outputs)
}

fn run_recorded<B: PortableBackend + 'static>(
    compiled: &Arc<CompiledFunction<B>>,
    arguments: &[DeviceTensor<B>],
) -> Result<Nest<Option<DeviceTensor<B>>>> {
    profiling::cache_event("dispatch_recorded");
    let backward = compiled.backward()?;
    debug!(
        function = compiled.inference_name(),
        forward = backward.forward_name(),
        "dispatching with gradient recording"
    );
    let program = library::program_for(backward.forward())?;
    let backend = compiled.backend();

    let inputs: Vec<DeviceTensor<B>> = arguments
        .iter()
        .cloned()
        .chain(compiled.extra_inputs().iter().cloned())
        .collect();
    let handles: Vec<_> = inputs.iter().map(|tensor| tensor.handle().clone()).collect();
    let mut results = backend.run_program(&program, &handles)?;
    let real = compiled.output_specs().len();
    if results.len() != real + backward.side_outputs() {
        return Err(anyhow!(
            "`{}` returned {} results, expected {}",
            backward.forward_name(),
            results.len(),
            real + backward.side_outputs()
        ));
    }
    let side_outputs = results.split_off(real);
    let outputs = wrap_results(&backend, compiled, results)?;
    tape::record(&backward, &inputs, &outputs, &side_outputs);
    compiled.layout().rebuild(&outputs)
}

fn wrap_results<B: PortableBackend + 'static>(
    backend: &Arc<B>,
    compiled: &CompiledFunction<B>,
    results: Vec<B::TensorHandle>,
) -> Result<Vec<DeviceTensor<B>>> {
    if results.len() != compiled.output_specs().len() {
        return Err(anyhow!(
            "`{}` returned {} results, expected {}",
            compiled.inference_name(),
            results.len(),
            compiled.output_specs().len()
        ));
    }
    Ok(results
        .into_iter()
        .zip(compiled.output_specs())
        .map(|(handle, spec)| DeviceTensor::from_handle(Arc::clone(backend), spec.clone(), handle))
        .collect())
}

/// Calls `compiled` from inside another traced body.
pub(crate) fn call_graph<B: PortableBackend + 'static>(
    compiled: &Arc<CompiledFunction<B>>,
    builder: &mut GraphBuilder<'_, B>,
    args: &Nest<Value<B>>,
) -> Result<Nest<Option<TracedTensor>>> {
    let mut inputs = Vec::new();
    for leaf in args.leaves() {
        match leaf {
            Value::Traced(traced) => {
                builder.check(traced)?;
                inputs.push(traced.clone());
            }
            Value::Tensor(tensor) => inputs.push(builder.capture(tensor)?),
            Value::Array(_) | Value::Literal(_) => {}
        }
    }
    check_arguments(compiled, inputs.iter().map(TracedTensor::spec))?;

    let tracked = tape::any_tracked(compiled.extra_inputs().iter());
    let mode = ExecutionMode::resolve(Ambient::Graph, tracked);
    for extra in compiled.extra_inputs() {
        inputs.push(builder.capture(extra)?);
    }

    let target = match mode {
        ExecutionMode::GraphCall => {
            profiling::cache_event("dispatch_graph_call");
            compiled.inference_name().to_string()
        }
        ExecutionMode::Recorded(_) => {
            profiling::cache_event("dispatch_recorded");
            compiled.backward()?.forward_name().to_string()
        }
        ExecutionMode::Eager => return Err(anyhow!("eager dispatch requested inside a graph")),
    };
    debug!(
        function = compiled.name(),
        target = %target,
        graph = %builder.graph_id(),
        ?mode,
        "emitting call node"
    );
    let mut outputs = builder.call_function(&target, &inputs)?;
    outputs.truncate(compiled.output_specs().len());
    compiled.layout().rebuild(&outputs)
}
