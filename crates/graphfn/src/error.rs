use thiserror::Error;

use crate::function::FragmentId;
use crate::graph::GraphId;
use crate::tensor::TensorId;

/// Usage and registration failures raised by the tracer.
///
/// Graph and dispatch code returns `anyhow::Result`; callers that need to branch
/// on a specific failure recover it with `err.downcast_ref::<TraceError>()`.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("value used outside tracing context: tensor {tensor} was referenced while graph {graph} is not capturing on this thread")]
    OutsideTracingContext { tensor: TensorId, graph: GraphId },

    #[error("capture scope re-entered: graph {active} is already capturing on this thread")]
    CaptureAlreadyActive { active: GraphId },

    #[error("keyword argument `{name}` is a tensor; keyword arguments are baked into the trace and must be constants")]
    TensorKeywordArgument { name: String },

    #[error("symbolic value passed to eager call of `{function}`; use `call_in` inside a graph")]
    SymbolicValueInEagerCall { function: String },

    #[error("value %{value} in `{function}` is not traceable to the declared inputs or captures")]
    UntraceableValue { function: String, value: u32 },

    #[error("value %{value} belongs to graph {owner} but was used while building graph {graph}")]
    ForeignGraphValue {
        value: u32,
        owner: GraphId,
        graph: GraphId,
    },

    #[error("graph fragment {fragment} was already registered as `{name}`")]
    FragmentAlreadyRegistered { fragment: FragmentId, name: String },

    #[error("function name `{name}` is already registered with a different definition")]
    RegistrationConflict { name: String },

    #[error("`{name}` is registered under a forced name and already traced for another signature")]
    ForcedNameSignature { name: String },

    #[error("function `{name}` is not registered")]
    UnknownFunction { name: String },

    #[error("`{function}` expects {expected} tensor inputs, got {actual}")]
    ArityMismatch {
        function: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid operands for {op}: {reason}")]
    InvalidOperands { op: &'static str, reason: String },
}
