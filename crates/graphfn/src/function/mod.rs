//! Registered functions: lowering, the process-wide library, compiled functions,
//! backward synthesis, and the tracer that produces them.
mod backward;
mod compiled;
mod fragment;
pub mod library;
pub(crate) mod lower;
pub(crate) mod trace;

pub use backward::BackwardFunction;
pub use compiled::{CompiledFunction, OutputLayout};
pub use fragment::{FragmentId, GraphFragment};
pub use library::{
    Differentiable, FunctionRole, GradientLink, RegisteredFunction, RegistrationName,
};
