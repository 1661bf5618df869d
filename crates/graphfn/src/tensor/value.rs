use std::fmt;
use std::hash::{Hash, Hasher};

use anyhow::{anyhow, Result};

use crate::backend::spec::{PortableBackend, TensorLiteral};
use crate::graph::TracedTensor;
use crate::nest::Nest;

use super::DeviceTensor;

/// Hashable non-tensor argument. Floats compare by bit pattern so they can key a cache.
#[derive(Debug, Clone)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::None, Literal::None) => true,
            (Literal::Bool(a), Literal::Bool(b)) => a == b,
            (Literal::Int(a), Literal::Int(b)) => a == b,
            (Literal::Float(a), Literal::Float(b)) => a.to_bits() == b.to_bits(),
            (Literal::Str(a), Literal::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Literal {}

impl Hash for Literal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Literal::None => {}
            Literal::Bool(value) => value.hash(state),
            Literal::Int(value) => value.hash(state),
            Literal::Float(value) => value.to_bits().hash(state),
            Literal::Str(value) => value.hash(state),
        }
    }
}

impl Literal {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Int(value) => Some(*value as f64),
            Literal::Float(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Literal::Bool(value)
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Literal::Int(value)
    }
}

impl From<f64> for Literal {
    fn from(value: f64) -> Self {
        Literal::Float(value)
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::Str(value.to_string())
    }
}

/// Plain host-side numeric array. Traced bodies receive it as-is and typically
/// embed it as a constant; its contents participate in the cache key.
#[derive(Debug, Clone, PartialEq)]
pub struct HostArray {
    dims: Vec<usize>,
    data: Vec<f32>,
}

impl HostArray {
    pub fn new(dims: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = dims.iter().product();
        if expected != data.len() {
            return Err(anyhow!(
                "array shape {:?} holds {} elements but {} values were supplied",
                dims,
                expected,
                data.len()
            ));
        }
        Ok(HostArray { dims, data })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn to_literal(&self) -> TensorLiteral {
        TensorLiteral::from_f32(&self.dims, &self.data)
    }
}

/// A leaf of a traced function's arguments.
pub enum Value<B: PortableBackend + 'static> {
    Tensor(DeviceTensor<B>),
    Traced(TracedTensor),
    Array(HostArray),
    Literal(Literal),
}

impl<B: PortableBackend + 'static> Clone for Value<B> {
    fn clone(&self) -> Self {
        match self {
            Value::Tensor(tensor) => Value::Tensor(tensor.clone()),
            Value::Traced(traced) => Value::Traced(traced.clone()),
            Value::Array(array) => Value::Array(array.clone()),
            Value::Literal(literal) => Value::Literal(literal.clone()),
        }
    }
}

impl<B: PortableBackend + 'static> fmt::Debug for Value<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Tensor(tensor) => f.debug_tuple("Tensor").field(tensor).finish(),
            Value::Traced(traced) => f.debug_tuple("Traced").field(traced).finish(),
            Value::Array(array) => f.debug_tuple("Array").field(array).finish(),
            Value::Literal(literal) => f.debug_tuple("Literal").field(literal).finish(),
        }
    }
}

impl<B: PortableBackend + 'static> Value<B> {
    pub fn is_tensor(&self) -> bool {
        matches!(self, Value::Tensor(_) | Value::Traced(_))
    }
}

impl<B: PortableBackend + 'static> From<DeviceTensor<B>> for Value<B> {
    fn from(tensor: DeviceTensor<B>) -> Self {
        Value::Tensor(tensor)
    }
}

impl<B: PortableBackend + 'static> From<&DeviceTensor<B>> for Value<B> {
    fn from(tensor: &DeviceTensor<B>) -> Self {
        Value::Tensor(tensor.clone())
    }
}

impl<B: PortableBackend + 'static> From<TracedTensor> for Value<B> {
    fn from(traced: TracedTensor) -> Self {
        Value::Traced(traced)
    }
}

impl<B: PortableBackend + 'static> From<HostArray> for Value<B> {
    fn from(array: HostArray) -> Self {
        Value::Array(array)
    }
}

impl<B: PortableBackend + 'static> From<Literal> for Value<B> {
    fn from(literal: Literal) -> Self {
        Value::Literal(literal)
    }
}

/// Positional accessors used inside traced bodies.
impl<B: PortableBackend + 'static> Nest<Value<B>> {
    fn positional(&self, index: usize) -> Result<&Value<B>> {
        self.get(index)
            .and_then(Nest::as_leaf)
            .ok_or_else(|| anyhow!("argument {index} is missing or not a single value"))
    }

    /// The symbolic tensor bound to positional argument `index`.
    pub fn traced_arg(&self, index: usize) -> Result<TracedTensor> {
        match self.positional(index)? {
            Value::Traced(traced) => Ok(traced.clone()),
            other => Err(anyhow!("argument {index} is not a traced tensor: {other:?}")),
        }
    }

    pub fn literal_arg(&self, index: usize) -> Result<&Literal> {
        match self.positional(index)? {
            Value::Literal(literal) => Ok(literal),
            other => Err(anyhow!("argument {index} is not a literal: {other:?}")),
        }
    }

    pub fn array_arg(&self, index: usize) -> Result<&HostArray> {
        match self.positional(index)? {
            Value::Array(array) => Ok(array),
            other => Err(anyhow!("argument {index} is not an array: {other:?}")),
        }
    }
}
