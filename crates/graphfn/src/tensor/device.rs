//! Device-side tensor wrapper that tracks backend handles and identity.

use std::fmt;
use std::sync::{
    atomic::{AtomicU64, Ordering as AtomicOrdering},
    Arc,
};

use anyhow::{anyhow, Result};

use crate::backend::spec::{DType, PortableBackend, Shape, TensorInit, TensorLiteral, TensorSpec};

static TENSOR_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an eager tensor. Clones share the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId(u64);

impl TensorId {
    fn next() -> Self {
        TensorId(TENSOR_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Eager tensor owned by the caller: a backend handle plus static metadata.
pub struct DeviceTensor<B: PortableBackend + 'static> {
    backend: Arc<B>,
    spec: TensorSpec,
    handle: B::TensorHandle,
    id: TensorId,
}

impl<B: PortableBackend + 'static> Clone for DeviceTensor<B> {
    fn clone(&self) -> Self {
        DeviceTensor {
            backend: Arc::clone(&self.backend),
            spec: self.spec.clone(),
            handle: self.handle.clone(),
            id: self.id,
        }
    }
}

impl<B: PortableBackend + 'static> fmt::Debug for DeviceTensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("id", &self.id)
            .field("backend", &self.backend.backend_name())
            .field("spec", &self.spec)
            .finish()
    }
}

impl<B: PortableBackend + 'static> DeviceTensor<B> {
    /// Wraps a handle produced by the backend, assigning a fresh identity.
    pub fn from_handle(backend: Arc<B>, spec: TensorSpec, handle: B::TensorHandle) -> Self {
        DeviceTensor {
            backend,
            spec,
            handle,
            id: TensorId::next(),
        }
    }

    pub fn from_literal(backend: Arc<B>, literal: TensorLiteral) -> Result<Self> {
        let spec = literal.spec.clone();
        let handle = backend.materialize(TensorInit::Literal(literal))?;
        Ok(Self::from_handle(backend, spec, handle))
    }

    pub fn from_f32(backend: Arc<B>, dims: &[usize], values: Vec<f32>) -> Result<Self> {
        check_len(dims, values.len())?;
        Self::from_literal(backend, TensorLiteral::from_f32(dims, &values))
    }

    pub fn from_i32(backend: Arc<B>, dims: &[usize], values: Vec<i32>) -> Result<Self> {
        check_len(dims, values.len())?;
        Self::from_literal(backend, TensorLiteral::from_i32(dims, &values))
    }

    pub fn scalar_f32(backend: Arc<B>, value: f32) -> Result<Self> {
        Self::from_f32(backend, &[], vec![value])
    }

    pub fn zeros(backend: Arc<B>, spec: TensorSpec) -> Result<Self> {
        let handle = backend.materialize(TensorInit::Zeroed(spec.clone()))?;
        Ok(Self::from_handle(backend, spec, handle))
    }

    pub fn id(&self) -> TensorId {
        self.id
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

    pub fn handle(&self) -> &B::TensorHandle {
        &self.handle
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    pub fn to_literal(&self) -> Result<TensorLiteral> {
        Ok(self.backend.to_literal(&self.handle)?)
    }

    pub fn to_vec_f32(&self) -> Result<Vec<f32>> {
        self.to_literal()?
            .to_f32_vec()
            .ok_or_else(|| anyhow!("tensor {} is {:?}, not F32", self.id, self.spec.dtype))
    }

    pub fn to_vec_i32(&self) -> Result<Vec<i32>> {
        self.to_literal()?
            .to_i32_vec()
            .ok_or_else(|| anyhow!("tensor {} is {:?}, not Si32", self.id, self.spec.dtype))
    }
}

fn check_len(dims: &[usize], len: usize) -> Result<()> {
    let expected: usize = dims.iter().product();
    if expected != len {
        return Err(anyhow!(
            "shape {:?} holds {} elements but {} values were supplied",
            dims,
            expected,
            len
        ));
    }
    Ok(())
}
