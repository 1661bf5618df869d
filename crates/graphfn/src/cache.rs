//! Trace cache keyed by the structural signature of a call.
//!
//! Tensors contribute their dtype and shape, host arrays their dims and contents,
//! sequences the tuple of their children, and every other value itself. Keyword
//! arguments are compile-time constants and may not contain tensors.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::debug;

use crate::backend::spec::{DType, PortableBackend, Shape};
use crate::error::TraceError;
use crate::function::CompiledFunction;
use crate::nest::Nest;
use crate::profiling;
use crate::tensor::{Literal, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SignatureKey {
    Tensor { dtype: DType, shape: Shape },
    Array { dims: Vec<usize>, bits: Vec<u32> },
    Literal(Literal),
    Seq(Vec<SignatureKey>),
}

impl SignatureKey {
    pub fn of<B: PortableBackend + 'static>(nest: &Nest<Value<B>>) -> Self {
        match nest {
            Nest::Leaf(value) => match value {
                Value::Tensor(tensor) => SignatureKey::Tensor {
                    dtype: tensor.dtype(),
                    shape: tensor.shape().clone(),
                },
                Value::Traced(traced) => SignatureKey::Tensor {
                    dtype: traced.dtype(),
                    shape: traced.shape().clone(),
                },
                Value::Array(array) => SignatureKey::Array {
                    dims: array.dims().to_vec(),
                    bits: array.data().iter().map(|value| value.to_bits()).collect(),
                },
                Value::Literal(literal) => SignatureKey::Literal(literal.clone()),
            },
            Nest::Seq(items) => SignatureKey::Seq(items.iter().map(SignatureKey::of).collect()),
        }
    }
}

/// Full cache key of one call: positional signature plus sorted keyword signatures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    args: SignatureKey,
    kwargs: Vec<(String, SignatureKey)>,
}

impl CacheKey {
    pub fn from_call<B: PortableBackend + 'static>(
        args: &Nest<Value<B>>,
        kwargs: &BTreeMap<String, Nest<Value<B>>>,
    ) -> Result<Self> {
        let mut keyed = Vec::with_capacity(kwargs.len());
        for (name, value) in kwargs {
            if value.leaves().into_iter().any(Value::is_tensor) {
                return Err(TraceError::TensorKeywordArgument { name: name.clone() }.into());
            }
            keyed.push((name.clone(), SignatureKey::of(value)));
        }
        Ok(CacheKey {
            args: SignatureKey::of(args),
            kwargs: keyed,
        })
    }

    pub fn args(&self) -> &SignatureKey {
        &self.args
    }
}

/// Compiled functions of one wrapped body, one per structural signature.
pub struct TraceCache<B: PortableBackend + 'static> {
    name: String,
    entries: Mutex<HashMap<CacheKey, Arc<CompiledFunction<B>>>>,
}

impl<B: PortableBackend + 'static> TraceCache<B> {
    pub fn new(name: impl Into<String>) -> Self {
        TraceCache {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("trace cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CompiledFunction<B>>> {
        self.entries
            .lock()
            .expect("trace cache poisoned")
            .get(key)
            .cloned()
    }

    /// Returns the function cached under `key`, tracing it on a miss. The lock is
    /// not held while tracing; when two threads miss on the same key the first
    /// insertion wins and both callers receive it.
    pub fn get_or_trace<F>(&self, key: CacheKey, trace: F) -> Result<Arc<CompiledFunction<B>>>
    where
        F: FnOnce() -> Result<Arc<CompiledFunction<B>>>,
    {
        if let Some(hit) = self.get(&key) {
            profiling::cache_event("trace_cache_hit");
            debug!(function = %self.name, inference = hit.inference_name(), "trace cache hit");
            return Ok(hit);
        }
        profiling::cache_event("trace_cache_miss");
        debug!(function = %self.name, "trace cache miss");

        let traced = trace()?;
        let mut entries = self.entries.lock().expect("trace cache poisoned");
        let stored = entries.entry(key).or_insert_with(|| Arc::clone(&traced));
        if !Arc::ptr_eq(stored, &traced) {
            profiling::cache_event("trace_cache_race_lost");
            debug!(
                function = %self.name,
                orphaned = traced.inference_name(),
                "concurrent trace lost the insertion race"
            );
        }
        Ok(Arc::clone(stored))
    }
}
