//! User-facing entry point: wrap a graph-building closure into a [`TracedFunction`].
//!
//! ```ignore
//! let square = graphfn::defun(backend.clone(), |g, args, _kwargs| {
//!     let x = args.traced_arg(0)?;
//!     Ok(Nest::leaf(Some(g.mul(&x, &x)?)))
//! });
//! let y = square.call(&graphfn::args([x.into()]), &Kwargs::new())?;
//! ```

use std::any::type_name;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::backend::spec::PortableBackend;
use crate::cache::{CacheKey, TraceCache};
use crate::dispatch;
use crate::error::TraceError;
use crate::function::library::sanitize;
use crate::function::trace::trace;
use crate::function::CompiledFunction;
use crate::graph::{GraphBuilder, TracedTensor};
use crate::nest::Nest;
use crate::tensor::{DeviceTensor, Value};

/// Keyword arguments; baked into the trace and part of the cache key.
pub type Kwargs<B> = BTreeMap<String, Nest<Value<B>>>;

/// Signature of a traced body. Tensor leaves of the positional arguments arrive
/// as [`Value::Traced`] placeholders; every other leaf arrives unchanged.
pub type TraceBody<B> = dyn Fn(&mut GraphBuilder<'_, B>, &Nest<Value<B>>, &Kwargs<B>) -> Result<Nest<Option<TracedTensor>>>
    + Send
    + Sync;

#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    /// Base for generated function names; defaults to the closure's type name.
    pub name: Option<String>,
    /// Registers the inference function under exactly this name. A function with
    /// a forced name accepts a single argument signature; calls with any other
    /// signature fail with [`TraceError::ForcedNameSignature`].
    pub forced_name: Option<String>,
}

/// A closure traced once per argument signature and dispatched per call.
pub struct TracedFunction<B: PortableBackend + 'static> {
    backend: Arc<B>,
    name: String,
    forced_name: Option<String>,
    body: Arc<TraceBody<B>>,
    cache: TraceCache<B>,
}

impl<B: PortableBackend + 'static> TracedFunction<B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of distinct signatures traced so far.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Calls the function from eager code.
    pub fn call(
        &self,
        args: &Nest<Value<B>>,
        kwargs: &Kwargs<B>,
    ) -> Result<Nest<Option<DeviceTensor<B>>>> {
        let compiled = self.get_or_trace(args, kwargs)?;
        dispatch::call_eager(&compiled, args)
    }

    /// Calls the function while building another graph, emitting a call node.
    pub fn call_in(
        &self,
        builder: &mut GraphBuilder<'_, B>,
        args: &Nest<Value<B>>,
        kwargs: &Kwargs<B>,
    ) -> Result<Nest<Option<TracedTensor>>> {
        let compiled = self.get_or_trace(args, kwargs)?;
        dispatch::call_graph(&compiled, builder, args)
    }

    /// The compiled function for this call's signature, tracing on a miss.
    pub fn get_or_trace(
        &self,
        args: &Nest<Value<B>>,
        kwargs: &Kwargs<B>,
    ) -> Result<Arc<CompiledFunction<B>>> {
        let key = CacheKey::from_call(args, kwargs)?;
        if let Some(forced) = &self.forced_name {
            if self.cache.get(&key).is_none() && !self.cache.is_empty() {
                return Err(TraceError::ForcedNameSignature {
                    name: forced.clone(),
                }
                .into());
            }
        }
        self.cache.get_or_trace(key, || {
            trace(
                Arc::clone(&self.backend),
                &self.name,
                self.forced_name.as_deref(),
                self.body.as_ref(),
                args,
                kwargs,
            )
        })
    }
}

impl<B: PortableBackend + 'static> fmt::Debug for TracedFunction<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedFunction")
            .field("name", &self.name)
            .field("forced_name", &self.forced_name)
            .field("traces", &self.cache.len())
            .finish()
    }
}

pub fn defun<B, F>(backend: Arc<B>, f: F) -> TracedFunction<B>
where
    B: PortableBackend + 'static,
    F: Fn(&mut GraphBuilder<'_, B>, &Nest<Value<B>>, &Kwargs<B>) -> Result<Nest<Option<TracedTensor>>>
        + Send
        + Sync
        + 'static,
{
    with_options(backend, TraceOptions::default(), f)
}

pub fn named_defun<B, F>(backend: Arc<B>, name: &str, f: F) -> TracedFunction<B>
where
    B: PortableBackend + 'static,
    F: Fn(&mut GraphBuilder<'_, B>, &Nest<Value<B>>, &Kwargs<B>) -> Result<Nest<Option<TracedTensor>>>
        + Send
        + Sync
        + 'static,
{
    let options = TraceOptions {
        name: Some(name.to_string()),
        ..TraceOptions::default()
    };
    with_options(backend, options, f)
}

pub fn with_options<B, F>(backend: Arc<B>, options: TraceOptions, f: F) -> TracedFunction<B>
where
    B: PortableBackend + 'static,
    F: Fn(&mut GraphBuilder<'_, B>, &Nest<Value<B>>, &Kwargs<B>) -> Result<Nest<Option<TracedTensor>>>
        + Send
        + Sync
        + 'static,
{
    let name = match options.name {
        Some(name) => sanitize(&name),
        None => default_name::<F>(),
    };
    TracedFunction {
        backend,
        cache: TraceCache::new(name.clone()),
        name,
        forced_name: options.forced_name,
        body: Arc::new(f),
    }
}

fn default_name<F>() -> String {
    let full = type_name::<F>();
    // Closures render as `path::to::fn::{{closure}}`; keep the enclosing fn.
    let trimmed = full.trim_end_matches("::{{closure}}");
    let last = trimmed.rsplit("::").next().unwrap_or(trimmed);
    sanitize(last)
}

/// Positional arguments from a flat list of values.
pub fn args<B: PortableBackend + 'static>(values: impl IntoIterator<Item = Value<B>>) -> Nest<Value<B>> {
    Nest::flat(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outer_fn_name() -> String {
        let f = || ();
        fn name_of<F>(_: &F) -> String {
            default_name::<F>()
        }
        name_of(&f)
    }

    #[test]
    fn default_name_uses_enclosing_function() {
        assert_eq!(outer_fn_name(), "outer_fn_name");
    }

    #[test]
    fn default_name_of_plain_type() {
        assert_eq!(default_name::<String>(), "String");
    }
}
