//! Process-wide function library.
//!
//! Registered functions are addressable by name from any graph: call nodes carry
//! only the callee name and programs are assembled from the library when a
//! function is executed. Registration lowers and serializes outside the lock and
//! inserts under a single write lock, so a partially registered function is never
//! observable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{
    atomic::{AtomicU64, Ordering as AtomicOrdering},
    Arc, RwLock,
};

use anyhow::{anyhow, Result};
use once_cell::sync::{Lazy, OnceCell};
use tracing::debug;

use crate::backend::hashing::fingerprint_serializable;
use crate::backend::spec::{Function, PortableBackend, Program};
use crate::env;
use crate::error::TraceError;
use crate::profiling;

use super::backward::BackwardFunction;
use super::fragment::{FragmentId, GraphFragment};

static LIBRARY: Lazy<RwLock<FunctionLibrary>> = Lazy::new(|| RwLock::new(FunctionLibrary::default()));
static FUNCTION_UID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct FunctionLibrary {
    functions: HashMap<String, Arc<RegisteredFunction>>,
    fragments: HashMap<FragmentId, String>,
    gradients: HashMap<String, GradientLink>,
}

/// Role a generated function plays; decides its name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionRole {
    Inference,
    Forward,
    Backward,
}

impl FunctionRole {
    pub fn prefix(self) -> &'static str {
        match self {
            FunctionRole::Inference => "__inference_",
            FunctionRole::Forward => "__forward_",
            FunctionRole::Backward => "__backward_",
        }
    }
}

/// How a fragment should be named in the library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationName {
    /// `<prefix><base>_<uid>` with a process-unique uid.
    Generated { role: FunctionRole, base: String },
    /// Exactly this name; collisions with a different definition are errors.
    Forced(String),
}

impl RegistrationName {
    pub fn generated(role: FunctionRole, base: impl Into<String>) -> Self {
        RegistrationName::Generated {
            role,
            base: base.into(),
        }
    }

    fn resolve(&self) -> String {
        match self {
            RegistrationName::Generated { role, base } => {
                let uid = FUNCTION_UID.fetch_add(1, AtomicOrdering::Relaxed);
                format!("{}{}_{}", role.prefix(), sanitize(base), uid)
            }
            RegistrationName::Forced(name) => name.clone(),
        }
    }
}

/// Reduces an arbitrary label to `[A-Za-z0-9_]`.
pub fn sanitize(base: &str) -> String {
    let mut out = String::with_capacity(base.len());
    let mut last_underscore = false;
    for ch in base.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_underscore = false;
        } else if !last_underscore && !out.is_empty() {
            out.push('_');
            last_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("fn");
    }
    out
}

/// A function definition stored in the library.
pub struct RegisteredFunction {
    name: String,
    fingerprint: u64,
    function: Arc<Function>,
    payload: Arc<[u8]>,
    program: OnceCell<Arc<Program>>,
}

impl RegisteredFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    /// Bincode-serialized definition.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("name", &self.name)
            .field("fingerprint", &format_args!("{:#018x}", self.fingerprint))
            .finish()
    }
}

/// Anything that can produce the backward function for a registered function.
pub trait Differentiable: Send + Sync {
    fn backward_function(&self) -> Result<Arc<BackwardFunction>>;
}

/// Gradient metadata attached to a function name.
#[derive(Clone)]
pub struct GradientLink {
    pub source: Arc<dyn Differentiable>,
    /// True when the function's outputs already include the side outputs the
    /// backward function consumes.
    pub side_outputs_exported: bool,
}

/// Lowers, serializes, and inserts `fragment` into the library.
pub fn register<B: PortableBackend + 'static>(
    name: RegistrationName,
    fragment: &GraphFragment<B>,
) -> Result<Arc<RegisteredFunction>> {
    {
        let library = LIBRARY.read().expect("function library poisoned");
        if let Some(existing) = library.fragments.get(&fragment.id()) {
            return Err(TraceError::FragmentAlreadyRegistered {
                fragment: fragment.id(),
                name: existing.clone(),
            }
            .into());
        }
    }

    let resolved = name.resolve();
    let function = fragment.lower(&resolved)?;
    let (payload, fingerprint) = fingerprint_serializable(&function)?;
    if env::verify_payloads_enabled() {
        let decoded: Function = bincode::deserialize(&payload)?;
        if decoded != function {
            return Err(anyhow!("serialized payload of `{resolved}` does not round-trip"));
        }
    }

    let mut library = LIBRARY.write().expect("function library poisoned");
    if let Some(existing) = library.fragments.get(&fragment.id()) {
        return Err(TraceError::FragmentAlreadyRegistered {
            fragment: fragment.id(),
            name: existing.clone(),
        }
        .into());
    }
    if let Some(existing) = library.functions.get(&resolved).cloned() {
        if existing.fingerprint != fingerprint || *existing.function != function {
            return Err(TraceError::RegistrationConflict { name: resolved }.into());
        }
        library.fragments.insert(fragment.id(), resolved.clone());
        profiling::cache_event("function_reregistered");
        debug!(function = %resolved, fingerprint, "identical definition already registered");
        return Ok(existing);
    }

    if env::dump_functions_enabled() {
        debug!(function = %resolved, "registered function:\n{function}");
    }
    let entry = Arc::new(RegisteredFunction {
        name: resolved.clone(),
        fingerprint,
        function: Arc::new(function),
        payload: Arc::from(payload),
        program: OnceCell::new(),
    });
    library.fragments.insert(fragment.id(), resolved.clone());
    library.functions.insert(resolved.clone(), Arc::clone(&entry));
    profiling::cache_event("function_registered");
    debug!(
        function = %resolved,
        fragment = %fragment.id(),
        fingerprint,
        "function registered"
    );
    Ok(entry)
}

pub fn lookup(name: &str) -> Option<Arc<RegisteredFunction>> {
    let library = LIBRARY.read().expect("function library poisoned");
    library.functions.get(name).cloned()
}

pub fn is_registered(name: &str) -> bool {
    lookup(name).is_some()
}

/// Program rooted at `entry` containing every function reachable through calls.
pub fn program_for(entry: &RegisteredFunction) -> Result<Arc<Program>> {
    entry
        .program
        .get_or_try_init(|| -> Result<Arc<Program>> {
            let mut functions = vec![entry.function().clone()];
            let mut seen: HashSet<String> = HashSet::from([entry.name.clone()]);
            let mut queue: VecDeque<String> = entry
                .function()
                .callees()
                .into_iter()
                .map(str::to_string)
                .collect();
            while let Some(name) = queue.pop_front() {
                if !seen.insert(name.clone()) {
                    continue;
                }
                let callee = lookup(&name).ok_or_else(|| TraceError::UnknownFunction {
                    name: name.clone(),
                })?;
                queue.extend(callee.function().callees().into_iter().map(str::to_string));
                functions.push(callee.function().clone());
            }
            Ok(Arc::new(Program::new(entry.name.clone()).with_functions(functions)))
        })
        .cloned()
}

pub fn attach_gradient(name: &str, link: GradientLink) {
    let mut library = LIBRARY.write().expect("function library poisoned");
    library.gradients.insert(name.to_string(), link);
}

pub fn gradient_link(name: &str) -> Option<GradientLink> {
    let library = LIBRARY.read().expect("function library poisoned");
    library.gradients.get(name).cloned()
}
