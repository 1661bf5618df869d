//! Gradient tapes for eager calls.
//!
//! A tape is activated on the current thread with [`GradientTape::activate`] or
//! [`GradientTape::run`]. While active, every traced-function call that consumes
//! a tensor the tape tracks is recorded with its backward function and side
//! outputs, and the call's results become tracked in turn. [`GradientTape::gradient`]
//! replays the records in reverse through the registered backward functions.
//!
//! Tapes stack per thread. The thread-local holds type-erased entries that are
//! downcast to the backend in use.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tracing::{debug, trace};

use crate::backend::spec::{
    ElementwiseBinaryOp, Instruction, Operand, Operation, PortableBackend, TensorInit, TensorSpec,
    ValueId, ValueType,
};
use crate::function::{library, BackwardFunction};
use crate::ops::filled_literal;
use crate::tensor::{DeviceTensor, TensorId};

thread_local! {
    static TAPE_STACK: RefCell<Vec<Arc<dyn Any + Send + Sync>>> = RefCell::new(Vec::new());
}

struct TapeEntry<B: PortableBackend + 'static> {
    backward: Arc<BackwardFunction>,
    inputs: Vec<TensorId>,
    outputs: Vec<(TensorId, TensorSpec)>,
    side_outputs: Vec<B::TensorHandle>,
}

struct TapeState<B: PortableBackend + 'static> {
    /// Keyed by tensor identity; a captured tensor is tracked exactly when the
    /// tensor itself was watched or produced by a recorded call.
    tracked: HashMap<TensorId, DeviceTensor<B>>,
    entries: Vec<TapeEntry<B>>,
}

struct TapeInner<B: PortableBackend + 'static> {
    state: Mutex<TapeState<B>>,
}

/// Records traced-function calls on tracked tensors for later differentiation.
pub struct GradientTape<B: PortableBackend + 'static> {
    inner: Arc<TapeInner<B>>,
}

impl<B: PortableBackend + 'static> Clone for GradientTape<B> {
    fn clone(&self) -> Self {
        GradientTape {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: PortableBackend + 'static> Default for GradientTape<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that removes the tape from the thread's stack when dropped.
pub struct TapeGuard {
    entry: Option<Arc<dyn Any + Send + Sync>>,
}

impl Drop for TapeGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            TAPE_STACK.with(|stack| {
                let mut stack = stack.borrow_mut();
                if let Some(position) = stack.iter().rposition(|active| same_entry(active, &entry)) {
                    stack.remove(position);
                }
            });
        }
    }
}

fn same_entry(lhs: &Arc<dyn Any + Send + Sync>, rhs: &Arc<dyn Any + Send + Sync>) -> bool {
    std::ptr::eq(Arc::as_ptr(lhs) as *const (), Arc::as_ptr(rhs) as *const ())
}

impl<B: PortableBackend + 'static> GradientTape<B> {
    pub fn new() -> Self {
        GradientTape {
            inner: Arc::new(TapeInner {
                state: Mutex::new(TapeState {
                    tracked: HashMap::new(),
                    entries: Vec::new(),
                }),
            }),
        }
    }

    /// Starts tracking `tensor` as a differentiation source.
    pub fn watch(&self, tensor: &DeviceTensor<B>) {
        let mut state = self.inner.state.lock().expect("gradient tape poisoned");
        state.tracked.insert(tensor.id(), tensor.clone());
    }

    pub fn is_tracking(&self, tensor: &DeviceTensor<B>) -> bool {
        let state = self.inner.state.lock().expect("gradient tape poisoned");
        state.tracked.contains_key(&tensor.id())
    }

    /// Number of recorded calls.
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock().expect("gradient tape poisoned");
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes the tape onto this thread's active stack until the guard drops.
    /// Activating a tape that is already active returns an inert guard, so each
    /// call is recorded on a tape at most once.
    pub fn activate(&self) -> TapeGuard {
        let entry = Arc::clone(&self.inner) as Arc<dyn Any + Send + Sync>;
        let pushed = TAPE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.iter().any(|active| same_entry(active, &entry)) {
                false
            } else {
                stack.push(Arc::clone(&entry));
                true
            }
        });
        TapeGuard {
            entry: pushed.then_some(entry),
        }
    }

    /// Runs `f` with the tape active.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let guard = self.activate();
        let result = f();
        drop(guard);
        result
    }

    /// Gradients of `target` with respect to each of `sources`; `None` where no
    /// recorded path connects them.
    pub fn gradient(
        &self,
        target: &DeviceTensor<B>,
        sources: &[&DeviceTensor<B>],
    ) -> Result<Vec<Option<DeviceTensor<B>>>> {
        if !target.dtype().is_differentiable() {
            return Err(anyhow!(
                "cannot differentiate {:?} target {}",
                target.dtype(),
                target.id()
            ));
        }
        let backend = target.backend();
        let state = self.inner.state.lock().expect("gradient tape poisoned");

        let mut grads: HashMap<TensorId, DeviceTensor<B>> = HashMap::new();
        let ones = DeviceTensor::from_literal(
            Arc::clone(&backend),
            filled_literal(target.spec(), 1.0)?,
        )?;
        grads.insert(target.id(), ones);

        for entry in state.entries.iter().rev() {
            if !entry.outputs.iter().any(|(id, _)| grads.contains_key(id)) {
                continue;
            }
            let mut inputs = Vec::with_capacity(entry.outputs.len() + entry.side_outputs.len());
            for (id, spec) in &entry.outputs {
                let seed = match grads.get(id) {
                    Some(grad) => grad.handle().clone(),
                    None => backend.materialize(TensorInit::Zeroed(spec.clone()))?,
                };
                inputs.push(seed);
            }
            inputs.extend(entry.side_outputs.iter().cloned());

            let program = library::program_for(entry.backward.backward())?;
            let results = backend.run_program(&program, &inputs)?;
            trace!(
                function = entry.backward.backward_name(),
                results = results.len(),
                "replayed backward function"
            );
            for (input, slot) in entry.inputs.iter().zip(entry.backward.gradient_slots()) {
                let Some(index) = slot else {
                    continue;
                };
                let handle = results.get(*index).cloned().ok_or_else(|| {
                    anyhow!(
                        "`{}` returned {} gradients, expected at least {}",
                        entry.backward.backward_name(),
                        results.len(),
                        index + 1
                    )
                })?;
                let spec = entry.backward.gradient_specs()[*index].clone();
                let grad = DeviceTensor::from_handle(Arc::clone(&backend), spec, handle);
                let total = match grads.remove(input) {
                    Some(existing) => add(&backend, &existing, &grad)?,
                    None => grad,
                };
                grads.insert(*input, total);
            }
        }

        Ok(sources
            .iter()
            .map(|source| grads.get(&source.id()).cloned())
            .collect())
    }

    fn tracks_any<'t>(&self, tensors: impl IntoIterator<Item = &'t DeviceTensor<B>>) -> bool {
        let state = self.inner.state.lock().expect("gradient tape poisoned");
        tensors
            .into_iter()
            .any(|tensor| state.tracked.contains_key(&tensor.id()))
    }
}

fn add<B: PortableBackend + 'static>(
    backend: &Arc<B>,
    lhs: &DeviceTensor<B>,
    rhs: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    let instruction = Instruction {
        id: ValueId(2),
        op: Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
        operands: vec![Operand::Value(ValueId(0)), Operand::Value(ValueId(1))],
        output: ValueType::Tensor(lhs.spec().clone()),
    };
    let mut outputs =
        backend.execute_instruction(&instruction, &[lhs.handle().clone(), rhs.handle().clone()])?;
    let handle = outputs
        .pop()
        .ok_or_else(|| anyhow!("backend returned no result for gradient accumulation"))?;
    Ok(DeviceTensor::from_handle(
        Arc::clone(backend),
        lhs.spec().clone(),
        handle,
    ))
}

/// Tapes active on this thread for backend `B`, innermost last.
fn active_tapes<B: PortableBackend + 'static>() -> Vec<GradientTape<B>> {
    TAPE_STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .filter_map(|entry| entry.clone().downcast::<TapeInner<B>>().ok())
            .map(|inner| GradientTape { inner })
            .collect()
    })
}

/// True when any active tape tracks one of `tensors`.
pub(crate) fn any_tracked<'t, B: PortableBackend + 'static>(
    tensors: impl IntoIterator<Item = &'t DeviceTensor<B>> + Clone,
) -> bool {
    active_tapes::<B>()
        .iter()
        .any(|tape| tape.tracks_any(tensors.clone()))
}

/// Records one call on every active tape that tracks any of `inputs`.
pub(crate) fn record<B: PortableBackend + 'static>(
    backward: &Arc<BackwardFunction>,
    inputs: &[DeviceTensor<B>],
    outputs: &[DeviceTensor<B>],
    side_outputs: &[B::TensorHandle],
) -> usize {
    let mut recorded = 0;
    for tape in active_tapes::<B>() {
        let mut state = tape.inner.state.lock().expect("gradient tape poisoned");
        if !inputs
            .iter()
            .any(|input| state.tracked.contains_key(&input.id()))
        {
            continue;
        }
        state.entries.push(TapeEntry {
            backward: Arc::clone(backward),
            inputs: inputs.iter().map(DeviceTensor::id).collect(),
            outputs: outputs
                .iter()
                .map(|output| (output.id(), output.spec().clone()))
                .collect(),
            side_outputs: side_outputs.to_vec(),
        });
        for output in outputs {
            state.tracked.insert(output.id(), output.clone());
        }
        recorded += 1;
    }
    if recorded > 0 {
        debug!(
            function = backward.forward_name(),
            tapes = recorded,
            "call recorded on gradient tape"
        );
    }
    recorded
}
