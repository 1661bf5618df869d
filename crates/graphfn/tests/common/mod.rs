#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use graphfn::backend::spec::{
    BackendError, BackendResult, Instruction, PortableBackend, Program, TensorInit, TensorLiteral,
};
use graphfn::{DeviceTensor, Kwargs, Nest, Value};
use graphfn_backend_ref_cpu::CpuPortableBackend;

pub type CpuHandle = <CpuPortableBackend as PortableBackend>::TensorHandle;

/// Reference CPU backend that counts program launches.
#[derive(Default)]
pub struct CountingBackend {
    inner: CpuPortableBackend,
    programs: AtomicUsize,
    entries: std::sync::Mutex<Vec<String>>,
    fail_with: Option<&'static str>,
}

impl CountingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A backend whose every program launch fails with `message`.
    pub fn failing(message: &'static str) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(message),
            ..Self::default()
        })
    }

    pub fn programs_run(&self) -> usize {
        self.programs.load(Ordering::SeqCst)
    }

    /// Entry function names in launch order.
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("entry log mutex poisoned")
            .clone()
    }
}

impl PortableBackend for CountingBackend {
    type TensorHandle = CpuHandle;

    fn backend_name(&self) -> &str {
        "counting-cpu"
    }

    fn materialize(&self, init: TensorInit) -> BackendResult<Self::TensorHandle> {
        self.inner.materialize(init)
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        self.inner.to_literal(tensor)
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        self.inner.execute_instruction(instruction, inputs)
    }

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        self.programs.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .expect("entry log mutex poisoned")
            .push(program.entry.clone());
        if let Some(message) = self.fail_with {
            return Err(BackendError::execution(message));
        }
        self.inner.run_program(program, entry_inputs)
    }
}

pub fn cpu() -> Arc<CpuPortableBackend> {
    Arc::new(CpuPortableBackend::new())
}

pub fn tensor<B: PortableBackend + 'static>(
    backend: &Arc<B>,
    dims: &[usize],
    values: &[f32],
) -> Result<DeviceTensor<B>> {
    DeviceTensor::from_f32(Arc::clone(backend), dims, values.to_vec())
}

pub fn no_kwargs<B: PortableBackend + 'static>() -> Kwargs<B> {
    BTreeMap::new()
}

/// Positional arguments built from eager tensors.
pub fn tensors<B: PortableBackend + 'static>(values: &[&DeviceTensor<B>]) -> Nest<Value<B>> {
    Nest::flat(values.iter().map(|tensor| Value::from(*tensor)))
}

/// The single tensor of a bare result.
pub fn single<T>(result: Nest<Option<T>>) -> Result<T> {
    result
        .into_leaf()
        .flatten()
        .ok_or_else(|| anyhow!("expected a single present output"))
}

pub fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() <= 1e-5, "{actual:?} vs {expected:?}");
    }
}
