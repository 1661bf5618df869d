mod common;

use std::sync::Arc;

use anyhow::Result;
use graphfn::backend::spec::{BackendError, SpecErrorCode};
use graphfn::function::library;
use graphfn::graph::GraphArena;
use graphfn::profiling;
use graphfn::{named_defun, DeviceTensor, Nest, TraceError, Value};

use common::{assert_close, cpu, no_kwargs, single, tensor, tensors, CountingBackend};

#[test]
fn eager_and_graph_calls_agree() -> Result<()> {
    let backend = CountingBackend::new();
    let add_one = Arc::new(named_defun(backend.clone(), "dispatch_add_one", |g, args, _| {
        let x = args.traced_arg(0)?;
        let one = g.full_like(&x, 1.0)?;
        Ok(Nest::leaf(Some(g.add(&x, &one)?)))
    }));
    let x = tensor(&backend, &[3], &[1.0, 2.0, 3.0])?;

    let eager = single(add_one.call(&tensors(&[&x]), &no_kwargs())?)?;
    assert_close(&eager.to_vec_f32()?, &[2.0, 3.0, 4.0]);

    let callee = Arc::clone(&add_one);
    let wrapper = named_defun(backend.clone(), "dispatch_wrapper", move |g, args, kwargs| {
        let x = args.traced_arg(0)?;
        callee.call_in(g, &Nest::flat([Value::Traced(x)]), kwargs)
    });
    let nested = single(wrapper.call(&tensors(&[&x]), &no_kwargs())?)?;
    assert_close(&nested.to_vec_f32()?, &[2.0, 3.0, 4.0]);

    let compiled = wrapper.get_or_trace(&tensors(&[&x]), &no_kwargs())?;
    let inner = add_one.get_or_trace(&tensors(&[&x]), &no_kwargs())?;
    assert_eq!(compiled.inference().function().callees(), vec![inner.inference_name()]);

    let program = library::program_for(compiled.inference())?;
    assert_eq!(program.functions.len(), 2);
    assert_eq!(backend.programs_run(), 2);
    Ok(())
}

#[test]
fn eager_tensors_passed_to_a_graph_call_are_captured() -> Result<()> {
    let backend = cpu();
    let sum = Arc::new(named_defun(backend.clone(), "dispatch_sum", |g, args, _| {
        let a = args.traced_arg(0)?;
        let b = args.traced_arg(1)?;
        Ok(Nest::leaf(Some(g.add(&a, &b)?)))
    }));
    let bias = tensor(&backend, &[2], &[0.5, 0.25])?;
    let (callee, b) = (Arc::clone(&sum), bias.clone());
    let outer = named_defun(backend.clone(), "dispatch_bias", move |g, args, kwargs| {
        let x = args.traced_arg(0)?;
        let call_args = Nest::flat([Value::Traced(x), Value::from(&b)]);
        callee.call_in(g, &call_args, kwargs)
    });

    let x = tensor(&backend, &[2], &[1.0, 1.0])?;
    let compiled = outer.get_or_trace(&tensors(&[&x]), &no_kwargs())?;
    assert_eq!(compiled.extra_inputs().len(), 1);
    assert_eq!(compiled.extra_inputs()[0].id(), bias.id());
    let y = single(outer.call(&tensors(&[&x]), &no_kwargs())?)?;
    assert_close(&y.to_vec_f32()?, &[1.5, 1.25]);
    Ok(())
}

#[test]
fn symbolic_values_cannot_be_called_eagerly() -> Result<()> {
    let backend = cpu();
    let identity = named_defun(backend.clone(), "dispatch_identity", |_, args, _| {
        Ok(Nest::leaf(Some(args.traced_arg(0)?)))
    });
    let x = tensor(&backend, &[2], &[1.0, 2.0])?;
    // Prime the cache so the symbolic call reaches dispatch.
    identity.call(&tensors(&[&x]), &no_kwargs())?;

    let arena = GraphArena::new(Arc::clone(&backend), "holder");
    let symbolic = arena.with_builder(|g| Ok(g.placeholder(x.spec().clone())))?;
    let err = identity
        .call(&Nest::flat([Value::Traced(symbolic)]), &no_kwargs())
        .unwrap_err();
    match err.downcast_ref::<TraceError>() {
        Some(TraceError::SymbolicValueInEagerCall { function }) => {
            assert_eq!(function, "dispatch_identity")
        }
        other => panic!("unexpected error {other:?}: {err}"),
    }
    assert_eq!(identity.cache_len(), 1);
    Ok(())
}

#[test]
fn bare_and_nested_results_keep_their_shape() -> Result<()> {
    let backend = cpu();
    let bare = named_defun(backend.clone(), "dispatch_bare", |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.neg(&x)?)))
    });
    let nested = named_defun(backend.clone(), "dispatch_nested", |g, args, _| {
        let x = args.traced_arg(0)?;
        let doubled = g.add(&x, &x)?;
        Ok(Nest::seq([
            Nest::leaf(Some(doubled.clone())),
            Nest::seq([Nest::leaf(None), Nest::leaf(Some(doubled))]),
        ]))
    });
    let x = tensor(&backend, &[2], &[1.0, -2.0])?;

    let y = bare.call(&tensors(&[&x]), &no_kwargs())?;
    assert!(y.is_leaf());
    assert_close(&single(y)?.to_vec_f32()?, &[-1.0, 2.0]);

    let compiled = nested.get_or_trace(&tensors(&[&x]), &no_kwargs())?;
    assert_eq!(compiled.output_specs().len(), 1);
    assert_eq!(compiled.inference().function().results.len(), 1);

    let out = nested.call(&tensors(&[&x]), &no_kwargs())?;
    let first = out.get(0).and_then(Nest::as_leaf).cloned().flatten().expect("first output");
    let inner = out.get(1).expect("inner sequence");
    assert!(inner.get(0).and_then(Nest::as_leaf).expect("leaf").is_none());
    let last = inner.get(1).and_then(Nest::as_leaf).cloned().flatten().expect("last output");
    assert_eq!(first.id(), last.id());
    assert_close(&first.to_vec_f32()?, &[2.0, -4.0]);
    Ok(())
}

#[test]
fn all_none_results_run_without_outputs() -> Result<()> {
    let backend = cpu();
    let nothing = named_defun(backend.clone(), "dispatch_nothing", |_, _, _| Ok(Nest::leaf(None)));
    let x = tensor(&backend, &[1], &[1.0])?;
    let out = nothing.call(&tensors(&[&x]), &no_kwargs())?;
    assert!(matches!(out, Nest::Leaf(None)));
    Ok(())
}

#[test]
fn backend_failures_propagate_unchanged() -> Result<()> {
    let backend = CountingBackend::failing("device lost");
    let f = named_defun(backend.clone(), "dispatch_failing", |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.exp(&x)?)))
    });
    let x = tensor(&backend, &[1], &[0.0])?;
    let err = f.call(&tensors(&[&x]), &no_kwargs()).unwrap_err();
    match err.downcast_ref::<BackendError>() {
        Some(BackendError::Execution { message }) => assert_eq!(message, "device lost"),
        other => panic!("unexpected error {other:?}: {err}"),
    }
    assert_eq!(err.to_string(), "backend execution failure: device lost");
    assert_eq!(f.cache_len(), 1);
    Ok(())
}

#[test]
fn integer_division_by_zero_is_a_spec_violation() -> Result<()> {
    let backend = cpu();
    let divide = named_defun(backend.clone(), "dispatch_divide", |g, args, _| {
        let a = args.traced_arg(0)?;
        let b = args.traced_arg(1)?;
        Ok(Nest::leaf(Some(g.div(&a, &b)?)))
    });
    let a = DeviceTensor::from_i32(backend.clone(), &[2], vec![6, 7])?;
    let ok = DeviceTensor::from_i32(backend.clone(), &[2], vec![3, 2])?;
    let zero = DeviceTensor::from_i32(backend.clone(), &[2], vec![3, 0])?;

    let y = single(divide.call(&tensors(&[&a, &ok]), &no_kwargs())?)?;
    assert_eq!(y.to_vec_i32()?, vec![2, 3]);

    let err = divide.call(&tensors(&[&a, &zero]), &no_kwargs()).unwrap_err();
    match err.downcast_ref::<BackendError>() {
        Some(BackendError::SpecViolation(violation)) => {
            assert!(matches!(violation.code, SpecErrorCode::IntegerDivideByZero));
            assert_eq!(violation.detail.as_deref(), Some("7 / 0"));
        }
        other => panic!("unexpected error {other:?}: {err}"),
    }
    Ok(())
}

#[test]
fn dispatch_modes_are_counted() -> Result<()> {
    let backend = cpu();
    let f = named_defun(backend.clone(), "dispatch_counted", |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.mul(&x, &x)?)))
    });
    let x = tensor(&backend, &[1], &[2.0])?;
    let before = profiling::event_count("dispatch_eager");
    f.call(&tensors(&[&x]), &no_kwargs())?;
    f.call(&tensors(&[&x]), &no_kwargs())?;
    assert!(profiling::event_count("dispatch_eager") >= before + 2);
    Ok(())
}
