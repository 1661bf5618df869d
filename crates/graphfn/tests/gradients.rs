mod common;

use std::sync::Arc;

use anyhow::Result;
use graphfn::backend::spec::DType;
use graphfn::function::library;
use graphfn::{named_defun, DeviceTensor, GradientTape, Nest, Value};

use common::{assert_close, cpu, no_kwargs, single, tensor, tensors, CountingBackend};

#[test]
fn square_gradient_at_three_is_six() -> Result<()> {
    let backend = cpu();
    let square = named_defun(backend.clone(), "grad_square", |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.mul(&x, &x)?)))
    });

    let x = DeviceTensor::scalar_f32(backend.clone(), 3.0)?;
    let tape = GradientTape::new();
    tape.watch(&x);
    let y = single(tape.run(|| square.call(&tensors(&[&x]), &no_kwargs()))?)?;
    assert_close(&y.to_vec_f32()?, &[9.0]);
    assert_eq!(tape.len(), 1);

    let grads = tape.gradient(&y, &[&x])?;
    let dx = grads[0].as_ref().expect("x is on the recorded path");
    assert_close(&dx.to_vec_f32()?, &[6.0]);
    Ok(())
}

#[test]
fn backward_is_synthesized_lazily_and_once() -> Result<()> {
    let backend = CountingBackend::new();
    let cube = named_defun(backend.clone(), "lazy_cube", |g, args, _| {
        let x = args.traced_arg(0)?;
        let sq = g.mul(&x, &x)?;
        Ok(Nest::leaf(Some(g.mul(&sq, &x)?)))
    });
    let x = tensor(&backend, &[2], &[1.0, 2.0])?;

    let compiled = cube.get_or_trace(&tensors(&[&x]), &no_kwargs())?;
    cube.call(&tensors(&[&x]), &no_kwargs())?;
    assert!(!compiled.has_backward());

    let tape = GradientTape::new();
    tape.watch(&x);
    let y = single(tape.run(|| cube.call(&tensors(&[&x]), &no_kwargs()))?)?;
    assert!(compiled.has_backward());
    let backward = compiled.backward()?;
    assert!(backward.forward_name().starts_with("__forward_lazy_cube_"));
    assert!(backward.backward_name().starts_with("__backward_lazy_cube_"));
    assert!(Arc::ptr_eq(&backward, &compiled.backward()?));
    assert!(library::is_registered(backward.forward_name()));
    assert!(library::is_registered(backward.backward_name()));

    let entries = backend.entries();
    assert!(entries[0].starts_with("__inference_lazy_cube_"));
    assert_eq!(entries[1], backward.forward_name());

    let grads = tape.gradient(&y, &[&x])?;
    assert_close(&grads[0].as_ref().expect("dx").to_vec_f32()?, &[3.0, 12.0]);
    assert_eq!(backend.entries().last().map(String::as_str), Some(backward.backward_name()));
    Ok(())
}

#[test]
fn chained_calls_differentiate_end_to_end() -> Result<()> {
    let backend = cpu();
    let square = named_defun(backend.clone(), "chain_square", |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.mul(&x, &x)?)))
    });
    let add_one = named_defun(backend.clone(), "chain_add_one", |g, args, _| {
        let x = args.traced_arg(0)?;
        let one = g.full_like(&x, 1.0)?;
        Ok(Nest::leaf(Some(g.add(&x, &one)?)))
    });

    let x = tensor(&backend, &[2], &[3.0, -1.0])?;
    let tape = GradientTape::new();
    tape.watch(&x);
    let z = tape.run(|| -> Result<DeviceTensor<_>> {
        let y = single(square.call(&tensors(&[&x]), &no_kwargs())?)?;
        single(add_one.call(&tensors(&[&y]), &no_kwargs())?)
    })?;
    assert_close(&z.to_vec_f32()?, &[10.0, 2.0]);
    assert_eq!(tape.len(), 2);

    let grads = tape.gradient(&z, &[&x])?;
    assert_close(&grads[0].as_ref().expect("dx").to_vec_f32()?, &[6.0, -2.0]);
    Ok(())
}

#[test]
fn gradients_flow_through_nested_call_nodes() -> Result<()> {
    let backend = cpu();
    let square = Arc::new(named_defun(backend.clone(), "nested_square", |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.mul(&x, &x)?)))
    }));
    let callee = Arc::clone(&square);
    let outer = named_defun(backend.clone(), "nested_outer", move |g, args, kwargs| {
        let x = args.traced_arg(0)?;
        let y = single(callee.call_in(g, &Nest::flat([Value::Traced(x)]), kwargs)?)?;
        let two = g.full_like(&y, 2.0)?;
        Ok(Nest::leaf(Some(g.mul(&y, &two)?)))
    });

    let x = DeviceTensor::scalar_f32(backend.clone(), 3.0)?;
    let tape = GradientTape::new();
    tape.watch(&x);
    let y = single(tape.run(|| outer.call(&tensors(&[&x]), &no_kwargs()))?)?;
    assert_close(&y.to_vec_f32()?, &[18.0]);

    let grads = tape.gradient(&y, &[&x])?;
    assert_close(&grads[0].as_ref().expect("dx").to_vec_f32()?, &[12.0]);

    let inner = square.get_or_trace(&tensors(&[&x]), &no_kwargs())?;
    assert!(inner.has_backward());
    Ok(())
}

#[test]
fn captured_tensors_receive_gradients() -> Result<()> {
    let backend = cpu();
    let weight = tensor(&backend, &[3], &[4.0, 5.0, 6.0])?;
    let w = weight.clone();
    let scale = named_defun(backend.clone(), "weighted", move |g, args, _| {
        let x = args.traced_arg(0)?;
        let w = g.capture(&w)?;
        Ok(Nest::leaf(Some(g.mul(&x, &w)?)))
    });

    let x = tensor(&backend, &[3], &[1.0, 2.0, 3.0])?;
    let tape = GradientTape::new();
    tape.watch(&weight);
    let y = single(tape.run(|| scale.call(&tensors(&[&x]), &no_kwargs()))?)?;
    assert_eq!(tape.len(), 1);

    let grads = tape.gradient(&y, &[&weight, &x])?;
    assert_close(&grads[0].as_ref().expect("dw").to_vec_f32()?, &[1.0, 2.0, 3.0]);
    assert_close(&grads[1].as_ref().expect("dx").to_vec_f32()?, &[4.0, 5.0, 6.0]);
    Ok(())
}

#[test]
fn untracked_calls_are_not_recorded() -> Result<()> {
    let backend = cpu();
    let square = named_defun(backend.clone(), "untracked_square", |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.mul(&x, &x)?)))
    });
    let watched = tensor(&backend, &[1], &[1.0])?;
    let other = tensor(&backend, &[1], &[2.0])?;
    let tape = GradientTape::new();
    tape.watch(&watched);
    let y = single(tape.run(|| square.call(&tensors(&[&other]), &no_kwargs()))?)?;
    assert!(tape.is_empty());
    assert!(!tape.is_tracking(&y));

    let compiled = square.get_or_trace(&tensors(&[&other]), &no_kwargs())?;
    assert!(!compiled.has_backward());
    Ok(())
}

#[test]
fn integer_outputs_have_no_gradient_slot() -> Result<()> {
    let backend = cpu();
    let mixed = named_defun(backend.clone(), "mixed_dtypes", |g, args, _| {
        let x = args.traced_arg(0)?;
        let n = args.traced_arg(1)?;
        let doubled = g.add(&n, &n)?;
        Ok(Nest::seq([Nest::leaf(Some(x)), Nest::leaf(Some(doubled))]))
    });

    let x = tensor(&backend, &[2], &[1.5, 2.5])?;
    let n = DeviceTensor::from_i32(backend.clone(), &[2], vec![1, 2])?;
    let compiled = mixed.get_or_trace(&tensors(&[&x, &n]), &no_kwargs())?;
    let backward = compiled.backward()?;
    assert_eq!(backward.gradient_slots(), &[Some(0), None]);
    assert_eq!(backward.backward().function().results.len(), 1);
    assert_eq!(backward.seed_specs()[1].dtype, DType::Si32);

    let tape = GradientTape::new();
    tape.watch(&x);
    tape.watch(&n);
    let outputs = tape.run(|| mixed.call(&tensors(&[&x, &n]), &no_kwargs()))?;
    let ys = outputs.into_present();
    assert_eq!(ys.len(), 2);
    assert_eq!(ys[1].to_vec_i32()?, vec![2, 4]);

    let grads = tape.gradient(&ys[0], &[&x, &n])?;
    assert_close(&grads[0].as_ref().expect("dx").to_vec_f32()?, &[1.0, 1.0]);
    assert!(grads[1].is_none());
    Ok(())
}

#[test]
fn stop_gradient_cuts_the_path() -> Result<()> {
    let backend = cpu();
    let f = named_defun(backend.clone(), "stopped", |g, args, _| {
        let x = args.traced_arg(0)?;
        let frozen = g.stop_gradient(&x)?;
        Ok(Nest::leaf(Some(g.mul(&x, &frozen)?)))
    });
    let x = DeviceTensor::scalar_f32(backend.clone(), 5.0)?;
    let tape = GradientTape::new();
    tape.watch(&x);
    let y = single(tape.run(|| f.call(&tensors(&[&x]), &no_kwargs()))?)?;
    let grads = tape.gradient(&y, &[&x])?;
    assert_close(&grads[0].as_ref().expect("dx").to_vec_f32()?, &[5.0]);
    Ok(())
}

#[test]
fn reductions_and_broadcasts_differentiate() -> Result<()> {
    let backend = cpu();
    let f = named_defun(backend.clone(), "sum_of_tanh", |g, args, _| {
        let x = args.traced_arg(0)?;
        let t = g.tanh(&x)?;
        Ok(Nest::leaf(Some(g.reduce_sum(&t, &[0, 1], false)?)))
    });
    let values = [0.0f32, 0.5, -0.5, 1.0];
    let x = tensor(&backend, &[2, 2], &values)?;
    let tape = GradientTape::new();
    tape.watch(&x);
    let y = single(tape.run(|| f.call(&tensors(&[&x]), &no_kwargs()))?)?;
    let expected_sum: f32 = values.iter().map(|v| v.tanh()).sum();
    assert_close(&y.to_vec_f32()?, &[expected_sum]);

    let grads = tape.gradient(&y, &[&x])?;
    let expected: Vec<f32> = values.iter().map(|v| 1.0 - v.tanh() * v.tanh()).collect();
    assert_close(&grads[0].as_ref().expect("dx").to_vec_f32()?, &expected);
    Ok(())
}

#[test]
fn reactivating_an_active_tape_records_once() -> Result<()> {
    let backend = cpu();
    let square = named_defun(backend.clone(), "reentrant_square", |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.mul(&x, &x)?)))
    });
    let x = DeviceTensor::scalar_f32(backend.clone(), 3.0)?;
    let tape = GradientTape::new();
    tape.watch(&x);
    let y = tape.run(|| tape.run(|| square.call(&tensors(&[&x]), &no_kwargs())))?;
    let y = single(y)?;
    assert_eq!(tape.len(), 1);

    let grads = tape.gradient(&y, &[&x])?;
    assert_close(&grads[0].as_ref().expect("dx").to_vec_f32()?, &[6.0]);

    // The outer activation still owns the stack entry after the inner guard drops.
    let _outer = tape.activate();
    {
        let _inner = tape.activate();
    }
    let z = single(square.call(&tensors(&[&y]), &no_kwargs())?)?;
    assert_eq!(tape.len(), 2);
    assert!(tape.is_tracking(&z));
    Ok(())
}

#[test]
fn tracked_captures_inside_a_graph_call_the_forward_function() -> Result<()> {
    let backend = cpu();
    let weight = tensor(&backend, &[2], &[4.0, 5.0])?;
    let w = weight.clone();
    let scaled = Arc::new(named_defun(backend.clone(), "graph_scaled", move |g, args, _| {
        let x = args.traced_arg(0)?;
        let w = g.capture(&w)?;
        Ok(Nest::leaf(Some(g.mul(&x, &w)?)))
    }));
    let callee = Arc::clone(&scaled);
    let squared = named_defun(backend.clone(), "graph_scaled_squared", move |g, args, kwargs| {
        let x = args.traced_arg(0)?;
        let y = single(callee.call_in(g, &Nest::flat([Value::Traced(x)]), kwargs)?)?;
        Ok(Nest::leaf(Some(g.mul(&y, &y)?)))
    });

    let x = tensor(&backend, &[2], &[1.0, 2.0])?;
    let tape = GradientTape::new();
    tape.watch(&weight);
    let z = single(tape.run(|| squared.call(&tensors(&[&x]), &no_kwargs()))?)?;
    assert_close(&z.to_vec_f32()?, &[16.0, 100.0]);
    assert_eq!(tape.len(), 1);

    let inner = scaled.get_or_trace(&tensors(&[&x]), &no_kwargs())?;
    let outer = squared.get_or_trace(&tensors(&[&x]), &no_kwargs())?;
    let forward_name = inner.backward()?.forward_name().to_string();
    assert_eq!(outer.inference().function().callees(), vec![forward_name.as_str()]);
    assert_eq!(outer.extra_inputs().len(), 1);
    assert_eq!(outer.extra_inputs()[0].id(), weight.id());

    let grads = tape.gradient(&z, &[&weight])?;
    assert_close(&grads[0].as_ref().expect("dw").to_vec_f32()?, &[8.0, 40.0]);
    Ok(())
}
