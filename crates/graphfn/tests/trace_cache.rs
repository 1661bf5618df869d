mod common;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use graphfn::{named_defun, HostArray, Literal, Nest, TraceError, Value};

use common::{assert_close, no_kwargs, single, tensor, tensors, CountingBackend};

#[test]
fn equal_signatures_share_one_compiled_function() -> Result<()> {
    let backend = CountingBackend::new();
    let add_one = named_defun(backend.clone(), "add_one", |g, args, _| {
        let x = args.traced_arg(0)?;
        let one = g.full_like(&x, 1.0)?;
        Ok(Nest::leaf(Some(g.add(&x, &one)?)))
    });

    let a = tensor(&backend, &[3], &[1.0, 2.0, 3.0])?;
    let b = tensor(&backend, &[3], &[7.0, 8.0, 9.0])?;
    let first = add_one.get_or_trace(&tensors(&[&a]), &no_kwargs())?;
    let second = add_one.get_or_trace(&tensors(&[&b]), &no_kwargs())?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(add_one.cache_len(), 1);

    let y = single(add_one.call(&tensors(&[&b]), &no_kwargs())?)?;
    assert_close(&y.to_vec_f32()?, &[8.0, 9.0, 10.0]);
    assert_eq!(add_one.cache_len(), 1);

    let c = tensor(&backend, &[2], &[0.0, 0.5])?;
    let third = add_one.get_or_trace(&tensors(&[&c]), &no_kwargs())?;
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(add_one.cache_len(), 2);
    Ok(())
}

#[test]
fn literal_arguments_select_distinct_traces() -> Result<()> {
    let backend = CountingBackend::new();
    let scale = named_defun(backend.clone(), "scale", |g, args, _| {
        let x = args.traced_arg(0)?;
        let factor = args
            .literal_arg(1)?
            .as_f64()
            .ok_or_else(|| anyhow!("scale factor must be numeric"))?;
        let factor = g.full_like(&x, factor)?;
        Ok(Nest::leaf(Some(g.mul(&x, &factor)?)))
    });

    let x = tensor(&backend, &[3], &[1.0, 2.0, 3.0])?;
    let call = |factor: i64| -> Result<Vec<f32>> {
        let args = Nest::flat([Value::from(&x), Value::from(Literal::Int(factor))]);
        single(scale.call(&args, &no_kwargs())?)?.to_vec_f32()
    };

    assert_close(&call(2)?, &[2.0, 4.0, 6.0]);
    assert_close(&call(3)?, &[3.0, 6.0, 9.0]);
    assert_close(&call(2)?, &[2.0, 4.0, 6.0]);
    assert_eq!(scale.cache_len(), 2);
    Ok(())
}

#[test]
fn host_array_contents_are_baked_into_the_trace() -> Result<()> {
    let backend = CountingBackend::new();
    let offset = named_defun(backend.clone(), "offset", |g, args, _| {
        let x = args.traced_arg(0)?;
        let array = args.array_arg(1)?;
        let bias = g.constant_f32(array.dims(), array.data())?;
        Ok(Nest::leaf(Some(g.add(&x, &bias)?)))
    });

    let x = tensor(&backend, &[2], &[1.0, 1.0])?;
    let run = |data: Vec<f32>| -> Result<Vec<f32>> {
        let args = Nest::flat([
            Value::from(&x),
            Value::from(HostArray::new(vec![2], data)?),
        ]);
        single(offset.call(&args, &no_kwargs())?)?.to_vec_f32()
    };
    assert_close(&run(vec![1.0, 2.0])?, &[2.0, 3.0]);
    assert_close(&run(vec![5.0, 6.0])?, &[6.0, 7.0]);
    assert_eq!(offset.cache_len(), 2);
    Ok(())
}

#[test]
fn keyword_arguments_join_the_key_but_may_not_be_tensors() -> Result<()> {
    let backend = CountingBackend::new();
    let shift = named_defun(backend.clone(), "shift", |g, args, kwargs| {
        let x = args.traced_arg(0)?;
        let by = kwargs
            .get("by")
            .and_then(Nest::as_leaf)
            .and_then(|value| match value {
                Value::Literal(literal) => literal.as_f64(),
                _ => None,
            })
            .unwrap_or(0.0);
        let by = g.full_like(&x, by)?;
        Ok(Nest::leaf(Some(g.add(&x, &by)?)))
    });

    let x = tensor(&backend, &[1], &[1.0])?;
    let mut kwargs = no_kwargs();
    kwargs.insert("by".to_string(), Nest::leaf(Value::from(Literal::Float(0.5))));
    let y = single(shift.call(&tensors(&[&x]), &kwargs)?)?;
    assert_close(&y.to_vec_f32()?, &[1.5]);

    let y = single(shift.call(&tensors(&[&x]), &no_kwargs())?)?;
    assert_close(&y.to_vec_f32()?, &[1.0]);
    assert_eq!(shift.cache_len(), 2);

    let mut bad = no_kwargs();
    bad.insert("by".to_string(), Nest::leaf(Value::from(&x)));
    let err = shift.call(&tensors(&[&x]), &bad).unwrap_err();
    match err.downcast_ref::<TraceError>() {
        Some(TraceError::TensorKeywordArgument { name }) => assert_eq!(name, "by"),
        other => panic!("unexpected error {other:?}: {err}"),
    }
    assert_eq!(shift.cache_len(), 2);
    Ok(())
}

#[test]
fn cache_hits_skip_tracing_but_still_execute() -> Result<()> {
    let backend = CountingBackend::new();
    let double = named_defun(backend.clone(), "double", |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.add(&x, &x)?)))
    });
    let x = tensor(&backend, &[2], &[1.0, -1.0])?;
    for _ in 0..3 {
        double.call(&tensors(&[&x]), &no_kwargs())?;
    }
    assert_eq!(double.cache_len(), 1);
    assert_eq!(backend.programs_run(), 3);
    let entries = backend.entries();
    assert!(entries.iter().all(|name| name.starts_with("__inference_double_")));
    assert!(entries.windows(2).all(|pair| pair[0] == pair[1]));
    Ok(())
}

#[test]
fn concurrent_misses_converge_on_one_instance() -> Result<()> {
    let backend = CountingBackend::new();
    let square = Arc::new(named_defun(backend.clone(), "racy_square", |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.mul(&x, &x)?)))
    }));
    let x = tensor(&backend, &[4], &[1.0, 2.0, 3.0, 4.0])?;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let square = Arc::clone(&square);
            let x = x.clone();
            std::thread::spawn(move || square.get_or_trace(&tensors(&[&x]), &no_kwargs()))
        })
        .collect();
    let compiled = handles
        .into_iter()
        .map(|handle| handle.join().expect("tracing thread panicked"))
        .collect::<Result<Vec<_>>>()?;
    assert!(compiled.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(square.cache_len(), 1);
    Ok(())
}
