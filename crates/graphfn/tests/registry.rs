mod common;

use anyhow::Result;
use graphfn::backend::spec::{Function, Program};
use graphfn::function::library::{self, FunctionRole, RegistrationName};
use graphfn::profiling;
use graphfn::{named_defun, with_options, Nest, TraceError, TraceOptions};

use common::{assert_close, cpu, no_kwargs, single, tensor, tensors};

fn forced(name: &str) -> TraceOptions {
    TraceOptions {
        name: Some("forced".to_string()),
        forced_name: Some(name.to_string()),
    }
}

#[test]
fn generated_names_carry_role_prefix_and_base() -> Result<()> {
    let backend = cpu();
    let f = named_defun(backend.clone(), "my::layer norm", |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.tanh(&x)?)))
    });
    assert_eq!(f.name(), "my_layer_norm");
    let x = tensor(&backend, &[2], &[0.0, 1.0])?;
    let compiled = f.get_or_trace(&tensors(&[&x]), &no_kwargs())?;
    let name = compiled.inference_name();
    let uid = name
        .strip_prefix("__inference_my_layer_norm_")
        .expect("generated inference name");
    assert!(uid.parse::<u64>().is_ok(), "{name}");

    let backward = compiled.backward()?;
    assert!(backward.forward_name().starts_with("__forward_my_layer_norm_"));
    assert!(backward.backward_name().starts_with("__backward_my_layer_norm_"));
    assert_ne!(backward.forward_name(), name);
    Ok(())
}

#[test]
fn a_fragment_registers_at_most_once() -> Result<()> {
    let backend = cpu();
    let f = named_defun(backend.clone(), "register_once", |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.exp(&x)?)))
    });
    let x = tensor(&backend, &[1], &[0.0])?;
    let compiled = f.get_or_trace(&tensors(&[&x]), &no_kwargs())?;

    let err = library::register(
        RegistrationName::generated(FunctionRole::Inference, "again"),
        compiled.fragment(),
    )
    .unwrap_err();
    match err.downcast_ref::<TraceError>() {
        Some(TraceError::FragmentAlreadyRegistered { fragment, name }) => {
            assert_eq!(*fragment, compiled.fragment().id());
            assert_eq!(name, compiled.inference_name());
        }
        other => panic!("unexpected error {other:?}: {err}"),
    }
    Ok(())
}

#[test]
fn forced_names_are_used_verbatim() -> Result<()> {
    let backend = cpu();
    let f = with_options(backend.clone(), forced("registry_forced_exact"), |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.add(&x, &x)?)))
    });
    let x = tensor(&backend, &[2], &[1.0, 2.0])?;
    let compiled = f.get_or_trace(&tensors(&[&x]), &no_kwargs())?;
    assert_eq!(compiled.inference_name(), "registry_forced_exact");
    assert!(library::is_registered("registry_forced_exact"));
    let y = single(f.call(&tensors(&[&x]), &no_kwargs())?)?;
    assert_close(&y.to_vec_f32()?, &[2.0, 4.0]);
    Ok(())
}

#[test]
fn identical_redefinition_under_a_forced_name_is_accepted() -> Result<()> {
    let backend = cpu();
    let make = || {
        with_options(backend.clone(), forced("registry_forced_same"), |g, args, _| {
            let x = args.traced_arg(0)?;
            Ok(Nest::leaf(Some(g.mul(&x, &x)?)))
        })
    };
    let x = tensor(&backend, &[3], &[1.0, 2.0, 3.0])?;
    let first = make().get_or_trace(&tensors(&[&x]), &no_kwargs())?;
    let before = profiling::event_count("function_reregistered");
    let second = make().get_or_trace(&tensors(&[&x]), &no_kwargs())?;
    assert_eq!(first.inference_name(), second.inference_name());
    assert_eq!(first.inference().fingerprint(), second.inference().fingerprint());
    assert!(profiling::event_count("function_reregistered") > before);
    Ok(())
}

#[test]
fn conflicting_forced_definitions_are_rejected() -> Result<()> {
    let backend = cpu();
    let add = with_options(backend.clone(), forced("registry_forced_conflict"), |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.add(&x, &x)?)))
    });
    let sub = with_options(backend.clone(), forced("registry_forced_conflict"), |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.sub(&x, &x)?)))
    });
    let x = tensor(&backend, &[1], &[1.0])?;
    add.get_or_trace(&tensors(&[&x]), &no_kwargs())?;
    let err = sub.get_or_trace(&tensors(&[&x]), &no_kwargs()).unwrap_err();
    match err.downcast_ref::<TraceError>() {
        Some(TraceError::RegistrationConflict { name }) => {
            assert_eq!(name, "registry_forced_conflict")
        }
        other => panic!("unexpected error {other:?}: {err}"),
    }
    assert_eq!(sub.cache_len(), 0);
    Ok(())
}

#[test]
fn registered_payload_decodes_to_the_definition() -> Result<()> {
    let backend = cpu();
    let f = named_defun(backend.clone(), "registry_payload", |g, args, _| {
        let x = args.traced_arg(0)?;
        let y = g.exp(&x)?;
        Ok(Nest::leaf(Some(g.mul(&x, &y)?)))
    });
    let x = tensor(&backend, &[2], &[0.0, 1.0])?;
    let compiled = f.get_or_trace(&tensors(&[&x]), &no_kwargs())?;
    let entry = library::lookup(compiled.inference_name()).expect("registered");
    let decoded: Function = bincode::deserialize(entry.payload())?;
    assert_eq!(&decoded, entry.function());
    assert_eq!(decoded.name, compiled.inference_name());
    assert_eq!(decoded.parameters.len(), 1);
    Ok(())
}

#[test]
fn programs_survive_a_json_round_trip() -> Result<()> {
    let backend = cpu();
    let f = named_defun(backend.clone(), "registry_json", |g, args, _| {
        let x = args.traced_arg(0)?;
        let total = g.reduce_sum(&x, &[0], true)?;
        Ok(Nest::seq([Nest::leaf(Some(x)), Nest::leaf(Some(total))]))
    });
    let x = tensor(&backend, &[3], &[1.0, 2.0, 3.0])?;
    let compiled = f.get_or_trace(&tensors(&[&x]), &no_kwargs())?;
    let program = library::program_for(compiled.inference())?;
    let json = program.to_json_string()?;
    let restored = Program::from_json_str(&json)?;
    assert_eq!(*program, restored);
    assert_eq!(restored.entry, compiled.inference_name());
    assert!(restored.entry_function().is_some());
    Ok(())
}

#[test]
fn unknown_names_are_absent() {
    assert!(library::lookup("__inference_never_registered_0").is_none());
    assert!(!library::is_registered("__inference_never_registered_0"));
    assert!(library::gradient_link("__inference_never_registered_0").is_none());
}

#[test]
fn forced_names_accept_a_single_signature() -> Result<()> {
    let backend = cpu();
    let f = with_options(backend.clone(), forced("registry_forced_single"), |g, args, _| {
        let x = args.traced_arg(0)?;
        Ok(Nest::leaf(Some(g.neg(&x)?)))
    });
    let pair = tensor(&backend, &[2], &[1.0, 2.0])?;
    let triple = tensor(&backend, &[3], &[1.0, 2.0, 3.0])?;
    let y = single(f.call(&tensors(&[&pair]), &no_kwargs())?)?;
    assert_close(&y.to_vec_f32()?, &[-1.0, -2.0]);

    let err = f.call(&tensors(&[&triple]), &no_kwargs()).unwrap_err();
    match err.downcast_ref::<TraceError>() {
        Some(TraceError::ForcedNameSignature { name }) => assert_eq!(name, "registry_forced_single"),
        other => panic!("unexpected error {other:?}: {err}"),
    }
    assert_eq!(f.cache_len(), 1);

    let y = single(f.call(&tensors(&[&pair]), &no_kwargs())?)?;
    assert_close(&y.to_vec_f32()?, &[-1.0, -2.0]);
    Ok(())
}
