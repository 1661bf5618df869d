//! Symbolic reverse-mode differentiation over a graph arena.
//!
//! [`gradients`] appends the gradient computation to the same graph the outputs
//! live in. Nodes are visited in descending value-id order, which is a reverse
//! topological order because ids are allocated monotonically. Only float values
//! carry gradients; anything without a differentiable path to an input yields
//! `None` instead of an error.

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::{anyhow, Result};
use tracing::{trace, warn};

use crate::backend::spec::{
    ComparisonOp, ElementwiseBinaryOp, ElementwiseUnaryOp, Operand, Operation, PortableBackend,
    ReduceKind, ValueId, ValueType,
};
use crate::function::library;
use crate::graph::{GraphBuilder, NodeKind, TracedTensor};
use crate::ops::reduced_shape;

/// Gradients of `outputs` (seeded with `grad_ys`) with respect to each of `inputs`.
pub(crate) fn gradients<B: PortableBackend + 'static>(
    builder: &mut GraphBuilder<'_, B>,
    outputs: &[ValueId],
    inputs: &[ValueId],
    grad_ys: &[ValueId],
) -> Result<Vec<Option<ValueId>>> {
    if outputs.len() != grad_ys.len() {
        return Err(anyhow!(
            "{} outputs but {} gradient seeds",
            outputs.len(),
            grad_ys.len()
        ));
    }

    let mut reachable = BTreeSet::new();
    let mut stack = outputs.to_vec();
    while let Some(id) = stack.pop() {
        if !reachable.insert(id) {
            continue;
        }
        let record = builder
            .node(id)
            .ok_or_else(|| anyhow!("value %{} is not defined", id.0))?;
        stack.extend(record.dependencies());
    }

    let input_set: HashSet<ValueId> = inputs.iter().copied().collect();
    let mut from_input = HashSet::new();
    for id in &reachable {
        let depends = input_set.contains(id)
            || builder
                .node(*id)
                .map(|record| record.dependencies().iter().any(|dep| from_input.contains(dep)))
                .unwrap_or(false);
        if depends {
            from_input.insert(*id);
        }
    }

    let mut grads: HashMap<ValueId, ValueId> = HashMap::new();
    let mut tuple_grads: HashMap<ValueId, Vec<Option<ValueId>>> = HashMap::new();

    for (output, seed) in outputs.iter().zip(grad_ys) {
        if from_input.contains(output) && differentiable(builder, *output) {
            accumulate(builder, &mut grads, *output, *seed)?;
        }
    }

    for id in reachable.iter().rev() {
        if !from_input.contains(id) || input_set.contains(id) {
            continue;
        }
        let record = builder
            .node(*id)
            .cloned()
            .ok_or_else(|| anyhow!("value %{} is not defined", id.0))?;
        let (operands, operand_grads) = match record.kind {
            NodeKind::Placeholder => continue,
            NodeKind::Projection { tuple, index } => {
                let Some(grad) = grads.get(id).copied() else {
                    continue;
                };
                let arity = match &builder.node(tuple).map(|node| &node.ty) {
                    Some(ValueType::Tuple(elements)) => elements.len(),
                    _ => return Err(anyhow!("%{} is not a tuple", tuple.0)),
                };
                let slots = tuple_grads
                    .entry(tuple)
                    .or_insert_with(|| vec![None; arity]);
                let slot = slots
                    .get_mut(index)
                    .ok_or_else(|| anyhow!("%{}[{}] out of range", tuple.0, index))?;
                *slot = Some(match *slot {
                    Some(existing) => sum(builder, existing, grad)?,
                    None => grad,
                });
                continue;
            }
            NodeKind::Op {
                op: Operation::Call(spec),
                operands,
            } => {
                let Some(upstream) = tuple_grads.remove(id) else {
                    continue;
                };
                let operand_ids = operand_values(&operands);
                let contributions =
                    call_rule(builder, *id, &spec.target, &operand_ids, upstream)?;
                (operand_ids, contributions)
            }
            NodeKind::Op { op, operands } => {
                let Some(grad) = grads.get(id).copied() else {
                    continue;
                };
                let operand_ids = operand_values(&operands);
                let traced = operand_ids
                    .iter()
                    .map(|operand| operand.map(|value| builder.traced(value)).transpose())
                    .collect::<Result<Vec<_>>>()?;
                let output = builder.traced(*id)?;
                let grad = builder.traced(grad)?;
                let contributions = op_rule(builder, &op, &traced, &output, &grad)?;
                (operand_ids, contributions)
            }
        };

        for (operand, grad) in operands.into_iter().zip(operand_grads) {
            let (Some(operand), Some(grad)) = (operand, grad) else {
                continue;
            };
            if from_input.contains(&operand) && differentiable(builder, operand) {
                accumulate(builder, &mut grads, operand, grad.value())?;
            }
        }
    }

    trace!(
        outputs = outputs.len(),
        inputs = inputs.len(),
        reachable = reachable.len(),
        "symbolic gradients emitted"
    );
    Ok(inputs.iter().map(|input| grads.get(input).copied()).collect())
}

fn differentiable<B: PortableBackend + 'static>(builder: &GraphBuilder<'_, B>, value: ValueId) -> bool {
    builder
        .node(value)
        .and_then(|record| record.ty.as_tensor())
        .map(|spec| spec.dtype.is_differentiable())
        .unwrap_or(false)
}

fn operand_values(operands: &[Operand]) -> Vec<Option<ValueId>> {
    operands
        .iter()
        .map(|operand| match operand {
            Operand::Value(id) => Some(*id),
            _ => None,
        })
        .collect()
}

fn sum<B: PortableBackend + 'static>(
    builder: &mut GraphBuilder<'_, B>,
    lhs: ValueId,
    rhs: ValueId,
) -> Result<ValueId> {
    let lhs = builder.traced(lhs)?;
    let rhs = builder.traced(rhs)?;
    Ok(builder.add(&lhs, &rhs)?.value())
}

fn accumulate<B: PortableBackend + 'static>(
    builder: &mut GraphBuilder<'_, B>,
    grads: &mut HashMap<ValueId, ValueId>,
    value: ValueId,
    grad: ValueId,
) -> Result<()> {
    let total = match grads.get(&value).copied() {
        Some(existing) => sum(builder, existing, grad)?,
        None => grad,
    };
    grads.insert(value, total);
    Ok(())
}

fn operand<'t>(operands: &'t [Option<TracedTensor>], index: usize, op: &Operation) -> Result<&'t TracedTensor> {
    operands
        .get(index)
        .and_then(Option::as_ref)
        .ok_or_else(|| anyhow!("{} is missing operand {}", op.label(), index))
}

/// Gradient contribution of one node to each of its operands.
fn op_rule<B: PortableBackend + 'static>(
    builder: &mut GraphBuilder<'_, B>,
    op: &Operation,
    operands: &[Option<TracedTensor>],
    y: &TracedTensor,
    g: &TracedTensor,
) -> Result<Vec<Option<TracedTensor>>> {
    let grads = match op {
        Operation::ElementwiseBinary(kind) => {
            let a = operand(operands, 0, op)?;
            let b = operand(operands, 1, op)?;
            let (ga, gb) = match kind {
                ElementwiseBinaryOp::Add => (g.clone(), g.clone()),
                ElementwiseBinaryOp::Sub => (g.clone(), builder.neg(g)?),
                ElementwiseBinaryOp::Mul => (builder.mul(g, b)?, builder.mul(g, a)?),
                ElementwiseBinaryOp::Div => {
                    let ga = builder.div(g, b)?;
                    let gy = builder.mul(g, y)?;
                    let gy_over_b = builder.div(&gy, b)?;
                    (ga, builder.neg(&gy_over_b)?)
                }
                ElementwiseBinaryOp::Maximum | ElementwiseBinaryOp::Minimum => {
                    let cmp = if *kind == ElementwiseBinaryOp::Maximum {
                        ComparisonOp::GreaterEqual
                    } else {
                        ComparisonOp::LessEqual
                    };
                    let mask = builder.compare(cmp, a, b)?;
                    let zeros = builder.full_like(g, 0.0)?;
                    (
                        builder.select(&mask, g, &zeros)?,
                        builder.select(&mask, &zeros, g)?,
                    )
                }
            };
            vec![Some(ga), Some(gb)]
        }
        Operation::ElementwiseUnary(kind) => {
            let a = operand(operands, 0, op)?;
            let ga = match kind {
                ElementwiseUnaryOp::Neg => builder.neg(g)?,
                ElementwiseUnaryOp::Exp => builder.mul(g, y)?,
                ElementwiseUnaryOp::Log => builder.div(g, a)?,
                ElementwiseUnaryOp::Tanh => {
                    let ones = builder.full_like(y, 1.0)?;
                    let y2 = builder.mul(y, y)?;
                    let slope = builder.sub(&ones, &y2)?;
                    builder.mul(g, &slope)?
                }
            };
            vec![Some(ga)]
        }
        Operation::Reduce(spec) => {
            let a = operand(operands, 0, op)?;
            let keep_shape = reduced_shape(a.shape(), &spec.axes, true);
            let g_keep = if spec.keepdims {
                g.clone()
            } else {
                builder.reshape(g, keep_shape.clone())?
            };
            let g_full = builder.broadcast_to(&g_keep, a.shape().clone())?;
            let ga = match spec.kind {
                ReduceKind::Sum => g_full,
                ReduceKind::Max | ReduceKind::Min => {
                    let y_keep = if spec.keepdims {
                        y.clone()
                    } else {
                        builder.reshape(y, keep_shape)?
                    };
                    let y_full = builder.broadcast_to(&y_keep, a.shape().clone())?;
                    let mask = builder.compare(ComparisonOp::Equal, a, &y_full)?;
                    let zeros = builder.full_like(&g_full, 0.0)?;
                    builder.select(&mask, &g_full, &zeros)?
                }
            };
            vec![Some(ga)]
        }
        Operation::Select => {
            let predicate = operand(operands, 0, op)?;
            let zeros = builder.full_like(g, 0.0)?;
            vec![
                None,
                Some(builder.select(predicate, g, &zeros)?),
                Some(builder.select(predicate, &zeros, g)?),
            ]
        }
        Operation::Cast(_) => {
            let a = operand(operands, 0, op)?;
            if a.dtype().is_float() {
                vec![Some(builder.cast(g, a.dtype())?)]
            } else {
                vec![None]
            }
        }
        Operation::Reshape(_) => {
            let a = operand(operands, 0, op)?;
            vec![Some(builder.reshape(g, a.shape().clone())?)]
        }
        Operation::BroadcastTo(_) => {
            let a = operand(operands, 0, op)?;
            let from = a.shape().dims();
            let to = y.shape().dims();
            let offset = to.len() - from.len();
            let axes: Vec<usize> = (0..to.len())
                .filter(|axis| *axis < offset || from[*axis - offset] != to[*axis])
                .collect();
            if axes.is_empty() {
                vec![Some(g.clone())]
            } else {
                let summed = builder.reduce_sum(g, &axes, false)?;
                vec![Some(builder.reshape(&summed, a.shape().clone())?)]
            }
        }
        Operation::StopGradient | Operation::Compare(_) | Operation::Constant(_) => {
            vec![None; operands.len()]
        }
        Operation::Call(_) => return Err(anyhow!("call nodes are differentiated through their backward function")),
    };
    Ok(grads)
}

/// Differentiates a call node through the callee's registered backward function.
fn call_rule<B: PortableBackend + 'static>(
    builder: &mut GraphBuilder<'_, B>,
    call: ValueId,
    target: &str,
    operands: &[Option<ValueId>],
    upstream: Vec<Option<ValueId>>,
) -> Result<Vec<Option<TracedTensor>>> {
    let Some(link) = library::gradient_link(target) else {
        warn!(function = target, "call has no registered gradient; treating it as constant");
        return Ok(vec![None; operands.len()]);
    };
    let backward = link.source.backward_function()?;

    let mut inputs = Vec::with_capacity(backward.seed_specs().len() + backward.side_outputs());
    for (index, spec) in backward.seed_specs().iter().enumerate() {
        let seed = match upstream.get(index).copied().flatten() {
            Some(grad) => builder.traced(grad)?,
            None => builder.zeros(spec)?,
        };
        inputs.push(seed);
    }

    let real = backward.real_outputs();
    if link.side_outputs_exported {
        for index in real..real + backward.side_outputs() {
            inputs.push(builder.project(call, index)?);
        }
    } else {
        // Recompute the forward pass to recover the values the backward function needs.
        let forward_inputs = operands
            .iter()
            .map(|operand| {
                operand
                    .ok_or_else(|| anyhow!("call to `{target}` has a non-value operand"))
                    .and_then(|value| builder.traced(value))
            })
            .collect::<Result<Vec<_>>>()?;
        let outputs = builder.call_function(backward.forward_name(), &forward_inputs)?;
        inputs.extend(outputs.into_iter().skip(real));
    }

    let grads = builder.call_function(backward.backward_name(), &inputs)?;
    Ok(backward
        .gradient_slots()
        .iter()
        .map(|slot| slot.and_then(|index| grads.get(index).cloned()))
        .collect())
}
