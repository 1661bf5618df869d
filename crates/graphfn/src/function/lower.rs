//! Lowering of graph regions into function definitions.

use std::collections::{BTreeSet, HashMap};

use anyhow::{anyhow, Result};

use crate::backend::spec::{Function, Operand, PortableBackend, ProgramBuilder, ValueId};
use crate::error::TraceError;
use crate::graph::{GraphInner, NodeKind};

/// Emits every node needed to compute `outputs` from `inputs`, renumbered so the
/// parameters come first. Reaching a placeholder that is not a declared input is
/// a usage error.
pub(crate) fn lower_function<B: PortableBackend + 'static>(
    graph: &GraphInner<B>,
    name: &str,
    inputs: &[ValueId],
    outputs: &[ValueId],
) -> Result<Function> {
    let mut program = ProgramBuilder::new();
    let mut mapping: HashMap<ValueId, Operand> = HashMap::new();

    for input in inputs {
        let record = graph
            .nodes
            .get(input)
            .ok_or_else(|| anyhow!("input %{} of `{name}` is not defined", input.0))?;
        let parameter = program.add_parameter(record.ty.clone());
        mapping.insert(*input, Operand::Value(parameter));
    }

    let mut needed = BTreeSet::new();
    let mut stack = outputs.to_vec();
    while let Some(id) = stack.pop() {
        if mapping.contains_key(&id) || !needed.insert(id) {
            continue;
        }
        let record = graph.nodes.get(&id).ok_or_else(|| untraceable(name, id))?;
        if matches!(record.kind, NodeKind::Placeholder) {
            return Err(untraceable(name, id));
        }
        stack.extend(record.dependencies());
    }

    for id in needed {
        let record = &graph.nodes[&id];
        match &record.kind {
            NodeKind::Op { op, operands } => {
                let operands = operands
                    .iter()
                    .map(|operand| remap(&mapping, operand, name))
                    .collect::<Result<Vec<_>>>()?;
                let value = program.emit(op.clone(), operands, record.ty.clone());
                mapping.insert(id, Operand::Value(value));
            }
            NodeKind::Projection { tuple, index } => match mapping.get(tuple) {
                Some(Operand::Value(lowered)) => {
                    mapping.insert(
                        id,
                        Operand::TupleElement {
                            tuple: *lowered,
                            index: *index,
                        },
                    );
                }
                _ => return Err(untraceable(name, *tuple)),
            },
            NodeKind::Placeholder => return Err(untraceable(name, id)),
        }
    }

    let outputs = outputs
        .iter()
        .map(|output| {
            mapping
                .get(output)
                .cloned()
                .ok_or_else(|| untraceable(name, *output))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(program.finish(name, outputs)?)
}

fn remap(mapping: &HashMap<ValueId, Operand>, operand: &Operand, name: &str) -> Result<Operand> {
    match operand {
        Operand::Value(id) => mapping.get(id).cloned().ok_or_else(|| untraceable(name, *id)),
        Operand::TupleElement { tuple, index } => match mapping.get(tuple) {
            Some(Operand::Value(lowered)) => Ok(Operand::TupleElement {
                tuple: *lowered,
                index: *index,
            }),
            _ => Err(untraceable(name, *tuple)),
        },
        Operand::Literal(literal) => Ok(Operand::Literal(literal.clone())),
    }
}

fn untraceable(function: &str, value: ValueId) -> anyhow::Error {
    TraceError::UntraceableValue {
        function: function.to_string(),
        value: value.0,
    }
    .into()
}
