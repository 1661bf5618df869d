use std::collections::HashMap;
use std::sync::Arc;

use graphfn::backend::spec::{
    BackendError, BackendResult, BroadcastToSpec, CastSpec, CompareSpec, ComparisonOp, DType,
    Dimension, ElementwiseBinaryOp, ElementwiseUnaryOp, Function, Instruction, Operand, Operation,
    PortableBackend, Program, ReduceKind, ReduceSpec, ReshapeSpec, Shape, SpecErrorCode,
    TensorInit, TensorLiteral, TensorSpec, ValueId, ValueType,
};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub data: TensorData,
}

#[derive(Debug, Clone)]
pub enum TensorData {
    F32(Arc<[f32]>),
    Si32(Arc<[i32]>),
    Bool(Arc<[u8]>),
}

/// Host-memory interpreter for graphfn programs.
#[derive(Debug, Clone, Default)]
pub struct CpuPortableBackend;

impl CpuPortableBackend {
    pub fn new() -> Self {
        CpuPortableBackend
    }
}

/// A value produced while interpreting a function body.
#[derive(Clone)]
enum Slot {
    Tensor(CpuTensor),
    Tuple(Vec<CpuTensor>),
}

impl PortableBackend for CpuPortableBackend {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "cpu-portable"
    }

    fn materialize(&self, init: TensorInit) -> BackendResult<Self::TensorHandle> {
        match init {
            TensorInit::Literal(lit) => literal_to_tensor(&lit),
            TensorInit::Zeroed(spec) => zeroed_tensor(&spec),
        }
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        Ok(tensor_to_literal(tensor))
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        if let Operation::Call(spec) = &instruction.op {
            return Err(BackendError::unimplemented(
                "call",
                format!("`{}` needs a program; use run_program", spec.target),
            ));
        }
        Ok(vec![execute_operation(instruction, inputs)?])
    }

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        let function = program.entry_function().ok_or_else(|| {
            BackendError::spec(SpecErrorCode::UnknownFunction, program.entry.clone())
        })?;
        run_function(program, function, entry_inputs)
    }
}

fn run_function(
    program: &Program,
    function: &Function,
    inputs: &[CpuTensor],
) -> BackendResult<Vec<CpuTensor>> {
    if function.parameter_ids.len() != inputs.len() {
        return Err(BackendError::spec(
            SpecErrorCode::ArityMismatch,
            format!(
                "`{}` takes {} inputs, got {}",
                function.name,
                function.parameter_ids.len(),
                inputs.len()
            ),
        ));
    }
    trace!(function = %function.name, instructions = function.body.len(), "running function");

    let mut values: HashMap<ValueId, Slot> = HashMap::new();
    for (param_id, handle) in function.parameter_ids.iter().zip(inputs) {
        values.insert(*param_id, Slot::Tensor(handle.clone()));
    }

    for (instr_index, instruction) in function.body.iter().enumerate() {
        let operands = instruction
            .operands
            .iter()
            .map(|operand| resolve_operand(&values, operand))
            .collect::<BackendResult<Vec<_>>>()?;
        let slot = match &instruction.op {
            Operation::Call(spec) => {
                let callee = program.function(&spec.target).ok_or_else(|| {
                    BackendError::spec(SpecErrorCode::UnknownFunction, spec.target.clone())
                })?;
                Slot::Tuple(run_function(program, callee, &operands)?)
            }
            _ => Slot::Tensor(execute_operation(instruction, &operands).map_err(|err| {
                augment_backend_error(err, &function.name, instr_index, instruction, &operands)
            })?),
        };
        values.insert(instruction.id, slot);
    }

    function
        .outputs
        .iter()
        .map(|operand| resolve_operand(&values, operand))
        .collect()
}

fn resolve_operand(values: &HashMap<ValueId, Slot>, operand: &Operand) -> BackendResult<CpuTensor> {
    match operand {
        Operand::Value(id) => match values.get(id) {
            Some(Slot::Tensor(tensor)) => Ok(tensor.clone()),
            Some(Slot::Tuple(_)) => Err(BackendError::execution(format!(
                "%{} is a tuple and must be projected",
                id.0
            ))),
            None => Err(BackendError::spec(
                SpecErrorCode::UnknownValue,
                format!("%{}", id.0),
            )),
        },
        Operand::TupleElement { tuple, index } => match values.get(tuple) {
            Some(Slot::Tuple(elements)) => elements.get(*index).cloned().ok_or_else(|| {
                BackendError::spec(
                    SpecErrorCode::UnknownValue,
                    format!("%{}[{}]", tuple.0, index),
                )
            }),
            _ => Err(BackendError::spec(
                SpecErrorCode::UnknownValue,
                format!("%{} is not a tuple", tuple.0),
            )),
        },
        Operand::Literal(lit) => literal_to_tensor(lit),
    }
}

fn literal_to_tensor(literal: &TensorLiteral) -> BackendResult<CpuTensor> {
    let count = element_count(&literal.spec.shape)?;
    let data = match literal.spec.dtype {
        DType::F32 => TensorData::F32(Arc::from(bytes_to_f32(&literal.bytes)?)),
        DType::Si32 => TensorData::Si32(Arc::from(bytes_to_i32(&literal.bytes)?)),
        DType::I1 => TensorData::Bool(Arc::from(literal.bytes.as_ref())),
    };
    let tensor = CpuTensor {
        spec: literal.spec.clone(),
        data,
    };
    if tensor.len() != count {
        return Err(BackendError::execution(format!(
            "literal holds {} elements, spec expects {count}",
            tensor.len()
        )));
    }
    Ok(tensor)
}

fn zeroed_tensor(spec: &TensorSpec) -> BackendResult<CpuTensor> {
    let count = element_count(&spec.shape)?;
    let data = match spec.dtype {
        DType::F32 => TensorData::F32(Arc::from(vec![0.0; count])),
        DType::Si32 => TensorData::Si32(Arc::from(vec![0; count])),
        DType::I1 => TensorData::Bool(Arc::from(vec![0; count])),
    };
    Ok(CpuTensor {
        spec: spec.clone(),
        data,
    })
}

fn tensor_to_literal(tensor: &CpuTensor) -> TensorLiteral {
    match &tensor.data {
        TensorData::F32(values) => TensorLiteral::new(tensor.spec.clone(), f32_to_bytes(values)),
        TensorData::Si32(values) => TensorLiteral::new(tensor.spec.clone(), i32_to_bytes(values)),
        TensorData::Bool(values) => TensorLiteral::new(tensor.spec.clone(), Arc::clone(values)),
    }
}

impl CpuTensor {
    fn len(&self) -> usize {
        match &self.data {
            TensorData::F32(values) => values.len(),
            TensorData::Si32(values) => values.len(),
            TensorData::Bool(values) => values.len(),
        }
    }

    fn with_data(spec: &TensorSpec, data: TensorData) -> Self {
        CpuTensor {
            spec: spec.clone(),
            data,
        }
    }
}

fn execute_operation(instruction: &Instruction, inputs: &[CpuTensor]) -> BackendResult<CpuTensor> {
    let output = match &instruction.output {
        ValueType::Tensor(spec) => spec,
        ValueType::Tuple(_) => {
            return Err(BackendError::execution(format!(
                "{} cannot produce a tuple",
                instruction.op.label()
            )))
        }
    };
    match &instruction.op {
        Operation::Constant(literal) => literal_to_tensor(literal),
        Operation::ElementwiseUnary(op) => op_elementwise_unary(inputs, output, *op),
        Operation::ElementwiseBinary(op) => op_elementwise_binary(inputs, output, *op),
        Operation::Reduce(spec) => op_reduce(inputs, output, spec),
        Operation::Compare(spec) => op_compare(inputs, output, spec),
        Operation::Select => op_select(inputs, output),
        Operation::Cast(spec) => op_cast(inputs, output, spec),
        Operation::StopGradient => {
            let input = expect_single(inputs)?;
            Ok(CpuTensor::with_data(output, input.data.clone()))
        }
        Operation::Reshape(spec) => op_reshape(inputs, output, spec),
        Operation::BroadcastTo(spec) => op_broadcast_to(inputs, output, spec),
        Operation::Call(spec) => Err(BackendError::execution(format!(
            "call to `{}` outside a program",
            spec.target
        ))),
    }
}

fn augment_backend_error(
    error: BackendError,
    function_name: &str,
    instruction_index: usize,
    instruction: &Instruction,
    inputs: &[CpuTensor],
) -> BackendError {
    let location = format!(
        "function `{}` instruction #{}, {} id {:?} operands [{}]",
        function_name,
        instruction_index,
        instruction.op.label(),
        instruction.id,
        format_operands(&instruction.operands, inputs)
    );
    match error {
        BackendError::Execution { message } => BackendError::Execution {
            message: format!("{message} (at {location})"),
        },
        BackendError::Unimplemented { op, reason } => BackendError::Unimplemented {
            op,
            reason: format!("{reason} (while executing {location})"),
        },
        other => other,
    }
}

fn format_operands(operands: &[Operand], inputs: &[CpuTensor]) -> String {
    if operands.is_empty() {
        return String::from("<none>");
    }
    operands
        .iter()
        .zip(inputs)
        .map(|(operand, tensor)| {
            let shape = match static_dims(&tensor.spec.shape) {
                Ok(dims) => format!(
                    "[{}]",
                    dims.iter().map(usize::to_string).collect::<Vec<_>>().join("x")
                ),
                Err(_) => String::from("dynamic"),
            };
            let dtype = tensor.spec.dtype;
            match operand {
                Operand::Value(id) => format!("value %{} {shape} dtype={dtype:?}", id.0),
                Operand::Literal(_) => format!("literal {shape} dtype={dtype:?}"),
                Operand::TupleElement { tuple, index } => {
                    format!("tuple %{}[{index}] {shape} dtype={dtype:?}", tuple.0)
                }
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn op_elementwise_unary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: ElementwiseUnaryOp,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let data = match (&input.data, op) {
        (TensorData::F32(values), op) => TensorData::F32(
            values
                .iter()
                .map(|&x| match op {
                    ElementwiseUnaryOp::Neg => -x,
                    ElementwiseUnaryOp::Exp => x.exp(),
                    ElementwiseUnaryOp::Log => x.ln(),
                    ElementwiseUnaryOp::Tanh => x.tanh(),
                })
                .collect(),
        ),
        (TensorData::Si32(values), ElementwiseUnaryOp::Neg) => {
            TensorData::Si32(values.iter().map(|x| x.wrapping_neg()).collect())
        }
        _ => {
            return Err(BackendError::spec(
                SpecErrorCode::DTypeNotSupported,
                format!("{op:?} on {:?}", input.spec.dtype),
            ))
        }
    };
    Ok(CpuTensor::with_data(output, data))
}

fn op_elementwise_binary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: ElementwiseBinaryOp,
) -> BackendResult<CpuTensor> {
    let (lhs, rhs) = expect_pair(inputs)?;
    if lhs.len() != rhs.len() {
        return Err(BackendError::spec(
            SpecErrorCode::ShapeMismatch,
            format!("{} vs {} elements", lhs.len(), rhs.len()),
        ));
    }
    let data = match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => TensorData::F32(
            a.iter()
                .zip(b.iter())
                .map(|(&x, &y)| match op {
                    ElementwiseBinaryOp::Add => x + y,
                    ElementwiseBinaryOp::Sub => x - y,
                    ElementwiseBinaryOp::Mul => x * y,
                    ElementwiseBinaryOp::Div => x / y,
                    ElementwiseBinaryOp::Maximum => x.max(y),
                    ElementwiseBinaryOp::Minimum => x.min(y),
                })
                .collect(),
        ),
        (TensorData::Si32(a), TensorData::Si32(b)) => {
            let mut result = Vec::with_capacity(a.len());
            for (&x, &y) in a.iter().zip(b.iter()) {
                result.push(match op {
                    ElementwiseBinaryOp::Add => x.wrapping_add(y),
                    ElementwiseBinaryOp::Sub => x.wrapping_sub(y),
                    ElementwiseBinaryOp::Mul => x.wrapping_mul(y),
                    ElementwiseBinaryOp::Div => {
                        if y == 0 {
                            return Err(BackendError::spec(
                                SpecErrorCode::IntegerDivideByZero,
                                format!("{x} / 0"),
                            ));
                        }
                        x.wrapping_div(y)
                    }
                    ElementwiseBinaryOp::Maximum => x.max(y),
                    ElementwiseBinaryOp::Minimum => x.min(y),
                });
            }
            TensorData::Si32(Arc::from(result))
        }
        _ => {
            return Err(BackendError::spec(
                SpecErrorCode::DTypeNotSupported,
                format!(
                    "{op:?} on {:?} and {:?}",
                    lhs.spec.dtype, rhs.spec.dtype
                ),
            ))
        }
    };
    Ok(CpuTensor::with_data(output, data))
}

fn op_reduce(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &ReduceSpec,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let dims = static_dims(&input.spec.shape)?;
    if let Some(axis) = spec.axes.iter().find(|&&axis| axis >= dims.len()) {
        return Err(BackendError::spec(
            SpecErrorCode::InvalidAttributeValue,
            format!("reduce axis {axis} out of range for rank {}", dims.len()),
        ));
    }
    // Output coordinates keep only the unreduced axes; keepdims only changes the
    // declared shape, not the element order.
    let kept: Vec<usize> = (0..dims.len()).filter(|axis| !spec.axes.contains(axis)).collect();
    let kept_dims: Vec<usize> = kept.iter().map(|&axis| dims[axis]).collect();
    let kept_strides = compute_strides(&kept_dims);
    let out_len: usize = kept_dims.iter().product();
    let target = |index: usize| -> usize {
        let coords = unravel_index(index, &dims);
        kept.iter()
            .zip(&kept_strides)
            .map(|(&axis, &stride)| coords[axis] * stride)
            .sum()
    };

    let data = match &input.data {
        TensorData::F32(values) => {
            let init = match spec.kind {
                ReduceKind::Sum => 0.0f32,
                ReduceKind::Max => f32::NEG_INFINITY,
                ReduceKind::Min => f32::INFINITY,
            };
            let mut result = vec![init; out_len];
            for (index, &value) in values.iter().enumerate() {
                let slot = &mut result[target(index)];
                *slot = match spec.kind {
                    ReduceKind::Sum => *slot + value,
                    ReduceKind::Max => slot.max(value),
                    ReduceKind::Min => slot.min(value),
                };
            }
            TensorData::F32(Arc::from(result))
        }
        TensorData::Si32(values) => {
            let init = match spec.kind {
                ReduceKind::Sum => 0i32,
                ReduceKind::Max => i32::MIN,
                ReduceKind::Min => i32::MAX,
            };
            let mut result = vec![init; out_len];
            for (index, &value) in values.iter().enumerate() {
                let slot = &mut result[target(index)];
                *slot = match spec.kind {
                    ReduceKind::Sum => slot.wrapping_add(value),
                    ReduceKind::Max => (*slot).max(value),
                    ReduceKind::Min => (*slot).min(value),
                };
            }
            TensorData::Si32(Arc::from(result))
        }
        TensorData::Bool(_) => {
            return Err(BackendError::spec(
                SpecErrorCode::DTypeNotSupported,
                "reduce on i1".to_string(),
            ))
        }
    };
    Ok(CpuTensor::with_data(output, data))
}

fn op_compare(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &CompareSpec,
) -> BackendResult<CpuTensor> {
    fn flags<T: PartialOrd>(a: &[T], b: &[T], op: ComparisonOp) -> Vec<u8> {
        a.iter()
            .zip(b)
            .map(|(x, y)| {
                let flag = match op {
                    ComparisonOp::Less => x < y,
                    ComparisonOp::LessEqual => x <= y,
                    ComparisonOp::Equal => x == y,
                    ComparisonOp::GreaterEqual => x >= y,
                    ComparisonOp::Greater => x > y,
                    ComparisonOp::NotEqual => x != y,
                };
                u8::from(flag)
            })
            .collect()
    }

    let (lhs, rhs) = expect_pair(inputs)?;
    let result = match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => flags(&a[..], &b[..], spec.op),
        (TensorData::Si32(a), TensorData::Si32(b)) => flags(&a[..], &b[..], spec.op),
        (TensorData::Bool(a), TensorData::Bool(b)) => flags(&a[..], &b[..], spec.op),
        _ => {
            return Err(BackendError::spec(
                SpecErrorCode::DTypeNotSupported,
                format!("compare {:?} with {:?}", lhs.spec.dtype, rhs.spec.dtype),
            ))
        }
    };
    Ok(CpuTensor::with_data(output, TensorData::Bool(Arc::from(result))))
}

fn op_select(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    fn pick<T: Copy>(pred: &[u8], on_true: &[T], on_false: &[T]) -> Arc<[T]> {
        pred.iter()
            .zip(on_true.iter().zip(on_false))
            .map(|(&flag, (&t, &f))| if flag != 0 { t } else { f })
            .collect()
    }

    if inputs.len() != 3 {
        return Err(BackendError::spec(
            SpecErrorCode::ArityMismatch,
            format!("select expects 3 operands, got {}", inputs.len()),
        ));
    }
    let pred = match &inputs[0].data {
        TensorData::Bool(pred) => &pred[..],
        _ => {
            return Err(BackendError::spec(
                SpecErrorCode::DTypeNotSupported,
                format!("select predicate is {:?}", inputs[0].spec.dtype),
            ))
        }
    };
    let data = match (&inputs[1].data, &inputs[2].data) {
        (TensorData::F32(a), TensorData::F32(b)) => TensorData::F32(pick(pred, &a[..], &b[..])),
        (TensorData::Si32(a), TensorData::Si32(b)) => TensorData::Si32(pick(pred, &a[..], &b[..])),
        (TensorData::Bool(a), TensorData::Bool(b)) => TensorData::Bool(pick(pred, &a[..], &b[..])),
        _ => {
            return Err(BackendError::spec(
                SpecErrorCode::DTypeNotSupported,
                "select branches differ in dtype".to_string(),
            ))
        }
    };
    Ok(CpuTensor::with_data(output, data))
}

fn f32_to_i32_trunc_saturating(value: f32) -> i32 {
    if value.is_nan() {
        return 0;
    }
    let truncated = value.trunc();
    if truncated >= i32::MAX as f32 {
        i32::MAX
    } else if truncated <= i32::MIN as f32 {
        i32::MIN
    } else {
        truncated as i32
    }
}

fn op_cast(inputs: &[CpuTensor], output: &TensorSpec, spec: &CastSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    if output.dtype != spec.dtype {
        return Err(BackendError::execution("cast output dtype mismatch"));
    }
    let data = match (&input.data, spec.dtype) {
        (TensorData::F32(values), DType::F32) => TensorData::F32(Arc::clone(values)),
        (TensorData::Si32(values), DType::Si32) => TensorData::Si32(Arc::clone(values)),
        (TensorData::Bool(values), DType::I1) => TensorData::Bool(Arc::clone(values)),
        (TensorData::Si32(values), DType::F32) => {
            TensorData::F32(values.iter().map(|&x| x as f32).collect())
        }
        (TensorData::Bool(values), DType::F32) => {
            TensorData::F32(values.iter().map(|&x| if x == 0 { 0.0 } else { 1.0 }).collect())
        }
        (TensorData::F32(values), DType::Si32) => TensorData::Si32(
            values
                .iter()
                .map(|&x| f32_to_i32_trunc_saturating(x))
                .collect(),
        ),
        (TensorData::Bool(values), DType::Si32) => {
            TensorData::Si32(values.iter().map(|&x| i32::from(x != 0)).collect())
        }
        (TensorData::F32(values), DType::I1) => {
            TensorData::Bool(values.iter().map(|&x| u8::from(x != 0.0)).collect())
        }
        (TensorData::Si32(values), DType::I1) => {
            TensorData::Bool(values.iter().map(|&x| u8::from(x != 0)).collect())
        }
    };
    Ok(CpuTensor::with_data(output, data))
}

fn op_reshape(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &ReshapeSpec,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let expected = element_count(&spec.new_shape)?;
    if expected != input.len() {
        return Err(BackendError::spec(
            SpecErrorCode::ShapeMismatch,
            format!("reshape of {} elements to {expected}", input.len()),
        ));
    }
    Ok(CpuTensor::with_data(output, input.data.clone()))
}

fn op_broadcast_to(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &BroadcastToSpec,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let input_dims = static_dims(&input.spec.shape)?;
    let out_dims = static_dims(&spec.result_shape)?;
    if out_dims.len() < input_dims.len() {
        return Err(BackendError::spec(
            SpecErrorCode::BroadcastRankMismatch,
            format!("rank {} to rank {}", input_dims.len(), out_dims.len()),
        ));
    }
    let rank_diff = out_dims.len() - input_dims.len();
    for (axis, &dim) in input_dims.iter().enumerate() {
        let out_dim = out_dims[rank_diff + axis];
        if dim != 1 && dim != out_dim {
            return Err(BackendError::spec(
                SpecErrorCode::ShapeMismatch,
                format!("cannot broadcast dim {dim} to {out_dim} on axis {axis}"),
            ));
        }
    }
    let data = match &input.data {
        TensorData::F32(values) => TensorData::F32(broadcast(&values[..], &input_dims, &out_dims)),
        TensorData::Si32(values) => TensorData::Si32(broadcast(&values[..], &input_dims, &out_dims)),
        TensorData::Bool(values) => TensorData::Bool(broadcast(&values[..], &input_dims, &out_dims)),
    };
    Ok(CpuTensor::with_data(output, data))
}

fn broadcast<T: Copy>(input: &[T], input_dims: &[usize], out_dims: &[usize]) -> Arc<[T]> {
    if input_dims == out_dims {
        return Arc::from(input);
    }
    let rank_diff = out_dims.len() - input_dims.len();
    let in_strides = compute_strides(input_dims);
    let out_len: usize = out_dims.iter().product();
    (0..out_len)
        .map(|index| {
            let coords = unravel_index(index, out_dims);
            let source: usize = input_dims
                .iter()
                .zip(&in_strides)
                .enumerate()
                .map(|(axis, (&dim, &stride))| {
                    if dim == 1 {
                        0
                    } else {
                        coords[rank_diff + axis] * stride
                    }
                })
                .sum();
            input[source]
        })
        .collect()
}

fn expect_single(inputs: &[CpuTensor]) -> BackendResult<&CpuTensor> {
    match inputs {
        [input] => Ok(input),
        _ => Err(BackendError::spec(
            SpecErrorCode::ArityMismatch,
            format!("expected 1 operand, got {}", inputs.len()),
        )),
    }
}

fn expect_pair(inputs: &[CpuTensor]) -> BackendResult<(&CpuTensor, &CpuTensor)> {
    match inputs {
        [lhs, rhs] => Ok((lhs, rhs)),
        _ => Err(BackendError::spec(
            SpecErrorCode::ArityMismatch,
            format!("expected 2 operands, got {}", inputs.len()),
        )),
    }
}

fn static_dims(shape: &Shape) -> BackendResult<Vec<usize>> {
    shape
        .dims()
        .iter()
        .map(|dim| match dim {
            Dimension::Static(v) => Ok(*v),
            Dimension::Dynamic(sym) => Err(BackendError::execution(format!(
                "dynamic dimension {} not supported at runtime",
                sym.as_str()
            ))),
        })
        .collect()
}

fn element_count(shape: &Shape) -> BackendResult<usize> {
    Ok(static_dims(shape)?.into_iter().product())
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

fn bytes_to_f32(bytes: &[u8]) -> BackendResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(BackendError::execution(
            "literal byte length mismatches f32",
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn bytes_to_i32(bytes: &[u8]) -> BackendResult<Vec<i32>> {
    if bytes.len() % 4 != 0 {
        return Err(BackendError::execution(
            "literal byte length mismatches i32",
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn f32_to_bytes(values: &[f32]) -> Arc<[u8]> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn i32_to_bytes(values: &[i32]) -> Arc<[u8]> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}
