use std::{collections::HashMap, fmt, sync::Arc};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

/// Function-definition format version written into every serialized program.
pub const FORMAT_VERSION: &str = "graphfn.v1";

fn default_format_version() -> String {
    FORMAT_VERSION.to_string()
}

/// Scalar element types understood by the function-definition format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si32,
    F32,
}

impl DType {
    pub fn is_integer(self) -> bool {
        matches!(self, DType::Si32)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }

    /// Gradients only flow through floating-point values.
    pub fn is_differentiable(self) -> bool {
        self.is_float()
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 => 1,
            DType::Si32 | DType::F32 => 4,
        }
    }
}

/// Names a symbolic dynamic dimension (e.g. `?B`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DimSymbol::new(name))
    }
}

/// A single axis extent; dynamic axes stay symbolic until run time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic(DimSymbol),
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self::new(
            dims.iter()
                .map(|dim| Dimension::Static(*dim))
                .collect::<Vec<_>>(),
        )
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        let mut dims = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            match dim {
                Dimension::Static(value) => dims.push(*value),
                Dimension::Dynamic(_) => return None,
            }
        }
        Some(dims)
    }

    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        let mut count = 1usize;
        for dim in dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?
            .checked_mul(self.dtype.size_in_bytes())
    }
}

/// Dense literal tensor payload, little-endian.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> Self {
        Self { spec, bytes }
    }

    pub fn from_f32(dims: &[usize], values: &[f32]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self::new(
            TensorSpec::new(DType::F32, Shape::from_static(dims)),
            Arc::from(bytes),
        )
    }

    pub fn from_i32(dims: &[usize], values: &[i32]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self::new(
            TensorSpec::new(DType::Si32, Shape::from_static(dims)),
            Arc::from(bytes),
        )
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if self.spec.dtype != DType::F32 || self.bytes.len() % 4 != 0 {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }

    pub fn to_i32_vec(&self) -> Option<Vec<i32>> {
        if self.spec.dtype != DType::Si32 || self.bytes.len() % 4 != 0 {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(4)
                .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            spec: TensorSpec,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        Ok(TensorLiteral {
            spec: helper.spec,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

/// Initialization payload when materialising tensors on a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TensorInit {
    Literal(TensorLiteral),
    Zeroed(TensorSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    Less,
    LessEqual,
    Equal,
    GreaterEqual,
    Greater,
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseUnaryOp {
    Neg,
    Exp,
    Log,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    Sum,
    Max,
    Min,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub kind: ReduceKind,
    pub axes: Vec<usize>,
    pub keepdims: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompareSpec {
    pub op: ComparisonOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CastSpec {
    pub dtype: DType,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReshapeSpec {
    pub new_shape: Shape,
}

/// Numpy-style broadcast: operand dims align to the trailing result dims.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastToSpec {
    pub result_shape: Shape,
}

/// Invokes another registered function by name. The result is a tuple with one
/// element per callee output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSpec {
    pub target: String,
}

/// SSA value identifier, unique within one function or graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(TensorSpec),
    Tuple(Vec<ValueType>),
}

impl ValueType {
    pub fn as_tensor(&self) -> Option<&TensorSpec> {
        match self {
            ValueType::Tensor(spec) => Some(spec),
            ValueType::Tuple(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    Value(ValueId),
    TupleElement { tuple: ValueId, index: usize },
    Literal(TensorLiteral),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Constant(TensorLiteral),
    ElementwiseUnary(ElementwiseUnaryOp),
    ElementwiseBinary(ElementwiseBinaryOp),
    Reduce(ReduceSpec),
    Compare(CompareSpec),
    Select,
    Cast(CastSpec),
    StopGradient,
    Reshape(ReshapeSpec),
    BroadcastTo(BroadcastToSpec),
    Call(CallSpec),
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Constant(_) => "constant",
            Operation::ElementwiseUnary(_) => "elementwise_unary",
            Operation::ElementwiseBinary(_) => "elementwise_binary",
            Operation::Reduce(_) => "reduce",
            Operation::Compare(_) => "compare",
            Operation::Select => "select",
            Operation::Cast(_) => "cast",
            Operation::StopGradient => "stop_gradient",
            Operation::Reshape(_) => "reshape",
            Operation::BroadcastTo(_) => "broadcast_to",
            Operation::Call(_) => "call",
        }
    }
}

/// Single SSA instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<Operand>,
    pub output: ValueType,
}

/// Serialized form of a registered, callable function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<ValueType>,
    pub parameter_ids: Vec<ValueId>,
    pub results: Vec<ValueType>,
    pub body: Vec<Instruction>,
    pub outputs: Vec<Operand>,
}

impl Function {
    /// Names of the functions this body invokes, in first-use order.
    pub fn callees(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for instruction in &self.body {
            if let Operation::Call(spec) = &instruction.op {
                if !names.contains(&spec.target.as_str()) {
                    names.push(spec.target.as_str());
                }
            }
        }
        names
    }
}

/// An entry function plus every function reachable from it through calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default = "default_format_version")]
    pub format_version: String,
    pub entry: String,
    pub functions: Vec<Function>,
}

#[derive(Debug, Error)]
pub enum ProgramSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("program format version '{found}' does not match expected '{expected}'")]
    FormatVersionMismatch {
        found: String,
        expected: &'static str,
    },
}

impl Program {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            entry: entry.into(),
            functions: Vec::new(),
        }
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|function| function.name == name)
    }

    pub fn entry_function(&self) -> Option<&Function> {
        self.function(&self.entry)
    }

    pub fn to_json_string(&self) -> Result<String, ProgramSerdeError> {
        serde_json::to_string_pretty(self).map_err(ProgramSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ProgramSerdeError> {
        let mut program: Program = serde_json::from_str(src).map_err(ProgramSerdeError::from)?;
        program.format_version = normalize_format_version(program.format_version)?;
        Ok(program)
    }

    pub fn to_bincode_bytes(&self) -> Result<Vec<u8>, ProgramSerdeError> {
        bincode::serialize(self).map_err(ProgramSerdeError::from)
    }

    pub fn from_bincode_slice(bytes: &[u8]) -> Result<Self, ProgramSerdeError> {
        let mut program: Program = bincode::deserialize(bytes).map_err(ProgramSerdeError::from)?;
        program.format_version = normalize_format_version(program.format_version)?;
        Ok(program)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

fn normalize_format_version(version: String) -> Result<String, ProgramSerdeError> {
    if version.is_empty() {
        return Ok(FORMAT_VERSION.to_string());
    }
    if version == FORMAT_VERSION {
        Ok(version)
    } else {
        Err(ProgramSerdeError::FormatVersionMismatch {
            found: version,
            expected: FORMAT_VERSION,
        })
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(
            f,
            0,
            &format!(
                "program @{} (format_version = {}) {{",
                self.entry, self.format_version
            ),
        )?;
        for function in &self.functions {
            fmt_function(function, 1, f)?;
        }
        write_line(f, 0, "}")
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_function(self, 0, f)
    }
}

fn fmt_function(function: &Function, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write_line(f, indent, &format!("func @{} {{", function.name))?;
    if !function.parameter_ids.is_empty() {
        write_line(f, indent + 1, "params:")?;
        for (value_id, value_type) in function
            .parameter_ids
            .iter()
            .zip(function.parameters.iter())
        {
            write_line(
                f,
                indent + 2,
                &format!("%{} : {}", value_id.0, format_value_type(value_type)),
            )?;
        }
    }
    if !function.body.is_empty() {
        write_line(f, indent + 1, "body:")?;
        for instruction in &function.body {
            fmt_instruction(instruction, indent + 2, f)?;
        }
    }
    if !function.outputs.is_empty() {
        write_line(f, indent + 1, "results:")?;
        for (operand, value_type) in function.outputs.iter().zip(function.results.iter()) {
            write_line(
                f,
                indent + 2,
                &format!(
                    "{} : {}",
                    format_operand(operand),
                    format_value_type(value_type)
                ),
            )?;
        }
    }
    write_line(f, indent, "}")
}

fn fmt_instruction(
    instruction: &Instruction,
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let operands = instruction
        .operands
        .iter()
        .map(format_operand)
        .collect::<Vec<_>>()
        .join(", ");
    let op_repr = match &instruction.op {
        Operation::Call(spec) => format!("call @{}", spec.target),
        Operation::Constant(lit) => format!(
            "constant<{:?} x {}>",
            lit.spec.dtype,
            format_shape(&lit.spec.shape)
        ),
        other => format!("{other:?}"),
    };
    let line = if operands.is_empty() {
        format!(
            "%{} = {} -> {}",
            instruction.id.0,
            op_repr,
            format_value_type(&instruction.output)
        )
    } else {
        format!(
            "%{} = {}({}) -> {}",
            instruction.id.0,
            op_repr,
            operands,
            format_value_type(&instruction.output)
        )
    };
    write_line(f, indent, &line)
}

fn format_value_type(value_type: &ValueType) -> String {
    match value_type {
        ValueType::Tensor(spec) => {
            format!("tensor<{:?} x {}>", spec.dtype, format_shape(&spec.shape))
        }
        ValueType::Tuple(elements) => {
            let inner = elements
                .iter()
                .map(format_value_type)
                .collect::<Vec<_>>()
                .join(", ");
            format!("tuple<{}>", inner)
        }
    }
}

pub(crate) fn format_shape(shape: &Shape) -> String {
    let dims = shape
        .dims()
        .iter()
        .map(|dim| match dim {
            Dimension::Static(v) => v.to_string(),
            Dimension::Dynamic(sym) => format!("?{}", sym.as_str()),
        })
        .collect::<Vec<_>>();
    if dims.is_empty() {
        "[]".to_string()
    } else {
        dims.join("x")
    }
}

fn format_operand(operand: &Operand) -> String {
    match operand {
        Operand::Value(id) => format!("%{}", id.0),
        Operand::TupleElement { tuple, index } => format!("%{}[{}]", tuple.0, index),
        Operand::Literal(lit) => format!(
            "literal(dtype={:?}, shape={})",
            lit.spec.dtype,
            format_shape(&lit.spec.shape)
        ),
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}

/// Lightweight builder for constructing functions instruction by instruction.
#[derive(Default)]
pub struct ProgramBuilder {
    next_value_id: u32,
    parameters: Vec<(ValueId, ValueType)>,
    instructions: Vec<Instruction>,
    value_types: HashMap<ValueId, ValueType>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter(&mut self, ty: ValueType) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.value_types.insert(id, ty.clone());
        self.parameters.push((id, ty));
        id
    }

    pub fn emit(&mut self, op: Operation, operands: Vec<Operand>, output: ValueType) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.value_types.insert(id, output.clone());
        self.instructions.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        id
    }

    pub fn value_type(&self, id: ValueId) -> Option<&ValueType> {
        self.value_types.get(&id)
    }

    fn operand_type(&self, operand: &Operand) -> Result<ValueType, SpecError> {
        match operand {
            Operand::Value(id) => self.value_types.get(id).cloned().ok_or_else(|| {
                SpecError::new(SpecErrorCode::UnknownValue, format!("%{}", id.0))
            }),
            Operand::TupleElement { tuple, index } => match self.value_types.get(tuple) {
                Some(ValueType::Tuple(elements)) => {
                    elements.get(*index).cloned().ok_or_else(|| {
                        SpecError::new(
                            SpecErrorCode::UnknownValue,
                            format!("%{}[{}]", tuple.0, index),
                        )
                    })
                }
                _ => Err(SpecError::new(
                    SpecErrorCode::UnknownValue,
                    format!("%{} is not a tuple", tuple.0),
                )),
            },
            Operand::Literal(lit) => Ok(ValueType::Tensor(lit.spec.clone())),
        }
    }

    pub fn finish(
        self,
        name: impl Into<String>,
        outputs: Vec<Operand>,
    ) -> Result<Function, SpecError> {
        let results = outputs
            .iter()
            .map(|operand| self.operand_type(operand))
            .collect::<Result<Vec<_>, _>>()?;
        let (parameter_ids, parameters): (Vec<_>, Vec<_>) = self.parameters.into_iter().unzip();
        Ok(Function {
            name: name.into(),
            parameters,
            parameter_ids,
            results,
            body: self.instructions,
            outputs,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpecErrorCode {
    DTypeNotSupported,
    InvalidAttributeValue,
    IntegerDivideByZero,
    ShapeMismatch,
    BroadcastRankMismatch,
    UnknownValue,
    UnknownFunction,
    ArityMismatch,
    Unspecified(&'static str),
}

impl SpecErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecErrorCode::DTypeNotSupported => "SpecError: dtype not supported for op",
            SpecErrorCode::InvalidAttributeValue => "SpecError: invalid attribute value",
            SpecErrorCode::IntegerDivideByZero => "SpecError: integer divide by zero",
            SpecErrorCode::ShapeMismatch => "SpecError: operand shapes do not match",
            SpecErrorCode::BroadcastRankMismatch => "SpecError: broadcast rank mismatch",
            SpecErrorCode::UnknownValue => "SpecError: unknown value",
            SpecErrorCode::UnknownFunction => "SpecError: unknown function",
            SpecErrorCode::ArityMismatch => "SpecError: argument count mismatch",
            SpecErrorCode::Unspecified(code) => code,
        }
    }
}

/// Validation failure captured before execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecError {
    pub code: SpecErrorCode,
    pub detail: Option<String>,
}

impl SpecError {
    pub fn new(code: SpecErrorCode, detail: impl Into<Option<String>>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for SpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({detail})", self.code.as_str()),
            None => write!(f, "{}", self.code.as_str()),
        }
    }
}

impl std::error::Error for SpecError {}

/// Engine error surfaced to higher layers unchanged.
#[derive(Debug)]
pub enum BackendError {
    SpecViolation(SpecError),
    Unimplemented { op: &'static str, reason: String },
    Execution { message: String },
}

impl BackendError {
    pub fn spec(code: SpecErrorCode, detail: impl Into<Option<String>>) -> Self {
        BackendError::SpecViolation(SpecError::new(code, detail))
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::SpecViolation(err) => write!(f, "{err}"),
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

pub type BackendResult<T> = Result<T, BackendError>;

/// The tensor computation engine the tracer delegates execution to.
pub trait PortableBackend: Send + Sync {
    type TensorHandle: Clone + Send + Sync + 'static;

    /// Returns a human-readable backend identifier (e.g., `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Materialises a tensor handle from host initialisation data.
    fn materialize(&self, init: TensorInit) -> BackendResult<Self::TensorHandle>;

    /// Reads back a tensor handle into a dense literal.
    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral>;

    /// Executes a single instruction eagerly. `Call` instructions need a
    /// program context and go through [`PortableBackend::run_program`].
    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>>;

    /// Executes the entry function of `program`, resolving calls against the
    /// program's function list.
    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>>;
}
