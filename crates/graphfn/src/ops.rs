//! Typed graph operations with static shape inference.
//!
//! Every op validates its operands against the builder's graph and computes the
//! result type before emitting a node. Binary elementwise ops require identical
//! operand types; broadcasting is explicit through [`GraphBuilder::broadcast_to`].

use std::sync::Arc;

use anyhow::Result;

use crate::backend::spec::{
    BroadcastToSpec, CastSpec, CompareSpec, ComparisonOp, DType, Dimension, ElementwiseBinaryOp,
    ElementwiseUnaryOp, Operand, Operation, PortableBackend, ReduceKind, ReduceSpec, ReshapeSpec,
    Shape, TensorLiteral, TensorSpec,
};
use crate::error::TraceError;
use crate::graph::{GraphBuilder, TracedTensor};

fn invalid(op: &'static str, reason: impl Into<String>) -> anyhow::Error {
    TraceError::InvalidOperands {
        op,
        reason: reason.into(),
    }
    .into()
}

/// Dense literal of `spec` with every element set to `value`.
pub fn filled_literal(spec: &TensorSpec, value: f64) -> Result<TensorLiteral> {
    let count = spec
        .element_count()
        .ok_or_else(|| invalid("constant", "constants require a static shape"))?;
    let mut bytes = Vec::with_capacity(count * spec.dtype.size_in_bytes());
    for _ in 0..count {
        match spec.dtype {
            DType::F32 => bytes.extend_from_slice(&(value as f32).to_le_bytes()),
            DType::Si32 => bytes.extend_from_slice(&(value as i32).to_le_bytes()),
            DType::I1 => bytes.push(u8::from(value != 0.0)),
        }
    }
    Ok(TensorLiteral::new(spec.clone(), Arc::from(bytes)))
}

impl<'a, B: PortableBackend + 'static> GraphBuilder<'a, B> {
    pub fn add(&mut self, lhs: &TracedTensor, rhs: &TracedTensor) -> Result<TracedTensor> {
        self.binary(ElementwiseBinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: &TracedTensor, rhs: &TracedTensor) -> Result<TracedTensor> {
        self.binary(ElementwiseBinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: &TracedTensor, rhs: &TracedTensor) -> Result<TracedTensor> {
        self.binary(ElementwiseBinaryOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: &TracedTensor, rhs: &TracedTensor) -> Result<TracedTensor> {
        self.binary(ElementwiseBinaryOp::Div, lhs, rhs)
    }

    pub fn maximum(&mut self, lhs: &TracedTensor, rhs: &TracedTensor) -> Result<TracedTensor> {
        self.binary(ElementwiseBinaryOp::Maximum, lhs, rhs)
    }

    pub fn minimum(&mut self, lhs: &TracedTensor, rhs: &TracedTensor) -> Result<TracedTensor> {
        self.binary(ElementwiseBinaryOp::Minimum, lhs, rhs)
    }

    fn binary(
        &mut self,
        op: ElementwiseBinaryOp,
        lhs: &TracedTensor,
        rhs: &TracedTensor,
    ) -> Result<TracedTensor> {
        let l = self.check(lhs)?;
        let r = self.check(rhs)?;
        if lhs.spec() != rhs.spec() {
            return Err(invalid(
                "elementwise_binary",
                format!("{op:?} operands differ: {:?} vs {:?}", lhs.spec(), rhs.spec()),
            ));
        }
        if lhs.dtype() == DType::I1 {
            return Err(invalid("elementwise_binary", format!("{op:?} on I1 values")));
        }
        Ok(self.emit(
            Operation::ElementwiseBinary(op),
            vec![Operand::Value(l), Operand::Value(r)],
            lhs.spec().clone(),
        ))
    }

    pub fn neg(&mut self, x: &TracedTensor) -> Result<TracedTensor> {
        self.unary(ElementwiseUnaryOp::Neg, x)
    }

    pub fn exp(&mut self, x: &TracedTensor) -> Result<TracedTensor> {
        self.unary(ElementwiseUnaryOp::Exp, x)
    }

    pub fn log(&mut self, x: &TracedTensor) -> Result<TracedTensor> {
        self.unary(ElementwiseUnaryOp::Log, x)
    }

    pub fn tanh(&mut self, x: &TracedTensor) -> Result<TracedTensor> {
        self.unary(ElementwiseUnaryOp::Tanh, x)
    }

    fn unary(&mut self, op: ElementwiseUnaryOp, x: &TracedTensor) -> Result<TracedTensor> {
        let value = self.check(x)?;
        let supported = match op {
            ElementwiseUnaryOp::Neg => x.dtype() != DType::I1,
            _ => x.dtype().is_float(),
        };
        if !supported {
            return Err(invalid(
                "elementwise_unary",
                format!("{op:?} does not accept {:?}", x.dtype()),
            ));
        }
        Ok(self.emit(
            Operation::ElementwiseUnary(op),
            vec![Operand::Value(value)],
            x.spec().clone(),
        ))
    }

    pub fn reduce_sum(&mut self, x: &TracedTensor, axes: &[usize], keepdims: bool) -> Result<TracedTensor> {
        self.reduce(x, ReduceKind::Sum, axes, keepdims)
    }

    pub fn reduce_max(&mut self, x: &TracedTensor, axes: &[usize], keepdims: bool) -> Result<TracedTensor> {
        self.reduce(x, ReduceKind::Max, axes, keepdims)
    }

    /// Reduces over `axes`; dropped axes disappear unless `keepdims` keeps them as 1.
    pub fn reduce(
        &mut self,
        x: &TracedTensor,
        kind: ReduceKind,
        axes: &[usize],
        keepdims: bool,
    ) -> Result<TracedTensor> {
        let value = self.check(x)?;
        if x.dtype() == DType::I1 {
            return Err(invalid("reduce", "cannot reduce I1 values"));
        }
        let rank = x.shape().rank();
        let mut sorted = axes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if let Some(axis) = sorted.iter().find(|axis| **axis >= rank) {
            return Err(invalid("reduce", format!("axis {axis} out of range for rank {rank}")));
        }
        let shape = reduced_shape(x.shape(), &sorted, keepdims);
        Ok(self.emit(
            Operation::Reduce(ReduceSpec {
                kind,
                axes: sorted,
                keepdims,
            }),
            vec![Operand::Value(value)],
            TensorSpec::new(x.dtype(), shape),
        ))
    }

    /// Elementwise comparison producing an I1 mask.
    pub fn compare(
        &mut self,
        op: ComparisonOp,
        lhs: &TracedTensor,
        rhs: &TracedTensor,
    ) -> Result<TracedTensor> {
        let l = self.check(lhs)?;
        let r = self.check(rhs)?;
        if lhs.spec() != rhs.spec() {
            return Err(invalid(
                "compare",
                format!("operands differ: {:?} vs {:?}", lhs.spec(), rhs.spec()),
            ));
        }
        Ok(self.emit(
            Operation::Compare(CompareSpec { op }),
            vec![Operand::Value(l), Operand::Value(r)],
            TensorSpec::new(DType::I1, lhs.shape().clone()),
        ))
    }

    pub fn select(
        &mut self,
        predicate: &TracedTensor,
        on_true: &TracedTensor,
        on_false: &TracedTensor,
    ) -> Result<TracedTensor> {
        let p = self.check(predicate)?;
        let t = self.check(on_true)?;
        let f = self.check(on_false)?;
        if predicate.dtype() != DType::I1 {
            return Err(invalid("select", "predicate must be I1"));
        }
        if on_true.spec() != on_false.spec() || predicate.shape() != on_true.shape() {
            return Err(invalid(
                "select",
                format!(
                    "branch or predicate mismatch: {:?} / {:?} / {:?}",
                    predicate.spec(),
                    on_true.spec(),
                    on_false.spec()
                ),
            ));
        }
        Ok(self.emit(
            Operation::Select,
            vec![Operand::Value(p), Operand::Value(t), Operand::Value(f)],
            on_true.spec().clone(),
        ))
    }

    pub fn cast(&mut self, x: &TracedTensor, dtype: DType) -> Result<TracedTensor> {
        let value = self.check(x)?;
        Ok(self.emit(
            Operation::Cast(CastSpec { dtype }),
            vec![Operand::Value(value)],
            TensorSpec::new(dtype, x.shape().clone()),
        ))
    }

    /// Identity in the forward pass; blocks gradient flow.
    pub fn stop_gradient(&mut self, x: &TracedTensor) -> Result<TracedTensor> {
        let value = self.check(x)?;
        Ok(self.emit(
            Operation::StopGradient,
            vec![Operand::Value(value)],
            x.spec().clone(),
        ))
    }

    pub fn reshape(&mut self, x: &TracedTensor, shape: Shape) -> Result<TracedTensor> {
        let value = self.check(x)?;
        match (x.shape().element_count(), shape.element_count()) {
            (Some(from), Some(to)) if from == to => {}
            (Some(from), Some(to)) => {
                return Err(invalid(
                    "reshape",
                    format!("cannot reshape {from} elements into {to}"),
                ))
            }
            _ => return Err(invalid("reshape", "reshape requires static shapes")),
        }
        Ok(self.emit(
            Operation::Reshape(ReshapeSpec {
                new_shape: shape.clone(),
            }),
            vec![Operand::Value(value)],
            TensorSpec::new(x.dtype(), shape),
        ))
    }

    /// Numpy-style broadcast: operand dims align with the trailing result dims and
    /// must either match or be 1.
    pub fn broadcast_to(&mut self, x: &TracedTensor, shape: Shape) -> Result<TracedTensor> {
        let value = self.check(x)?;
        let from = x.shape().dims();
        let to = shape.dims();
        if from.len() > to.len() {
            return Err(invalid(
                "broadcast_to",
                format!("rank {} cannot broadcast to rank {}", from.len(), to.len()),
            ));
        }
        let offset = to.len() - from.len();
        for (axis, dim) in from.iter().enumerate() {
            let target = &to[axis + offset];
            if dim != target && *dim != Dimension::Static(1) {
                return Err(invalid(
                    "broadcast_to",
                    format!("axis {axis}: {dim:?} cannot broadcast to {target:?}"),
                ));
            }
        }
        Ok(self.emit(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: shape.clone(),
            }),
            vec![Operand::Value(value)],
            TensorSpec::new(x.dtype(), shape),
        ))
    }

    pub fn constant(&mut self, literal: TensorLiteral) -> TracedTensor {
        let spec = literal.spec.clone();
        self.emit(Operation::Constant(literal), Vec::new(), spec)
    }

    pub fn constant_f32(&mut self, dims: &[usize], values: &[f32]) -> Result<TracedTensor> {
        let expected: usize = dims.iter().product();
        if expected != values.len() {
            return Err(invalid(
                "constant",
                format!("shape {dims:?} needs {expected} values, got {}", values.len()),
            ));
        }
        Ok(self.constant(TensorLiteral::from_f32(dims, values)))
    }

    pub fn scalar_f32(&mut self, value: f32) -> TracedTensor {
        self.constant(TensorLiteral::from_f32(&[], &[value]))
    }

    pub fn full(&mut self, spec: &TensorSpec, value: f64) -> Result<TracedTensor> {
        let literal = filled_literal(spec, value)?;
        Ok(self.constant(literal))
    }

    pub fn full_like(&mut self, x: &TracedTensor, value: f64) -> Result<TracedTensor> {
        self.full(x.spec(), value)
    }

    pub fn zeros(&mut self, spec: &TensorSpec) -> Result<TracedTensor> {
        self.full(spec, 0.0)
    }
}

/// Shape of `shape` after reducing over sorted, in-range `axes`.
pub(crate) fn reduced_shape(shape: &Shape, axes: &[usize], keepdims: bool) -> Shape {
    let dims = shape
        .dims()
        .iter()
        .enumerate()
        .filter_map(|(axis, dim)| {
            if !axes.contains(&axis) {
                Some(dim.clone())
            } else if keepdims {
                Some(Dimension::Static(1))
            } else {
                None
            }
        })
        .collect::<Vec<_>>();
    Shape::new(dims)
}
