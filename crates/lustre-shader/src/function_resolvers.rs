//! The function resolver registry: how language operators, casts, and
//! intrinsic members become SPIR-V instructions.
//!
//! Vector-scalar arithmetic that SPIR-V has no instruction for is lowered as
//! "splat the scalar, then vector op vector"; matrix products are emitted
//! with operand order flipped to match SPIR-V's column-major semantics.

use ahash::AHashMap;

use lustre::{
    Module, TypeId,
    opcode::{BinaryOp, CastOperator},
    types::Primitive,
};

use crate::spirv::Op;

/// Which operand needs splatting into a vector before the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Splat {
    None,
    Left,
    Right,
}

/// The lowering of one binary operator application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryLowering {
    pub op: Op,
    pub splat: Splat,
    /// Emit operands right-then-left (matrix products under row-vector
    /// conventions).
    pub flip_operands: bool,
    /// The result is a boolean (comparisons).
    pub boolean_result: bool,
}

impl BinaryLowering {
    fn plain(op: Op) -> Self {
        Self {
            op,
            splat: Splat::None,
            flip_operands: false,
            boolean_result: false,
        }
    }

    fn comparison(op: Op) -> Self {
        Self {
            boolean_result: true,
            ..Self::plain(op)
        }
    }
}

/// Scalar class of a primitive for instruction selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScalarClass {
    Float,
    Int,
    Bool,
}

fn scalar_class(primitive: Primitive) -> Option<ScalarClass> {
    match primitive {
        Primitive::Real | Primitive::DoubleReal | Primitive::Quaternion => Some(ScalarClass::Float),
        Primitive::Byte | Primitive::Integer | Primitive::DoubleInteger => Some(ScalarClass::Int),
        Primitive::Boolean => Some(ScalarClass::Bool),
        other => {
            let (component, _) = other.vector_shape()?;
            scalar_class(component)
        }
    }
}

/// Selects the instruction (and splat/flip treatment) for a binary operator
/// over the given language types.
#[must_use]
pub fn resolve_binary(module: &Module, op: BinaryOp, left: TypeId, right: TypeId) -> Option<BinaryLowering> {
    let left_primitive = module.primitive_of(left)?;
    let right_primitive = module.primitive_of(right)?;

    // Matrix products flip to match column-major conventions.
    if left_primitive.matrix_shape().is_some() {
        if right_primitive.matrix_shape().is_some() && op == BinaryOp::Multiply {
            return Some(BinaryLowering {
                flip_operands: true,
                ..BinaryLowering::plain(Op::MatrixTimesMatrix)
            });
        }
        if right_primitive.vector_shape().is_some() && op == BinaryOp::Multiply {
            // `mat * vec` under row-vector rules is `vec * mat` in SPIR-V.
            return Some(BinaryLowering {
                flip_operands: true,
                ..BinaryLowering::plain(Op::VectorTimesMatrix)
            });
        }
        return None;
    }

    let left_vector = left_primitive.vector_shape().is_some();
    let right_vector = right_primitive.vector_shape().is_some();
    let class = scalar_class(left_primitive)?;

    // Vector-scalar forms: multiplication has a native instruction; the
    // rest splat the scalar side.
    if left_vector && !right_vector {
        if op == BinaryOp::Multiply && class == ScalarClass::Float {
            return Some(BinaryLowering::plain(Op::VectorTimesScalar));
        }
        let mut lowering = resolve_binary_uniform(class, op)?;
        lowering.splat = Splat::Right;
        return Some(lowering);
    }
    if right_vector && !left_vector {
        if op == BinaryOp::Multiply && class == ScalarClass::Float {
            return Some(BinaryLowering {
                flip_operands: true,
                ..BinaryLowering::plain(Op::VectorTimesScalar)
            });
        }
        let mut lowering = resolve_binary_uniform(class, op)?;
        lowering.splat = Splat::Left;
        return Some(lowering);
    }

    resolve_binary_uniform(class, op)
}

/// Instruction selection when both operands share a shape.
fn resolve_binary_uniform(class: ScalarClass, op: BinaryOp) -> Option<BinaryLowering> {
    use BinaryOp as B;
    let lowering = match (class, op) {
        (ScalarClass::Float, B::Add) => BinaryLowering::plain(Op::FAdd),
        (ScalarClass::Float, B::Subtract) => BinaryLowering::plain(Op::FSub),
        (ScalarClass::Float, B::Multiply) => BinaryLowering::plain(Op::FMul),
        (ScalarClass::Float, B::Divide) => BinaryLowering::plain(Op::FDiv),
        (ScalarClass::Float, B::Modulo) => BinaryLowering::plain(Op::FMod),
        (ScalarClass::Float, B::Equal) => BinaryLowering::comparison(Op::FOrdEqual),
        (ScalarClass::Float, B::NotEqual) => BinaryLowering::comparison(Op::FOrdNotEqual),
        (ScalarClass::Float, B::Less) => BinaryLowering::comparison(Op::FOrdLessThan),
        (ScalarClass::Float, B::LessEqual) => BinaryLowering::comparison(Op::FOrdLessThanEqual),
        (ScalarClass::Float, B::Greater) => BinaryLowering::comparison(Op::FOrdGreaterThan),
        (ScalarClass::Float, B::GreaterEqual) => BinaryLowering::comparison(Op::FOrdGreaterThanEqual),
        (ScalarClass::Int, B::Add) => BinaryLowering::plain(Op::IAdd),
        (ScalarClass::Int, B::Subtract) => BinaryLowering::plain(Op::ISub),
        (ScalarClass::Int, B::Multiply) => BinaryLowering::plain(Op::IMul),
        (ScalarClass::Int, B::Divide) => BinaryLowering::plain(Op::SDiv),
        (ScalarClass::Int, B::Modulo) => BinaryLowering::plain(Op::SMod),
        (ScalarClass::Int, B::BitwiseAnd) => BinaryLowering::plain(Op::BitwiseAnd),
        (ScalarClass::Int, B::BitwiseOr) => BinaryLowering::plain(Op::BitwiseOr),
        (ScalarClass::Int, B::BitwiseXor) => BinaryLowering::plain(Op::BitwiseXor),
        (ScalarClass::Int, B::ShiftLeft) => BinaryLowering::plain(Op::ShiftLeftLogical),
        (ScalarClass::Int, B::ShiftRight) => BinaryLowering::plain(Op::ShiftRightLogical),
        (ScalarClass::Int, B::Equal) => BinaryLowering::comparison(Op::IEqual),
        (ScalarClass::Int, B::NotEqual) => BinaryLowering::comparison(Op::INotEqual),
        (ScalarClass::Int, B::Less) => BinaryLowering::comparison(Op::SLessThan),
        (ScalarClass::Int, B::LessEqual) => BinaryLowering::comparison(Op::SLessThanEqual),
        (ScalarClass::Int, B::Greater) => BinaryLowering::comparison(Op::SGreaterThan),
        (ScalarClass::Int, B::GreaterEqual) => BinaryLowering::comparison(Op::SGreaterThanEqual),
        (ScalarClass::Bool, B::Equal) => BinaryLowering::comparison(Op::IEqual),
        (ScalarClass::Bool, B::NotEqual) => BinaryLowering::comparison(Op::INotEqual),
        _ => return None,
    };
    Some(lowering)
}

/// Selects the conversion instruction for a cast operator.
#[must_use]
pub fn resolve_cast(operator: &CastOperator) -> Option<Op> {
    let CastOperator::Primitive { from, to } = operator else {
        return None;
    };
    let from = scalar_class(*from)?;
    let to = scalar_class(*to)?;
    match (from, to) {
        (ScalarClass::Int, ScalarClass::Float) => Some(Op::ConvertSToF),
        (ScalarClass::Float, ScalarClass::Int) => Some(Op::ConvertFToS),
        (ScalarClass::Int, ScalarClass::Int) | (ScalarClass::Float, ScalarClass::Float) => Some(Op::Bitcast),
        _ => None,
    }
}

/// How an intrinsic call lowers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicLowering {
    /// A plain instruction over the argument values.
    Simple(Op),
    /// An extended-instruction-set call (`GLSL.std.450` member number).
    Extended(u32),
    /// Implicit-LOD image sampling (receiver + coordinate).
    SampleImplicitLod,
}

/// GLSL.std.450 member numbers for the extended intrinsics.
const GLSL_SQRT: u32 = 31;
const GLSL_NORMALIZE: u32 = 69;
const GLSL_CROSS: u32 = 68;

/// Registry mapping language members (by owner and name) to lowerings.
#[derive(Debug)]
pub struct FunctionResolverRegistry {
    entries: AHashMap<(Option<String>, String), IntrinsicLowering>,
}

impl Default for FunctionResolverRegistry {
    fn default() -> Self {
        let mut entries = AHashMap::new();
        entries.insert((None, "Ddx".to_owned()), IntrinsicLowering::Simple(Op::DPdx));
        entries.insert((None, "Ddy".to_owned()), IntrinsicLowering::Simple(Op::DPdy));
        entries.insert((None, "Dot".to_owned()), IntrinsicLowering::Simple(Op::Dot));
        entries.insert((None, "Sqrt".to_owned()), IntrinsicLowering::Extended(GLSL_SQRT));
        entries.insert((None, "Normalize".to_owned()), IntrinsicLowering::Extended(GLSL_NORMALIZE));
        entries.insert((None, "Cross".to_owned()), IntrinsicLowering::Extended(GLSL_CROSS));
        entries.insert(
            (Some(crate::intrinsics::SAMPLED_IMAGE_2D.to_owned()), "Sample".to_owned()),
            IntrinsicLowering::SampleImplicitLod,
        );
        Self { entries }
    }
}

impl FunctionResolverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, owner: Option<String>, name: impl Into<String>, lowering: IntrinsicLowering) {
        self.entries.insert((owner, name.into()), lowering);
    }

    /// The lowering for a member, if it is an intrinsic.
    #[must_use]
    pub fn find(&self, module: &Module, function: lustre::FunctionId) -> Option<IntrinsicLowering> {
        let declared = module.function(function);
        let owner = declared.owner.map(|owner| module.types.name_of(owner).to_owned());
        self.entries.get(&(owner, declared.name.clone())).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_scalar_multiply_uses_the_native_instruction() {
        let module = Module::new();
        let real3 = module.core.primitive(Primitive::Real3);
        let real = module.core.real();
        let lowering = resolve_binary(&module, BinaryOp::Multiply, real3, real).unwrap();
        assert_eq!(lowering.op, Op::VectorTimesScalar);
        assert_eq!(lowering.splat, Splat::None);
    }

    #[test]
    fn vector_scalar_add_splats() {
        let module = Module::new();
        let real3 = module.core.primitive(Primitive::Real3);
        let real = module.core.real();
        let lowering = resolve_binary(&module, BinaryOp::Add, real3, real).unwrap();
        assert_eq!(lowering.op, Op::FAdd);
        assert_eq!(lowering.splat, Splat::Right);
    }

    #[test]
    fn matrix_vector_product_flips_operands() {
        let module = Module::new();
        let mat = module.core.primitive(Primitive::Real3x3);
        let vec = module.core.primitive(Primitive::Real3);
        let lowering = resolve_binary(&module, BinaryOp::Multiply, mat, vec).unwrap();
        assert_eq!(lowering.op, Op::VectorTimesMatrix);
        assert!(lowering.flip_operands);
    }

    #[test]
    fn integer_to_real_cast_converts() {
        let cast = CastOperator::Primitive {
            from: Primitive::Integer,
            to: Primitive::Real,
        };
        assert_eq!(resolve_cast(&cast), Some(Op::ConvertSToF));
    }
}
