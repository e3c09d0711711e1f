//! The SPIR-V vocabulary the IR emits: opcodes, storage classes, and
//! capabilities.
//!
//! Only the subset the lowering actually produces is modeled; the numeric
//! values match the SPIR-V specification so a binary backend can emit words
//! directly.

use strum::{Display, IntoStaticStr};

/// SPIR-V opcodes produced by the lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[repr(u16)]
pub enum Op {
    ExtInstImport = 11,
    ExtInst = 12,
    TypeVoid = 19,
    TypeBool = 20,
    TypeInt = 21,
    TypeFloat = 22,
    TypeVector = 23,
    TypeMatrix = 24,
    TypeImage = 25,
    TypeSampler = 26,
    TypeSampledImage = 27,
    TypeArray = 28,
    TypeRuntimeArray = 29,
    TypeStruct = 30,
    TypePointer = 32,
    TypeFunction = 33,
    ConstantTrue = 41,
    ConstantFalse = 42,
    Constant = 43,
    ConstantComposite = 44,
    Function = 54,
    FunctionParameter = 55,
    FunctionEnd = 56,
    FunctionCall = 57,
    Variable = 59,
    Load = 61,
    Store = 62,
    AccessChain = 65,
    VectorShuffle = 79,
    CompositeConstruct = 80,
    CompositeExtract = 81,
    SampledImage = 86,
    ImageSampleImplicitLod = 87,
    ImageSampleExplicitLod = 88,
    ImageQuerySize = 104,
    ImageQuerySizeLod = 103,
    ConvertFToU = 109,
    ConvertFToS = 110,
    ConvertSToF = 111,
    ConvertUToF = 112,
    Bitcast = 124,
    SNegate = 126,
    FNegate = 127,
    IAdd = 128,
    FAdd = 129,
    ISub = 130,
    FSub = 131,
    IMul = 132,
    FMul = 133,
    UDiv = 134,
    SDiv = 135,
    FDiv = 136,
    SMod = 139,
    FMod = 141,
    VectorTimesScalar = 142,
    MatrixTimesScalar = 143,
    VectorTimesMatrix = 144,
    MatrixTimesVector = 145,
    MatrixTimesMatrix = 146,
    Dot = 148,
    LogicalOr = 166,
    LogicalAnd = 167,
    LogicalNot = 168,
    IEqual = 170,
    INotEqual = 171,
    SGreaterThan = 173,
    SGreaterThanEqual = 175,
    SLessThan = 177,
    SLessThanEqual = 179,
    FOrdEqual = 180,
    FOrdNotEqual = 182,
    FOrdLessThan = 184,
    FOrdGreaterThan = 186,
    FOrdLessThanEqual = 188,
    FOrdGreaterThanEqual = 190,
    ShiftRightLogical = 194,
    ShiftLeftLogical = 196,
    BitwiseOr = 197,
    BitwiseXor = 198,
    BitwiseAnd = 199,
    Not = 200,
    DPdx = 207,
    DPdy = 208,
    Label = 248,
    Branch = 249,
    BranchConditional = 250,
    Return = 253,
    ReturnValue = 254,
}

/// Storage classes for pointers and variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[repr(u16)]
pub enum StorageClass {
    UniformConstant = 0,
    Input = 1,
    Uniform = 2,
    Output = 3,
    Private = 6,
    Function = 7,
    StorageBuffer = 12,
}

impl StorageClass {
    /// Whether variables of this class are module-level globals.
    #[must_use]
    pub fn is_global(self) -> bool {
        matches!(
            self,
            Self::Uniform | Self::UniformConstant | Self::StorageBuffer | Self::Input | Self::Output | Self::Private
        )
    }
}

/// Capabilities an op can require; gathered into the module header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, IntoStaticStr)]
#[repr(u16)]
pub enum Capability {
    Matrix = 0,
    Shader = 1,
    ImageQuery = 50,
    Linkage = 5,
}

/// The capability an op implies beyond the baseline, if any.
#[must_use]
pub fn required_capability(op: Op) -> Option<Capability> {
    match op {
        Op::ImageQuerySize | Op::ImageQuerySizeLod => Some(Capability::ImageQuery),
        _ => None,
    }
}

/// The extension an op or storage class requires, if any.
#[must_use]
pub fn required_extension(storage: StorageClass) -> Option<&'static str> {
    match storage {
        StorageClass::StorageBuffer => Some("SPV_KHR_storage_buffer_storage_class"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_match_the_specification() {
        assert_eq!(Op::TypeFloat as u16, 22);
        assert_eq!(Op::MatrixTimesVector as u16, 145);
        assert_eq!(Op::Label as u16, 248);
    }

    #[test]
    fn conversion_opcode_values_match_the_specification() {
        assert_eq!(Op::ConvertFToU as u16, 109);
        assert_eq!(Op::ConvertFToS as u16, 110);
        assert_eq!(Op::ConvertSToF as u16, 111);
        assert_eq!(Op::ConvertUToF as u16, 112);
    }

    #[test]
    fn image_queries_require_the_query_capability() {
        assert_eq!(required_capability(Op::ImageQuerySize), Some(Capability::ImageQuery));
        assert_eq!(required_capability(Op::FAdd), None);
    }
}
