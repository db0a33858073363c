//! Custom attributes and declarative security.

use super::{members::MethodRef, signature::TypeSig, TypeId};

/// A fixed or named custom attribute argument.
///
/// See ECMA-335, II.23.3 (page 268) for more information.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Boolean(bool),
    Char(u16),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(Option<String>),
    Type(Option<TypeSig>),
    /// An enum value: the enum type and its underlying integral value.
    Enum(TypeId, Box<AttributeValue>),
    /// A single-dimensional array with its element type.
    Array(TypeSig, Option<Vec<AttributeValue>>),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NamedTarget {
    Field,
    Property,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedArgument {
    pub target: NamedTarget,
    pub name: String,
    pub argument_type: TypeSig,
    pub value: AttributeValue,
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub constructor: MethodRef,
    pub arguments: Vec<AttributeValue>,
    pub named: Vec<NamedArgument>,
}

impl Attribute {
    pub fn new(constructor: impl Into<MethodRef>, arguments: Vec<AttributeValue>) -> Self {
        Attribute {
            constructor: constructor.into(),
            arguments,
            named: vec![],
        }
    }
}

/// Security actions (ECMA-335, II.22.11).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SecurityAction {
    Request,
    Demand,
    Assert,
    Deny,
    PermitOnly,
    LinkDemand,
    InheritanceDemand,
    RequestMinimum,
    RequestOptional,
    RequestRefuse,
    Other(u16),
}

impl SecurityAction {
    pub fn to_u16(self) -> u16 {
        use SecurityAction::*;
        match self {
            Request => 1,
            Demand => 2,
            Assert => 3,
            Deny => 4,
            PermitOnly => 5,
            LinkDemand => 6,
            InheritanceDemand => 7,
            RequestMinimum => 8,
            RequestOptional => 9,
            RequestRefuse => 10,
            Other(v) => v,
        }
    }
}

/// A security attribute inside a declarative permission set.
#[derive(Debug, Clone)]
pub struct SecurityAttribute {
    pub attribute_type: TypeId,
    pub named: Vec<NamedArgument>,
}

#[derive(Debug, Clone)]
pub enum PermissionSet {
    /// Pre-serialized bytes, written as given.
    Raw(Vec<u8>),
    /// Serialized in the binary attribute format (ECMA-335, II.23.1.3).
    Attributes(Vec<SecurityAttribute>),
}

#[derive(Debug, Clone)]
pub struct SecurityDeclaration {
    pub action: SecurityAction,
    pub permission_set: PermissionSet,
}
