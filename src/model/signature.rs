//! Type and method signatures as they appear in the model.

use super::TypeId;

/// Array bounds; sizes and lower bounds may be shorter than the rank.
///
/// See ECMA-335, II.23.2.13 (page 267) for more information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ArrayShape {
    pub rank: u32,
    pub sizes: Vec<u32>,
    pub lower_bounds: Vec<i32>,
}

impl ArrayShape {
    pub fn new(rank: u32) -> Self {
        ArrayShape {
            rank,
            sizes: vec![],
            lower_bounds: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSig {
    Void,
    Boolean,
    Char,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    IntPtr,
    UIntPtr,
    Object,
    String,
    TypedReference,
    /// A class or value type, by the kind of the node it names.
    Named(TypeId),
    GenericInstance(TypeId, Vec<TypeSig>),
    Array(Box<TypeSig>, ArrayShape),
    /// A single-dimensional, zero-based array.
    Vector(Box<TypeSig>),
    /// An unmanaged pointer; `None` is `void*`.
    Pointer(Option<Box<TypeSig>>),
    Reference(Box<TypeSig>),
    Pinned(Box<TypeSig>),
    Modified {
        modifier: TypeId,
        required: bool,
        inner: Box<TypeSig>,
    },
    TypeParameter(u32),
    MethodParameter(u32),
    FunctionPointer(Box<MethodSignature>),
}

impl TypeSig {
    pub fn vector(element: TypeSig) -> Self {
        TypeSig::Vector(Box::new(element))
    }

    pub fn reference(inner: TypeSig) -> Self {
        TypeSig::Reference(Box::new(inner))
    }

    pub fn pointer(inner: TypeSig) -> Self {
        TypeSig::Pointer(Some(Box::new(inner)))
    }

    pub fn array(element: TypeSig, shape: ArrayShape) -> Self {
        TypeSig::Array(Box::new(element), shape)
    }

    /// The name of the `System` type a primitive stands for, such as `Int32`.
    pub fn primitive_name(&self) -> Option<&'static str> {
        use TypeSig::*;
        Some(match self {
            Void => "Void",
            Boolean => "Boolean",
            Char => "Char",
            Int8 => "SByte",
            UInt8 => "Byte",
            Int16 => "Int16",
            UInt16 => "UInt16",
            Int32 => "Int32",
            UInt32 => "UInt32",
            Int64 => "Int64",
            UInt64 => "UInt64",
            Float32 => "Single",
            Float64 => "Double",
            IntPtr => "IntPtr",
            UIntPtr => "UIntPtr",
            Object => "Object",
            String => "String",
            TypedReference => "TypedReference",
            _ => return None,
        })
    }

    /// Strips custom modifiers and `pinned`.
    pub fn unmodified(&self) -> &TypeSig {
        match self {
            TypeSig::Modified { inner, .. } | TypeSig::Pinned(inner) => inner.unmodified(),
            other => other,
        }
    }
}

/// Calling conventions of managed and stand-alone method signatures.
///
/// See ECMA-335, II.23.2.3 (page 262) for more information.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    #[default]
    Default,
    Vararg,
    C,
    StdCall,
    ThisCall,
    FastCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    pub instance: bool,
    pub explicit_this: bool,
    pub calling_convention: CallingConvention,
    pub return_type: TypeSig,
    pub parameters: Vec<TypeSig>,
}

impl MethodSignature {
    pub fn new(instance: bool, return_type: TypeSig, parameters: Vec<TypeSig>) -> Self {
        MethodSignature {
            instance,
            explicit_this: false,
            calling_convention: CallingConvention::Default,
            return_type,
            parameters,
        }
    }

    pub fn instance(return_type: TypeSig, parameters: Vec<TypeSig>) -> Self {
        Self::new(true, return_type, parameters)
    }

    pub fn static_member(return_type: TypeSig, parameters: Vec<TypeSig>) -> Self {
        Self::new(false, return_type, parameters)
    }

    pub fn returns_void(&self) -> bool {
        matches!(self.return_type.unmodified(), TypeSig::Void)
    }
}
