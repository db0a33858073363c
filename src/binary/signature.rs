//! Signature blob encodings (ECMA-335, II.23.1 through II.23.3).
//!
//! Everything here has its type and member references already resolved to coded
//! indices. Each encoding writes into fixed slices and into
//! [`scroll_buffer::DynamicBuffer`] alike.

use super::{
    compressed::{Signed, Unsigned},
    index::TypeDefOrRef,
};
use crate::utils::try_into_ctx;
use paste::paste;
use scroll::Pwrite;

macro_rules! element_types {
    ($($name:ident = $val:literal,)+) => {
        $(
            paste! {
                pub const [<ELEMENT_TYPE_ $name>]: u8 = $val;
            }
        )*
    }
}

element_types! {
    END = 0x00,
    VOID = 0x01,
    BOOLEAN = 0x02,
    CHAR = 0x03,
    I1 = 0x04,
    U1 = 0x05,
    I2 = 0x06,
    U2 = 0x07,
    I4 = 0x08,
    U4 = 0x09,
    I8 = 0x0a,
    U8 = 0x0b,
    R4 = 0x0c,
    R8 = 0x0d,
    STRING = 0x0e,
    PTR = 0x0f,
    BYREF = 0x10,
    VALUETYPE = 0x11,
    CLASS = 0x12,
    VAR = 0x13,
    ARRAY = 0x14,
    GENERICINST = 0x15,
    TYPEDBYREF = 0x16,
    I = 0x18,
    U = 0x19,
    FNPTR = 0x1b,
    OBJECT = 0x1c,
    SZARRAY = 0x1d,
    MVAR = 0x1e,
    CMOD_REQD = 0x1f,
    CMOD_OPT = 0x20,
    INTERNAL = 0x21,
    MODIFIER = 0x40,
    SENTINEL = 0x41,
    PINNED = 0x45,
}

// custom attribute blob tags (II.23.3)
pub const CA_TYPE: u8 = 0x50;
pub const CA_BOXED: u8 = 0x51;
pub const CA_FIELD: u8 = 0x53;
pub const CA_PROPERTY: u8 = 0x54;
pub const CA_ENUM: u8 = 0x55;
pub const CA_PROLOG: u16 = 0x0001;
pub const CA_NULL_STRING: u8 = 0xFF;

// calling convention byte (II.23.2.1 - II.23.2.3)
pub const CALL_DEFAULT: u8 = 0x00;
pub const CALL_C: u8 = 0x01;
pub const CALL_STDCALL: u8 = 0x02;
pub const CALL_THISCALL: u8 = 0x03;
pub const CALL_FASTCALL: u8 = 0x04;
pub const CALL_VARARG: u8 = 0x05;
pub const SIG_FIELD: u8 = 0x06;
pub const SIG_LOCAL: u8 = 0x07;
pub const SIG_PROPERTY: u8 = 0x08;
pub const SIG_GENERICINST: u8 = 0x0A;
pub const CALL_GENERIC: u8 = 0x10;
pub const CALL_HASTHIS: u8 = 0x20;
pub const CALL_EXPLICITTHIS: u8 = 0x40;

// security blob prefix for the binary permission set format (II.23.1.3)
pub const SECURITY_SET_PREFIX: u8 = b'.';

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CustomMod {
    pub required: bool,
    pub token: TypeDefOrRef,
}

try_into_ctx!(CustomMod, |self, into| {
    let offset = &mut 0;

    let tag = if self.required { ELEMENT_TYPE_CMOD_REQD } else { ELEMENT_TYPE_CMOD_OPT };
    into.gwrite_with(tag, offset, scroll::LE)?;
    into.gwrite(Unsigned(self.token.encode()?), offset)?;

    Ok(*offset)
});

/// A type signature (II.23.2.12).
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Type {
    /// Types named by their element type alone: primitives, `object`, `string`,
    /// `typedref` and `void`.
    Element(u8),
    Class(TypeDefOrRef),
    ValueType(TypeDefOrRef),
    GenericInst {
        value_type: bool,
        template: TypeDefOrRef,
        arguments: Vec<Type>,
    },
    Array {
        element: Box<Type>,
        rank: u32,
        sizes: Vec<u32>,
        lower_bounds: Vec<i32>,
    },
    Vector(Box<Type>),
    /// `None` is `void*`.
    Pointer(Option<Box<Type>>),
    ByRef(Box<Type>),
    Pinned(Box<Type>),
    Modified(CustomMod, Box<Type>),
    Var(u32),
    MVar(u32),
    FnPtr(Box<MethodSig>),
}

fn class_or_value(value_type: bool) -> u8 {
    if value_type {
        ELEMENT_TYPE_VALUETYPE
    } else {
        ELEMENT_TYPE_CLASS
    }
}

try_into_ctx!(Type, |self, into| {
    let offset = &mut 0;

    match self {
        Type::Element(tag) => {
            into.gwrite_with(tag, offset, scroll::LE)?;
        }
        Type::Class(token) => {
            into.gwrite_with(ELEMENT_TYPE_CLASS, offset, scroll::LE)?;
            into.gwrite(Unsigned(token.encode()?), offset)?;
        }
        Type::ValueType(token) => {
            into.gwrite_with(ELEMENT_TYPE_VALUETYPE, offset, scroll::LE)?;
            into.gwrite(Unsigned(token.encode()?), offset)?;
        }
        Type::GenericInst {
            value_type,
            template,
            arguments,
        } => {
            into.gwrite_with(ELEMENT_TYPE_GENERICINST, offset, scroll::LE)?;
            into.gwrite_with(class_or_value(value_type), offset, scroll::LE)?;
            into.gwrite(Unsigned(template.encode()?), offset)?;
            into.gwrite(Unsigned(arguments.len() as u32), offset)?;
            for a in arguments {
                into.gwrite(a, offset)?;
            }
        }
        Type::Array {
            element,
            rank,
            sizes,
            lower_bounds,
        } => {
            into.gwrite_with(ELEMENT_TYPE_ARRAY, offset, scroll::LE)?;
            into.gwrite(*element, offset)?;
            into.gwrite(Unsigned(rank), offset)?;
            into.gwrite(Unsigned(sizes.len() as u32), offset)?;
            for s in sizes {
                into.gwrite(Unsigned(s), offset)?;
            }
            into.gwrite(Unsigned(lower_bounds.len() as u32), offset)?;
            for b in lower_bounds {
                into.gwrite(Signed(b), offset)?;
            }
        }
        Type::Vector(element) => {
            into.gwrite_with(ELEMENT_TYPE_SZARRAY, offset, scroll::LE)?;
            into.gwrite(*element, offset)?;
        }
        Type::Pointer(pointee) => {
            into.gwrite_with(ELEMENT_TYPE_PTR, offset, scroll::LE)?;
            match pointee {
                Some(p) => into.gwrite(*p, offset)?,
                None => into.gwrite_with(ELEMENT_TYPE_VOID, offset, scroll::LE)?,
            };
        }
        Type::ByRef(inner) => {
            into.gwrite_with(ELEMENT_TYPE_BYREF, offset, scroll::LE)?;
            into.gwrite(*inner, offset)?;
        }
        Type::Pinned(inner) => {
            into.gwrite_with(ELEMENT_TYPE_PINNED, offset, scroll::LE)?;
            into.gwrite(*inner, offset)?;
        }
        Type::Modified(modifier, inner) => {
            into.gwrite(modifier, offset)?;
            into.gwrite(*inner, offset)?;
        }
        Type::Var(n) => {
            into.gwrite_with(ELEMENT_TYPE_VAR, offset, scroll::LE)?;
            into.gwrite(Unsigned(n), offset)?;
        }
        Type::MVar(n) => {
            into.gwrite_with(ELEMENT_TYPE_MVAR, offset, scroll::LE)?;
            into.gwrite(Unsigned(n), offset)?;
        }
        Type::FnPtr(signature) => {
            into.gwrite_with(ELEMENT_TYPE_FNPTR, offset, scroll::LE)?;
            into.gwrite(*signature, offset)?;
        }
    }

    Ok(*offset)
});

/// MethodDefSig, MethodRefSig and StandAloneMethodSig (II.23.2.1 - II.23.2.3).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MethodSig {
    /// The first byte: calling convention plus the HASTHIS, EXPLICITTHIS and GENERIC bits.
    pub calling_convention: u8,
    pub generic_arity: u32,
    pub return_type: Type,
    pub params: Vec<Type>,
    /// Arguments after the sentinel at a vararg call site.
    pub varargs: Vec<Type>,
}

try_into_ctx!(MethodSig, |self, into| {
    let offset = &mut 0;

    into.gwrite_with(self.calling_convention, offset, scroll::LE)?;
    if self.calling_convention & CALL_GENERIC != 0 {
        into.gwrite(Unsigned(self.generic_arity), offset)?;
    }
    into.gwrite(Unsigned((self.params.len() + self.varargs.len()) as u32), offset)?;
    into.gwrite(self.return_type, offset)?;
    for p in self.params {
        into.gwrite(p, offset)?;
    }
    if !self.varargs.is_empty() {
        into.gwrite_with(ELEMENT_TYPE_SENTINEL, offset, scroll::LE)?;
        for v in self.varargs {
            into.gwrite(v, offset)?;
        }
    }

    Ok(*offset)
});

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FieldSig {
    pub modifiers: Vec<CustomMod>,
    pub field_type: Type,
}

try_into_ctx!(FieldSig, |self, into| {
    let offset = &mut 0;

    into.gwrite_with(SIG_FIELD, offset, scroll::LE)?;
    for m in self.modifiers {
        into.gwrite(m, offset)?;
    }
    into.gwrite(self.field_type, offset)?;

    Ok(*offset)
});

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PropertySig {
    pub has_this: bool,
    pub property_type: Type,
    pub params: Vec<Type>,
}

try_into_ctx!(PropertySig, |self, into| {
    let offset = &mut 0;

    let tag = if self.has_this { SIG_PROPERTY | CALL_HASTHIS } else { SIG_PROPERTY };
    into.gwrite_with(tag, offset, scroll::LE)?;
    into.gwrite(Unsigned(self.params.len() as u32), offset)?;
    into.gwrite(self.property_type, offset)?;
    for p in self.params {
        into.gwrite(p, offset)?;
    }

    Ok(*offset)
});

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LocalVar {
    pub pinned: bool,
    pub var_type: Type,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LocalVarSig(pub Vec<LocalVar>);

try_into_ctx!(LocalVarSig, |self, into| {
    let offset = &mut 0;

    into.gwrite_with(SIG_LOCAL, offset, scroll::LE)?;
    into.gwrite(Unsigned(self.0.len() as u32), offset)?;
    for l in self.0 {
        if l.pinned {
            into.gwrite_with(ELEMENT_TYPE_PINNED, offset, scroll::LE)?;
        }
        into.gwrite(l.var_type, offset)?;
    }

    Ok(*offset)
});

/// The instantiation blob of a MethodSpec row (II.23.2.15).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MethodSpec(pub Vec<Type>);

try_into_ctx!(MethodSpec, |self, into| {
    let offset = &mut 0;

    into.gwrite_with(SIG_GENERICINST, offset, scroll::LE)?;
    into.gwrite(Unsigned(self.0.len() as u32), offset)?;
    for a in self.0 {
        into.gwrite(a, offset)?;
    }

    Ok(*offset)
});

/// A SerString: a compressed length and UTF-8 bytes, or `0xFF` for null.
#[derive(Debug, Copy, Clone)]
pub struct SerString<'a>(pub Option<&'a str>);

try_into_ctx!(SerString<'_>, |self, into| {
    let offset = &mut 0;

    match self.0 {
        None => {
            into.gwrite_with(CA_NULL_STRING, offset, scroll::LE)?;
        }
        Some(s) => {
            into.gwrite(Unsigned(s.len() as u32), offset)?;
            into.gwrite(s.as_bytes(), offset)?;
        }
    }

    Ok(*offset)
});

#[cfg(test)]
mod tests {
    use super::*;
    use scroll_buffer::DynamicBuffer;

    fn blob(value: impl scroll::ctx::TryIntoCtx<(), DynamicBuffer, Error = scroll::Error>) -> Vec<u8> {
        let mut buf = DynamicBuffer::with_increment(8);
        buf.pwrite(value, 0).unwrap();
        buf.into_vec()
    }

    #[test]
    fn nested_types() {
        let list = Type::GenericInst {
            value_type: false,
            template: TypeDefOrRef::TypeRef(3),
            arguments: vec![Type::Vector(Box::new(Type::Element(ELEMENT_TYPE_I4)))],
        };
        assert_eq!(blob(list), [0x15, 0x12, 0x0D, 0x01, 0x1D, 0x08]);
        assert_eq!(blob(Type::Pointer(None)), [0x0F, 0x01]);
        assert_eq!(
            blob(Type::ByRef(Box::new(Type::ValueType(TypeDefOrRef::TypeDef(2))))),
            [0x10, 0x11, 0x08]
        );
    }

    #[test]
    fn locals_and_fields() {
        let locals = LocalVarSig(vec![
            LocalVar {
                pinned: true,
                var_type: Type::ByRef(Box::new(Type::Element(ELEMENT_TYPE_U1))),
            },
            LocalVar {
                pinned: false,
                var_type: Type::Var(0),
            },
        ]);
        assert_eq!(blob(locals), [0x07, 0x02, 0x45, 0x10, 0x05, 0x13, 0x00]);

        let field = FieldSig {
            modifiers: vec![CustomMod {
                required: true,
                token: TypeDefOrRef::TypeRef(1),
            }],
            field_type: Type::Element(ELEMENT_TYPE_I4),
        };
        assert_eq!(blob(field), [0x06, 0x1F, 0x05, 0x08]);
    }

    #[test]
    fn ser_strings() {
        assert_eq!(blob(SerString(None)), [0xFF]);
        assert_eq!(blob(SerString(Some("ab"))), [0x02, b'a', b'b']);
    }
}
