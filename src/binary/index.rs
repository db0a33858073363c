//! Row indices, heap indices, coded indices and metadata tokens.

use super::table::{HasKind, Kind};
use bitvec::{order::Lsb0, slice::BitSlice};
use num_traits::FromPrimitive;
use scroll::{ctx::TryIntoCtx, Pwrite};
use std::{cmp::Ordering, fmt, marker::PhantomData};

use ilemit_macros::coded_index;

pub const USER_STRING_TAG: u8 = 0x70;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TokenTarget {
    Table(Kind),
    UserString,
}

/// A 4-byte reference to a table row (or user string) as used by IL operands.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Token {
    pub target: TokenTarget,
    pub index: usize,
}

impl Token {
    pub fn new(kind: Kind, index: usize) -> Self {
        Token {
            target: TokenTarget::Table(kind),
            index,
        }
    }

    pub fn user_string(offset: usize) -> Self {
        Token {
            target: TokenTarget::UserString,
            index: offset,
        }
    }

    pub fn encode(self) -> Result<u32, scroll::Error> {
        if self.index > 0x00FF_FFFF {
            return Err(scroll::Error::Custom(format!(
                "token index {:#x} does not fit in 24 bits",
                self.index
            )));
        }

        let tag = match self.target {
            TokenTarget::Table(k) => k as u8,
            TokenTarget::UserString => USER_STRING_TAG,
        };

        Ok(((tag as u32) << 24) | (self.index as u32))
    }

    pub fn decode(raw: u32) -> Result<Self, scroll::Error> {
        let tag = (raw >> 24) as u8;
        let index = (raw & 0x00FF_FFFF) as usize;

        let target = if tag == USER_STRING_TAG {
            TokenTarget::UserString
        } else {
            match Kind::from_u8(tag) {
                Some(k) => TokenTarget::Table(k),
                None => {
                    return Err(scroll::Error::Custom(format!(
                        "bad token table tag {:#04x}",
                        tag
                    )))
                }
            }
        };

        Ok(Token { target, index })
    }
}

impl TryIntoCtx for Token {
    type Error = scroll::Error;

    fn try_into_ctx(self, into: &mut [u8], _: ()) -> Result<usize, Self::Error> {
        let offset = &mut 0;
        into.gwrite_with(self.encode()?, offset, scroll::LE)?;
        Ok(*offset)
    }
}

/// Column width context for row serialization.
#[derive(Clone, Copy, Debug)]
pub struct Sizes<'a> {
    pub heap: &'a BitSlice<u8, Lsb0>,
    pub tables: &'a [u32; 64],
}

impl Sizes<'_> {
    pub fn rows(&self, kind: Kind) -> u32 {
        self.tables[kind as usize]
    }
}

macro_rules! uint_impl {
    ($ty:ty) => {
        impl<'a> TryIntoCtx<Sizes<'a>> for $ty {
            type Error = scroll::Error;

            fn try_into_ctx(self, into: &mut [u8], _: Sizes<'a>) -> Result<usize, Self::Error> {
                self.try_into_ctx(into, scroll::LE)
            }
        }
    };
}

uint_impl!(u8);
uint_impl!(u16);
uint_impl!(u32);

macro_rules! heap_index {
    ($name:ident, $idx:literal) => {
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
        pub struct $name(pub usize);

        impl<'a> TryIntoCtx<Sizes<'a>> for $name {
            type Error = scroll::Error;

            fn try_into_ctx(self, into: &mut [u8], sizes: Sizes<'a>) -> Result<usize, Self::Error> {
                let offset = &mut 0;

                if sizes.heap[$idx] {
                    into.gwrite_with(self.0 as u32, offset, scroll::LE)?;
                } else {
                    into.gwrite_with(self.0 as u16, offset, scroll::LE)?;
                }

                Ok(*offset)
            }
        }

        impl $name {
            pub fn is_null(&self) -> bool {
                self.0 == 0
            }
        }
    };
}

heap_index!(String, 0);
heap_index!(GUID, 1);
heap_index!(Blob, 2);

/// A plain 1-based index into the table holding `T` rows.
pub struct Simple<T>(pub usize, PhantomData<T>);

impl<T> Simple<T> {
    pub fn new(index: usize) -> Self {
        Simple(index, PhantomData)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl<T> Clone for Simple<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Simple<T> {}
impl<T> PartialEq for Simple<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for Simple<T> {}
impl<T> PartialOrd for Simple<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Simple<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}
impl<T> fmt::Debug for Simple<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Simple({})", self.0)
    }
}

impl<'a, T: HasKind> TryIntoCtx<Sizes<'a>> for Simple<T> {
    type Error = scroll::Error;

    fn try_into_ctx(self, into: &mut [u8], sizes: Sizes<'a>) -> Result<usize, Self::Error> {
        let offset = &mut 0;

        if sizes.rows(T::kind()) < (1 << 16) {
            into.gwrite_with(self.0 as u16, offset, scroll::LE)?;
        } else {
            into.gwrite_with(self.0 as u32, offset, scroll::LE)?;
        }

        Ok(*offset)
    }
}

coded_index!(TypeDefOrRef, {
    TypeDef,
    TypeRef,
    TypeSpec
});
coded_index!(HasConstant, {
    Field,
    Param,
    Property
});
coded_index!(HasCustomAttribute, {
    MethodDef,
    Field,
    TypeRef,
    TypeDef,
    Param,
    InterfaceImpl,
    MemberRef,
    Module,
    DeclSecurity,
    Property,
    Event,
    StandAloneSig,
    ModuleRef,
    TypeSpec,
    Assembly,
    AssemblyRef,
    File,
    ExportedType,
    ManifestResource,
    GenericParam,
    GenericParamConstraint,
    MethodSpec
});
coded_index!(HasFieldMarshal, {
    Field,
    Param
});
coded_index!(HasDeclSecurity, {
    TypeDef,
    MethodDef,
    Assembly
});
coded_index!(MemberRefParent, {
    TypeDef,
    TypeRef,
    ModuleRef,
    MethodDef,
    TypeSpec
});
coded_index!(HasSemantics, {
    Event,
    Property
});
coded_index!(MethodDefOrRef, {
    MethodDef,
    MemberRef
});
coded_index!(MemberForwarded, {
    Field,
    MethodDef
});
coded_index!(Implementation, {
    File,
    AssemblyRef,
    ExportedType
});
coded_index!(CustomAttributeType, {
    Unused,
    Unused,
    MethodDef,
    MemberRef,
    Unused
});
coded_index!(ResolutionScope, {
    Module,
    ModuleRef,
    AssemblyRef,
    TypeRef
});
coded_index!(TypeOrMethodDef, {
    TypeDef,
    MethodDef
});
