//! The in-memory module graph consumed by the writer.
//!
//! Types live in an arena owned by [`module::Module`] and are addressed by [`TypeId`].
//! Members are owned by their declaring type and addressed by the type's id plus
//! their position, so the graph never needs shared ownership.

pub mod attribute;
pub mod body;
pub mod members;
pub mod module;
pub mod signature;
pub mod types;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Accessibility {
    #[default]
    Private,
    PrivateProtected, // FamANDAssem
    Internal,         // Assem
    Protected,        // Family
    ProtectedInternal, // FamORAssem
    Public,
}

impl Accessibility {
    /// The member access bits shared by field and method flags.
    pub fn member_mask(self) -> u16 {
        use Accessibility::*;
        match self {
            Private => 0x1,
            PrivateProtected => 0x2,
            Internal => 0x3,
            Protected => 0x4,
            ProtectedInternal => 0x5,
            Public => 0x6,
        }
    }
}

/// Position of a type in [`module::Module::types`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub usize);

impl TypeId {
    /// The `<Module>` pseudo-type holding global fields and methods.
    pub const MODULE: TypeId = TypeId(0);
}

macro_rules! member_id {
    ($($name:ident),+) => {
        $(
            #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
            pub struct $name {
                pub parent_type: TypeId,
                pub index: usize,
            }

            impl $name {
                pub const fn new(parent_type: TypeId, index: usize) -> Self {
                    $name { parent_type, index }
                }
            }
        )*
    };
}

member_id!(FieldId, MethodId, PropertyId, EventId);

macro_rules! list_id {
    ($($name:ident),+) => {
        $(
            #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
            pub struct $name(pub usize);
        )*
    };
}

list_id!(AssemblyRefId, ModuleRefId, FileId, ExportedTypeId, DocumentId);
