//! Metadata table rows (ECMA-335, II.22) and their serialized layout.

use super::index::{self, Sizes};
use num_derive::FromPrimitive;
use scroll::{ctx::TryIntoCtx, Pwrite};
use std::cmp::Ordering;

pub trait HasKind {
    fn kind() -> Kind;
}

/// Rows of a table that must be kept sorted by a key column.
pub trait SortedRow {
    fn cmp_key(&self, other: &Self) -> Ordering;
}

/// Inserts `row` after every row whose key is not greater, keeping the table sorted
/// and stable. Returns the 0-based position the row landed at.
pub fn insert_sorted<R: SortedRow>(rows: &mut Vec<R>, row: R) -> usize {
    let position = rows.partition_point(|r| r.cmp_key(&row) != Ordering::Greater);
    rows.insert(position, row);
    position
}

// tables must be listed in table number order, which is also the order they are serialized in
macro_rules! tables {
    ($($name:ident($field:ident) = $val:literal { $($fname:ident: $ty:ty,)+ },)+) => {
        #[derive(Clone, Copy, Debug, Eq, FromPrimitive, Hash, PartialEq, PartialOrd, Ord)]
        pub enum Kind {
            $(
                $name = $val,
            )*
        }

        $(
            #[derive(Clone, Copy, Debug, Eq, PartialEq)]
            pub struct $name {
                $(pub $fname: $ty,)*
            }

            impl HasKind for $name {
                fn kind() -> Kind {
                    Kind::$name
                }
            }

            impl<'a> TryIntoCtx<Sizes<'a>> for $name {
                type Error = scroll::Error;

                fn try_into_ctx(self, into: &mut [u8], ctx: Sizes<'a>) -> Result<usize, Self::Error> {
                    let offset = &mut 0;

                    $(into.gwrite_with(self.$fname, offset, ctx)?;)*

                    Ok(*offset)
                }
            }
        )*

        #[derive(Debug, Default, Clone)]
        pub struct Tables {
            $(pub $field: Vec<$name>,)*
        }

        impl Tables {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn len(&self, kind: Kind) -> usize {
                match kind {
                    $(Kind::$name => self.$field.len(),)*
                }
            }

            pub fn row_counts(&self) -> [u32; 64] {
                let mut counts = [0_u32; 64];
                $(counts[Kind::$name as usize] = self.$field.len() as u32;)*
                counts
            }

            pub fn valid_mask(&self) -> u64 {
                let mut mask = 0_u64;
                $(
                    if !self.$field.is_empty() {
                        mask |= 1 << ($val as u64);
                    }
                )*
                mask
            }

            /// Serializes every row of every table, in table number order.
            pub fn write_rows(&self, sizes: Sizes) -> Result<Vec<u8>, scroll::Error> {
                let mut out = vec![];
                let mut scratch = [0_u8; 64];

                $(
                    for row in &self.$field {
                        let len = scratch.pwrite_with(*row, 0, sizes)?;
                        out.extend_from_slice(&scratch[..len]);
                    }
                )*

                Ok(out)
            }
        }
    };
}

macro_rules! sorted {
    ($($name:ident => ($($key:ident),+),)+) => {
        $(
            impl SortedRow for $name {
                fn cmp_key(&self, other: &Self) -> Ordering {
                    ($(&self.$key,)+).cmp(&($(&other.$key,)+))
                }
            }
        )*

        impl Tables {
            pub const SORTED_MASK: u64 = 0 $(| (1 << (Kind::$name as u64)))*;
        }
    };
}

tables! {
    Module(module) = 0x00 {
        generation: u16,
        name: index::String,
        mvid: index::GUID,
        enc_id: index::GUID,
        enc_base_id: index::GUID,
    },
    TypeRef(type_ref) = 0x01 {
        resolution_scope: index::ResolutionScope,
        type_name: index::String,
        type_namespace: index::String,
    },
    TypeDef(type_def) = 0x02 {
        flags: u32,
        type_name: index::String,
        type_namespace: index::String,
        extends: index::TypeDefOrRef,
        field_list: index::Simple<Field>,
        method_list: index::Simple<MethodDef>,
    },
    Field(field) = 0x04 {
        flags: u16,
        name: index::String,
        signature: index::Blob,
    },
    MethodDef(method_def) = 0x06 {
        rva: u32,
        impl_flags: u16,
        flags: u16,
        name: index::String,
        signature: index::Blob,
        param_list: index::Simple<Param>,
    },
    Param(param) = 0x08 {
        flags: u16,
        sequence: u16,
        name: index::String,
    },
    InterfaceImpl(interface_impl) = 0x09 {
        class: index::Simple<TypeDef>,
        interface: index::TypeDefOrRef,
    },
    MemberRef(member_ref) = 0x0A {
        class: index::MemberRefParent,
        name: index::String,
        signature: index::Blob,
    },
    Constant(constant) = 0x0B {
        constant_type: u8,
        padding: u8,
        parent: index::HasConstant,
        value: index::Blob,
    },
    CustomAttribute(custom_attribute) = 0x0C {
        parent: index::HasCustomAttribute,
        attribute_type: index::CustomAttributeType,
        value: index::Blob,
    },
    FieldMarshal(field_marshal) = 0x0D {
        parent: index::HasFieldMarshal,
        native_type: index::Blob,
    },
    DeclSecurity(decl_security) = 0x0E {
        action: u16,
        parent: index::HasDeclSecurity,
        permission_set: index::Blob,
    },
    ClassLayout(class_layout) = 0x0F {
        packing_size: u16,
        class_size: u32,
        parent: index::Simple<TypeDef>,
    },
    FieldLayout(field_layout) = 0x10 {
        offset: u32,
        field: index::Simple<Field>,
    },
    StandAloneSig(stand_alone_sig) = 0x11 {
        signature: index::Blob,
    },
    EventMap(event_map) = 0x12 {
        parent: index::Simple<TypeDef>,
        event_list: index::Simple<Event>,
    },
    Event(event) = 0x14 {
        event_flags: u16,
        name: index::String,
        event_type: index::TypeDefOrRef,
    },
    PropertyMap(property_map) = 0x15 {
        parent: index::Simple<TypeDef>,
        property_list: index::Simple<Property>,
    },
    Property(property) = 0x17 {
        flags: u16,
        name: index::String,
        property_type: index::Blob,
    },
    MethodSemantics(method_semantics) = 0x18 {
        semantics: u16,
        method: index::Simple<MethodDef>,
        association: index::HasSemantics,
    },
    MethodImpl(method_impl) = 0x19 {
        class: index::Simple<TypeDef>,
        method_body: index::MethodDefOrRef,
        method_declaration: index::MethodDefOrRef,
    },
    ModuleRef(module_ref) = 0x1A {
        name: index::String,
    },
    TypeSpec(type_spec) = 0x1B {
        signature: index::Blob,
    },
    ImplMap(impl_map) = 0x1C {
        mapping_flags: u16,
        member_forwarded: index::MemberForwarded,
        import_name: index::String,
        import_scope: index::Simple<ModuleRef>,
    },
    FieldRVA(field_rva) = 0x1D {
        rva: u32,
        field: index::Simple<Field>,
    },
    Assembly(assembly) = 0x20 {
        hash_alg_id: u32,
        major_version: u16,
        minor_version: u16,
        build_number: u16,
        revision_number: u16,
        flags: u32,
        public_key: index::Blob,
        name: index::String,
        culture: index::String,
    },
    AssemblyRef(assembly_ref) = 0x23 {
        major_version: u16,
        minor_version: u16,
        build_number: u16,
        revision_number: u16,
        flags: u32,
        public_key_or_token: index::Blob,
        name: index::String,
        culture: index::String,
        hash_value: index::Blob,
    },
    File(file) = 0x26 {
        flags: u32,
        name: index::String,
        hash_value: index::Blob,
    },
    ExportedType(exported_type) = 0x27 {
        flags: u32,
        type_def_id: u32,
        type_name: index::String,
        type_namespace: index::String,
        implementation: index::Implementation,
    },
    ManifestResource(manifest_resource) = 0x28 {
        offset: u32,
        flags: u32,
        name: index::String,
        implementation: index::Implementation,
    },
    NestedClass(nested_class) = 0x29 {
        nested_class: index::Simple<TypeDef>,
        enclosing_class: index::Simple<TypeDef>,
    },
    GenericParam(generic_param) = 0x2A {
        number: u16,
        flags: u16,
        owner: index::TypeOrMethodDef,
        name: index::String,
    },
    MethodSpec(method_spec) = 0x2B {
        method: index::MethodDefOrRef,
        instantiation: index::Blob,
    },
    GenericParamConstraint(generic_param_constraint) = 0x2C {
        owner: index::Simple<GenericParam>,
        constraint: index::TypeDefOrRef,
    },
}

sorted! {
    InterfaceImpl => (class, interface),
    Constant => (parent),
    CustomAttribute => (parent),
    FieldMarshal => (parent),
    DeclSecurity => (parent),
    ClassLayout => (parent),
    FieldLayout => (field),
    MethodSemantics => (association),
    MethodImpl => (class),
    ImplMap => (member_forwarded),
    FieldRVA => (field),
    NestedClass => (nested_class),
    GenericParam => (owner, number),
    GenericParamConstraint => (owner),
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::{order::Lsb0, view::BitView};

    fn constant(parent: index::HasConstant) -> Constant {
        Constant {
            constant_type: 0x08,
            padding: 0,
            parent,
            value: index::Blob(1),
        }
    }

    #[test]
    fn insertion_keeps_order() {
        use index::HasConstant as C;

        let mut rows = vec![];
        insert_sorted(&mut rows, constant(C::Param(2)));
        insert_sorted(&mut rows, constant(C::Field(5)));
        insert_sorted(&mut rows, constant(C::Field(1)));
        let pos = insert_sorted(&mut rows, constant(C::Property(1)));
        assert_eq!(pos, 1);

        let coded: Vec<_> = rows.iter().map(|r| r.parent.encode().unwrap()).collect();
        let mut sorted = coded.clone();
        sorted.sort();
        assert_eq!(coded, sorted);
    }

    #[test]
    fn equal_keys_stay_in_insertion_order() {
        let mut rows = vec![];
        let first = GenericParamConstraint {
            owner: index::Simple::new(1),
            constraint: index::TypeDefOrRef::TypeRef(4),
        };
        let second = GenericParamConstraint {
            owner: index::Simple::new(1),
            constraint: index::TypeDefOrRef::TypeRef(2),
        };
        insert_sorted(&mut rows, first);
        insert_sorted(&mut rows, second);
        assert_eq!(rows, [first, second]);
    }

    #[test]
    fn masks_and_rows() -> Result<(), scroll::Error> {
        let mut tables = Tables::new();
        tables.module.push(Module {
            generation: 0,
            name: index::String(1),
            mvid: index::GUID(1),
            enc_id: index::GUID(0),
            enc_base_id: index::GUID(0),
        });
        tables.type_spec.push(TypeSpec {
            signature: index::Blob(3),
        });

        assert_eq!(tables.valid_mask(), 1 | (1 << 0x1B));
        assert_ne!(Tables::SORTED_MASK & (1 << 0x0C), 0);
        assert_eq!(Tables::SORTED_MASK & (1 << 0x02), 0);

        let heap = 0_u8;
        let counts = tables.row_counts();
        let sizes = Sizes {
            heap: heap.view_bits::<Lsb0>(),
            tables: &counts,
        };
        let rows = tables.write_rows(sizes)?;
        assert_eq!(rows, [0, 0, 1, 0, 1, 0, 0, 0, 0, 0, 3, 0]);
        Ok(())
    }
}
