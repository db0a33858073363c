use super::{
    attribute::{Attribute, SecurityDeclaration},
    members::{Event, Field, Method, MethodRef, Property},
    signature::TypeSig,
    Accessibility, AssemblyRefId, ModuleRefId, TypeId,
};
use crate::utils::build_bitmask;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TypeKind {
    Class,
    Interface,
    Struct,
    Enum,
    Delegate,
}

impl TypeKind {
    pub fn is_value_type(self) -> bool {
        matches!(self, TypeKind::Struct | TypeKind::Enum)
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum TypeAccessibility {
    #[default]
    NotPublic,
    Public,
    Nested(Accessibility),
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum Layout {
    #[default]
    Automatic,
    Sequential,
    Explicit,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum StringFormatting {
    #[default]
    Ansi,
    Unicode,
    Automatic,
}

#[derive(Debug, Default, Copy, Clone)]
pub struct TypeFlags {
    pub accessibility: TypeAccessibility,
    pub layout: Layout,
    pub abstract_type: bool,
    pub sealed: bool,
    pub special_name: bool,
    pub runtime_special_name: bool,
    pub imported: bool,
    pub serializable: bool,
    pub string_formatting: StringFormatting,
    pub before_field_init: bool,
}

impl TypeFlags {
    /// The TypeAttributes mask (ECMA-335, II.23.1.15).
    pub fn to_mask(self, kind: TypeKind, has_security: bool) -> u32 {
        let visibility = match self.accessibility {
            TypeAccessibility::NotPublic => 0x0,
            TypeAccessibility::Public => 0x1,
            TypeAccessibility::Nested(a) => match a {
                Accessibility::Public => 0x2,
                Accessibility::Private => 0x3,
                Accessibility::Protected => 0x4,
                Accessibility::Internal => 0x5,
                Accessibility::PrivateProtected => 0x6,
                Accessibility::ProtectedInternal => 0x7,
            },
        };
        let layout = match self.layout {
            Layout::Automatic => 0x00,
            Layout::Sequential => 0x08,
            Layout::Explicit => 0x10,
        };
        let formatting = match self.string_formatting {
            StringFormatting::Ansi => 0x00000,
            StringFormatting::Unicode => 0x10000,
            StringFormatting::Automatic => 0x20000,
        };

        visibility
            | layout
            | formatting
            | build_bitmask!(
                kind == TypeKind::Interface => 0x20,
                // interfaces are implicitly abstract
                self.abstract_type || kind == TypeKind::Interface => 0x80,
                self.sealed || kind.is_value_type() || kind == TypeKind::Delegate => 0x100,
                self.special_name => 0x400,
                self.runtime_special_name => 0x800,
                self.imported => 0x1000,
                self.serializable => 0x2000,
                has_security => 0x40000,
                self.before_field_init => 0x100000,
            )
    }
}

/// Where a type is defined.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TypeScope {
    /// In the module being written.
    Defined,
    /// In another assembly or module. Nested external types carry the scope of
    /// their outermost enclosing type and are resolved through it.
    External(ResolutionScope),
    /// Referenced but never bound to a scope; writing fails on first use.
    Unresolved,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResolutionScope {
    Assembly(AssemblyRefId),
    Module(ModuleRefId),
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum Variance {
    #[default]
    Invariant,
    Covariant,
    Contravariant,
}

#[derive(Debug, Default, Copy, Clone)]
pub struct SpecialConstraint {
    pub reference_type: bool,
    pub value_type: bool,
    pub has_default_constructor: bool,
}

#[derive(Debug, Clone)]
pub struct GenericConstraint {
    pub constraint: TypeSig,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct GenericParameter {
    pub name: String,
    pub variance: Variance,
    pub special_constraint: SpecialConstraint,
    pub constraints: Vec<GenericConstraint>,
    pub attributes: Vec<Attribute>,
}

impl GenericParameter {
    pub fn new(name: impl Into<String>) -> Self {
        GenericParameter {
            name: name.into(),
            variance: Variance::Invariant,
            special_constraint: SpecialConstraint::default(),
            constraints: vec![],
            attributes: vec![],
        }
    }

    pub fn flags(&self) -> u16 {
        let variance = match self.variance {
            Variance::Invariant => 0x0,
            Variance::Covariant => 0x1,
            Variance::Contravariant => 0x2,
        };
        variance
            | build_bitmask!(
                self.special_constraint.reference_type => 0x4,
                self.special_constraint.value_type => 0x8,
                self.special_constraint.has_default_constructor => 0x10,
            ) as u16
    }
}

#[derive(Debug, Clone)]
pub struct InterfaceImplementation {
    pub interface: TypeSig,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct MethodOverride {
    pub implementation: MethodRef,
    pub declaration: MethodRef,
}

#[derive(Debug, Copy, Clone)]
pub struct ClassLayout {
    pub packing_size: u16,
    pub class_size: u32,
}

#[derive(Debug, Clone)]
pub struct TypeNode {
    pub name: String,
    pub namespace: Option<String>,
    pub kind: TypeKind,
    pub flags: TypeFlags,
    pub scope: TypeScope,
    pub declaring_type: Option<TypeId>,
    pub base: Option<TypeSig>,
    pub interfaces: Vec<InterfaceImplementation>,
    pub generic_parameters: Vec<GenericParameter>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub properties: Vec<Property>,
    pub events: Vec<Event>,
    pub overrides: Vec<MethodOverride>,
    pub class_layout: Option<ClassLayout>,
    pub attributes: Vec<Attribute>,
    pub security: Vec<SecurityDeclaration>,
}

impl TypeNode {
    pub fn new(namespace: Option<&str>, name: impl Into<String>, kind: TypeKind) -> Self {
        TypeNode {
            name: name.into(),
            namespace: namespace.map(str::to_string),
            kind,
            flags: TypeFlags::default(),
            scope: TypeScope::Defined,
            declaring_type: None,
            base: None,
            interfaces: vec![],
            generic_parameters: vec![],
            fields: vec![],
            methods: vec![],
            properties: vec![],
            events: vec![],
            overrides: vec![],
            class_layout: None,
            attributes: vec![],
            security: vec![],
        }
    }

    pub fn external(namespace: Option<&str>, name: impl Into<String>, kind: TypeKind, scope: ResolutionScope) -> Self {
        TypeNode {
            scope: TypeScope::External(scope),
            ..TypeNode::new(namespace, name, kind)
        }
    }

    pub fn is_defined(&self) -> bool {
        self.scope == TypeScope::Defined
    }

    pub fn type_name(&self) -> String {
        match &self.namespace {
            Some(ns) if !ns.is_empty() => format!("{}.{}", ns, self.name),
            _ => self.name.clone(),
        }
    }
}
