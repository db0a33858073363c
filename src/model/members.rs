use super::{
    attribute::{Attribute, SecurityDeclaration},
    body::Body,
    signature::{MethodSignature, TypeSig},
    types::GenericParameter,
    Accessibility, FieldId, MethodId, ModuleRefId,
};
pub use crate::binary::heap::DataSection;
use crate::utils::build_bitmask;

/// A compile-time constant stored in the Constant table.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
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
    String(String),
    Null,
}

#[derive(Debug, Clone)]
pub struct StaticData {
    pub data: Vec<u8>,
    pub section: DataSection,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum CharacterSet {
    #[default]
    NotSpecified,
    Ansi,
    Unicode,
    Auto,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum UnmanagedCallingConvention {
    #[default]
    Platform,
    Cdecl,
    Stdcall,
    Thiscall,
    Fastcall,
}

/// Platform invocation metadata for an ImplMap row (ECMA-335, II.22.22).
#[derive(Debug, Clone)]
pub struct PInvoke {
    pub module: ModuleRefId,
    pub import_name: String,
    pub no_mangle: bool,
    pub character_set: CharacterSet,
    pub supports_last_error: bool,
    pub calling_convention: UnmanagedCallingConvention,
    pub best_fit_mapping: Option<bool>,
    pub throw_on_unmappable_char: Option<bool>,
}

impl PInvoke {
    pub fn new(module: ModuleRefId, import_name: impl Into<String>) -> Self {
        PInvoke {
            module,
            import_name: import_name.into(),
            no_mangle: false,
            character_set: CharacterSet::NotSpecified,
            supports_last_error: false,
            calling_convention: UnmanagedCallingConvention::Platform,
            best_fit_mapping: None,
            throw_on_unmappable_char: None,
        }
    }

    pub fn flags(&self) -> u16 {
        let charset = match self.character_set {
            CharacterSet::NotSpecified => 0x0,
            CharacterSet::Ansi => 0x2,
            CharacterSet::Unicode => 0x4,
            CharacterSet::Auto => 0x6,
        };
        let best_fit = match self.best_fit_mapping {
            None => 0x00,
            Some(true) => 0x10,
            Some(false) => 0x20,
        };
        let throw = match self.throw_on_unmappable_char {
            None => 0x0000,
            Some(true) => 0x1000,
            Some(false) => 0x2000,
        };
        let convention = match self.calling_convention {
            UnmanagedCallingConvention::Platform => 0x100,
            UnmanagedCallingConvention::Cdecl => 0x200,
            UnmanagedCallingConvention::Stdcall => 0x300,
            UnmanagedCallingConvention::Thiscall => 0x400,
            UnmanagedCallingConvention::Fastcall => 0x500,
        };

        charset
            | best_fit
            | throw
            | convention
            | build_bitmask!(self.no_mangle => 0x1, self.supports_last_error => 0x40) as u16
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub field_type: TypeSig,
    pub accessibility: Accessibility,
    pub static_member: bool,
    pub init_only: bool,
    pub literal: bool,
    pub not_serialized: bool,
    pub special_name: bool,
    pub runtime_special_name: bool,
    /// Written with `modreq(IsVolatile)`.
    pub volatile: bool,
    pub default: Option<Constant>,
    pub marshal: Option<Vec<u8>>,
    pub offset: Option<u32>,
    pub initial_value: Option<StaticData>,
    pub pinvoke: Option<PInvoke>,
    pub attributes: Vec<Attribute>,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: TypeSig) -> Self {
        Field {
            name: name.into(),
            field_type,
            accessibility: Accessibility::Private,
            static_member: false,
            init_only: false,
            literal: false,
            not_serialized: false,
            special_name: false,
            runtime_special_name: false,
            volatile: false,
            default: None,
            marshal: None,
            offset: None,
            initial_value: None,
            pinvoke: None,
            attributes: vec![],
        }
    }

    pub fn static_member(name: impl Into<String>, field_type: TypeSig) -> Self {
        Field {
            static_member: true,
            ..Field::new(name, field_type)
        }
    }

    /// The FieldAttributes mask (ECMA-335, II.23.1.5).
    pub fn flags(&self) -> u16 {
        self.accessibility.member_mask()
            | build_bitmask!(
                self.static_member => 0x0010,
                self.init_only => 0x0020,
                self.literal => 0x0040,
                self.not_serialized => 0x0080,
                self.special_name => 0x0200,
                self.pinvoke.is_some() => 0x2000,
                self.runtime_special_name => 0x0400,
                self.marshal.is_some() => 0x1000,
                self.default.is_some() => 0x8000,
                self.initial_value.is_some() => 0x0100,
            ) as u16
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum BodyFormat {
    #[default]
    IL,
    Native,
    Runtime,
}

#[derive(Debug, Default, Copy, Clone)]
pub struct MethodImplFlags {
    pub format: BodyFormat,
    pub unmanaged: bool,
    pub forward_ref: bool,
    pub preserve_sig: bool,
    pub internal_call: bool,
    pub synchronized: bool,
    pub no_inlining: bool,
    pub no_optimization: bool,
    pub aggressive_inlining: bool,
}

impl MethodImplFlags {
    pub fn to_mask(self) -> u16 {
        let format = match self.format {
            BodyFormat::IL => 0x0,
            BodyFormat::Native => 0x1,
            BodyFormat::Runtime => 0x3,
        };
        format
            | build_bitmask!(
                self.unmanaged => 0x0004,
                self.forward_ref => 0x0010,
                self.preserve_sig => 0x0080,
                self.internal_call => 0x1000,
                self.synchronized => 0x0020,
                self.no_inlining => 0x0008,
                self.no_optimization => 0x0040,
                self.aggressive_inlining => 0x0100,
            ) as u16
    }
}

#[derive(Debug, Default, Clone)]
pub struct ParameterInfo {
    pub name: Option<String>,
    pub is_in: bool,
    pub is_out: bool,
    pub optional: bool,
    pub default: Option<Constant>,
    pub marshal: Option<Vec<u8>>,
    pub attributes: Vec<Attribute>,
}

impl ParameterInfo {
    pub fn named(name: impl Into<String>) -> Self {
        ParameterInfo {
            name: Some(name.into()),
            ..ParameterInfo::default()
        }
    }

    pub fn flags(&self) -> u16 {
        build_bitmask!(
            self.is_in => 0x0001,
            self.is_out => 0x0002,
            self.optional => 0x0010,
            self.default.is_some() => 0x1000,
            self.marshal.is_some() => 0x2000,
        ) as u16
    }
}

#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub signature: MethodSignature,
    pub accessibility: Accessibility,
    pub sealed: bool,
    pub virtual_member: bool,
    pub hide_by_sig: bool,
    pub new_slot: bool,
    pub strict: bool,
    pub abstract_member: bool,
    pub special_name: bool,
    pub runtime_special_name: bool,
    pub require_sec_object: bool,
    pub impl_flags: MethodImplFlags,
    /// Per-parameter metadata, in signature order; may be shorter than the signature.
    pub parameters: Vec<ParameterInfo>,
    pub return_info: Option<ParameterInfo>,
    pub generic_parameters: Vec<GenericParameter>,
    pub pinvoke: Option<PInvoke>,
    pub body: Option<Body>,
    pub attributes: Vec<Attribute>,
    pub security: Vec<SecurityDeclaration>,
}

impl Method {
    pub fn new(name: impl Into<String>, signature: MethodSignature) -> Self {
        Method {
            name: name.into(),
            signature,
            accessibility: Accessibility::Public,
            sealed: false,
            virtual_member: false,
            hide_by_sig: true,
            new_slot: false,
            strict: false,
            abstract_member: false,
            special_name: false,
            runtime_special_name: false,
            require_sec_object: false,
            impl_flags: MethodImplFlags::default(),
            parameters: vec![],
            return_info: None,
            generic_parameters: vec![],
            pinvoke: None,
            body: None,
            attributes: vec![],
            security: vec![],
        }
    }

    pub fn with_body(name: impl Into<String>, signature: MethodSignature, body: Body) -> Self {
        Method {
            body: Some(body),
            ..Method::new(name, signature)
        }
    }

    /// An instance constructor (`.ctor`).
    pub fn constructor(parameters: Vec<TypeSig>, body: Option<Body>) -> Self {
        Method {
            special_name: true,
            runtime_special_name: true,
            body,
            ..Method::new(".ctor", MethodSignature::instance(TypeSig::Void, parameters))
        }
    }

    pub fn is_static(&self) -> bool {
        !self.signature.instance
    }

    /// The MethodAttributes mask (ECMA-335, II.23.1.10).
    pub fn flags(&self) -> u16 {
        self.accessibility.member_mask()
            | build_bitmask!(
                self.is_static() => 0x0010,
                self.sealed => 0x0020,
                self.virtual_member => 0x0040,
                self.hide_by_sig => 0x0080,
                self.new_slot => 0x0100,
                self.strict => 0x0200,
                self.abstract_member => 0x0400,
                self.special_name => 0x0800,
                self.runtime_special_name => 0x1000,
                self.pinvoke.is_some() => 0x2000,
                !self.security.is_empty() => 0x4000,
                self.require_sec_object => 0x8000,
            ) as u16
    }
}

#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub property_type: TypeSig,
    pub parameters: Vec<TypeSig>,
    pub instance: bool,
    pub getter: Option<MethodId>,
    pub setter: Option<MethodId>,
    pub other: Vec<MethodId>,
    pub default: Option<Constant>,
    pub special_name: bool,
    pub runtime_special_name: bool,
    pub attributes: Vec<Attribute>,
}

impl Property {
    pub fn new(name: impl Into<String>, property_type: TypeSig) -> Self {
        Property {
            name: name.into(),
            property_type,
            parameters: vec![],
            instance: true,
            getter: None,
            setter: None,
            other: vec![],
            default: None,
            special_name: false,
            runtime_special_name: false,
            attributes: vec![],
        }
    }

    pub fn flags(&self) -> u16 {
        build_bitmask!(
            self.special_name => 0x0200,
            self.runtime_special_name => 0x0400,
            self.default.is_some() => 0x1000,
        ) as u16
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub delegate_type: TypeSig,
    pub add_listener: Option<MethodId>,
    pub remove_listener: Option<MethodId>,
    pub raise_event: Option<MethodId>,
    pub other: Vec<MethodId>,
    pub special_name: bool,
    pub runtime_special_name: bool,
    pub attributes: Vec<Attribute>,
}

impl Event {
    pub fn new(name: impl Into<String>, delegate_type: TypeSig) -> Self {
        Event {
            name: name.into(),
            delegate_type,
            add_listener: None,
            remove_listener: None,
            raise_event: None,
            other: vec![],
            special_name: false,
            runtime_special_name: false,
            attributes: vec![],
        }
    }

    pub fn flags(&self) -> u16 {
        build_bitmask!(self.special_name => 0x0200, self.runtime_special_name => 0x0400) as u16
    }
}

/// A use of a method: an instantiated parent, generic method arguments and
/// vararg call-site types all turn a plain definition into a reference row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub method: MethodId,
    /// The declaring type as seen from the call site, e.g. `List<int>`.
    pub parent: Option<TypeSig>,
    pub generic_arguments: Vec<TypeSig>,
    pub vararg_types: Vec<TypeSig>,
}

impl MethodRef {
    pub fn new(method: MethodId) -> Self {
        MethodRef {
            method,
            parent: None,
            generic_arguments: vec![],
            vararg_types: vec![],
        }
    }

    pub fn on(method: MethodId, parent: TypeSig) -> Self {
        MethodRef {
            parent: Some(parent),
            ..MethodRef::new(method)
        }
    }

    pub fn generic(method: MethodId, generic_arguments: Vec<TypeSig>) -> Self {
        MethodRef {
            generic_arguments,
            ..MethodRef::new(method)
        }
    }
}

impl From<MethodId> for MethodRef {
    fn from(method: MethodId) -> Self {
        MethodRef::new(method)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub field: FieldId,
    pub parent: Option<TypeSig>,
}

impl FieldRef {
    pub fn new(field: FieldId) -> Self {
        FieldRef { field, parent: None }
    }

    pub fn on(field: FieldId, parent: TypeSig) -> Self {
        FieldRef {
            field,
            parent: Some(parent),
        }
    }
}

impl From<FieldId> for FieldRef {
    fn from(field: FieldId) -> Self {
        FieldRef::new(field)
    }
}
