//! Custom attribute blobs (ECMA-335, II.23.3), serialized type names and
//! declarative security permission sets (II.23.1.3).

use super::Session;
use crate::{
    binary::{compressed::Unsigned, signature::*},
    error::{Error, Result},
    model::{
        attribute::{Attribute, AttributeValue, NamedArgument, NamedTarget, PermissionSet},
        signature::TypeSig,
        types::{ResolutionScope, TypeKind, TypeScope},
        TypeId,
    },
};
use scroll::Pwrite;
use scroll_buffer::DynamicBuffer;
use std::fmt::Write as _;

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}

fn primitive_tag(sig: &TypeSig) -> Option<u8> {
    use TypeSig::*;
    Some(match sig {
        Boolean => ELEMENT_TYPE_BOOLEAN,
        Char => ELEMENT_TYPE_CHAR,
        Int8 => ELEMENT_TYPE_I1,
        UInt8 => ELEMENT_TYPE_U1,
        Int16 => ELEMENT_TYPE_I2,
        UInt16 => ELEMENT_TYPE_U2,
        Int32 => ELEMENT_TYPE_I4,
        UInt32 => ELEMENT_TYPE_U4,
        Int64 => ELEMENT_TYPE_I8,
        UInt64 => ELEMENT_TYPE_U8,
        Float32 => ELEMENT_TYPE_R4,
        Float64 => ELEMENT_TYPE_R8,
        String => ELEMENT_TYPE_STRING,
        _ => return None,
    })
}

/// Whether a value is written exactly as a parameter of primitive type `declared` expects.
fn primitive_matches(declared: &TypeSig, value: &AttributeValue) -> bool {
    use AttributeValue as V;
    matches!(
        (declared, value),
        (TypeSig::Boolean, V::Boolean(_))
            | (TypeSig::Char, V::Char(_))
            | (TypeSig::Int8, V::Int8(_))
            | (TypeSig::UInt8, V::UInt8(_))
            | (TypeSig::Int16, V::Int16(_))
            | (TypeSig::UInt16, V::UInt16(_))
            | (TypeSig::Int32, V::Int32(_))
            | (TypeSig::UInt32, V::UInt32(_))
            | (TypeSig::Int64, V::Int64(_))
            | (TypeSig::UInt64, V::UInt64(_))
            | (TypeSig::Float32, V::Float32(_))
            | (TypeSig::Float64, V::Float64(_))
            | (TypeSig::String, V::String(_))
    )
}

fn is_integral(value: &AttributeValue) -> bool {
    use AttributeValue::*;
    matches!(
        value,
        Boolean(_) | Char(_) | Int8(_) | UInt8(_) | Int16(_) | UInt16(_) | Int32(_) | UInt32(_) | Int64(_) | UInt64(_)
    )
}

fn mismatch(declared: &TypeSig, value: &AttributeValue) -> Error {
    Error::Encoding(format!("{:?} cannot be written as a {:?} argument", value, declared))
}

impl Session<'_> {
    /// `Namespace.Outer+Inner`, without any assembly qualification.
    fn nested_type_name(&self, id: TypeId) -> Result<String> {
        let node = self.module.type_node(id)?;
        Ok(match node.declaring_type {
            Some(declaring) => format!("{}+{}", self.nested_type_name(declaring)?, node.name),
            None => node.type_name(),
        })
    }

    fn assembly_qualifier(&self, id: TypeId) -> Result<Option<String>> {
        let mut node = self.module.type_node(id)?;
        while let Some(declaring) = node.declaring_type {
            node = self.module.type_node(declaring)?;
        }

        let reference = match node.scope {
            TypeScope::External(ResolutionScope::Assembly(a)) => {
                self.module.assembly_references.get(a.0).ok_or_else(|| {
                    Error::UnresolvedReference(format!("assembly reference {} is out of range", a.0))
                })?
            }
            TypeScope::Unresolved => {
                return Err(Error::UnresolvedReference(format!(
                    "type {} has no resolution scope",
                    node.type_name()
                )))
            }
            _ => return Ok(None),
        };

        let v = reference.version;
        let key = match &reference.public_key_or_token {
            Some(k) if reference.has_full_public_key => format!("PublicKey={}", hex(k)),
            Some(k) if !k.is_empty() => format!("PublicKeyToken={}", hex(k)),
            _ => "PublicKeyToken=null".to_string(),
        };

        Ok(Some(format!(
            "{}, Version={}.{}.{}.{}, Culture={}, {}",
            reference.name,
            v.major,
            v.minor,
            v.build,
            v.revision,
            reference.culture.as_deref().unwrap_or("neutral"),
            key
        )))
    }

    /// The reflection-style name used for `System.Type` arguments and enum types.
    pub(super) fn serialized_type_name(&self, sig: &TypeSig) -> Result<String> {
        let (base, qualifier_of) = match sig.unmodified() {
            TypeSig::Named(id) => (self.nested_type_name(*id)?, Some(*id)),
            TypeSig::GenericInstance(id, arguments) => {
                let mut name = self.nested_type_name(*id)?;
                name.push('[');
                for (i, a) in arguments.iter().enumerate() {
                    if i > 0 {
                        name.push(',');
                    }
                    name.push('[');
                    name.push_str(&self.serialized_type_name(a)?);
                    name.push(']');
                }
                name.push(']');
                (name, Some(*id))
            }
            TypeSig::Vector(element) => return self.suffixed(element, "[]"),
            TypeSig::Array(element, shape) => {
                let commas = ",".repeat(shape.rank.saturating_sub(1) as usize);
                return self.suffixed(element, &format!("[{}]", commas));
            }
            TypeSig::Pointer(Some(inner)) => return self.suffixed(inner, "*"),
            TypeSig::Reference(inner) => return self.suffixed(inner, "&"),
            other => match other.primitive_name() {
                Some(name) => (format!("System.{}", name), None),
                None => {
                    return Err(Error::Encoding(format!(
                        "{:?} has no serialized type name",
                        other
                    )))
                }
            },
        };

        Ok(match qualifier_of.map(|id| self.assembly_qualifier(id)).transpose()?.flatten() {
            Some(q) => format!("{}, {}", base, q),
            None => base,
        })
    }

    // element suffixes go before the assembly qualifier
    fn suffixed(&self, element: &TypeSig, suffix: &str) -> Result<String> {
        let name = self.serialized_type_name(element)?;
        Ok(match name.split_once(", ") {
            Some((base, qualifier)) if !matches!(element.unmodified(), TypeSig::GenericInstance(..)) => {
                format!("{}{}, {}", base, suffix, qualifier)
            }
            _ => format!("{}{}", name, suffix),
        })
    }

    fn enum_tag(&self, buf: &mut DynamicBuffer, offset: &mut usize, id: TypeId) -> Result<()> {
        buf.gwrite_with(CA_ENUM, offset, scroll::LE)?;
        let name = self.serialized_type_name(&TypeSig::Named(id))?;
        buf.gwrite(SerString(Some(name.as_str())), offset)?;
        Ok(())
    }

    /// The FieldOrPropType encoding of a declared argument type.
    fn type_tag(&self, buf: &mut DynamicBuffer, offset: &mut usize, sig: &TypeSig) -> Result<()> {
        let sig = sig.unmodified();
        if let Some(tag) = primitive_tag(sig) {
            buf.gwrite_with(tag, offset, scroll::LE)?;
            return Ok(());
        }

        match sig {
            TypeSig::Object => {
                buf.gwrite_with(CA_BOXED, offset, scroll::LE)?;
            }
            TypeSig::Vector(element) => {
                buf.gwrite_with(ELEMENT_TYPE_SZARRAY, offset, scroll::LE)?;
                self.type_tag(buf, offset, element)?;
            }
            TypeSig::Named(id) => {
                let node = self.module.type_node(*id)?;
                if node.kind == TypeKind::Enum {
                    self.enum_tag(buf, offset, *id)?;
                } else if node.type_name() == "System.Type" {
                    buf.gwrite_with(CA_TYPE, offset, scroll::LE)?;
                } else {
                    return Err(Error::Encoding(format!(
                        "{} cannot be used as a custom attribute argument type",
                        node.type_name()
                    )));
                }
            }
            other => {
                return Err(Error::Encoding(format!(
                    "{:?} cannot be used as a custom attribute argument type",
                    other
                )))
            }
        }
        Ok(())
    }

    /// The type tag carried by a value boxed as `object`.
    fn value_tag(&self, buf: &mut DynamicBuffer, offset: &mut usize, value: &AttributeValue) -> Result<()> {
        use AttributeValue::*;
        let tag = match value {
            Boolean(_) => ELEMENT_TYPE_BOOLEAN,
            Char(_) => ELEMENT_TYPE_CHAR,
            Int8(_) => ELEMENT_TYPE_I1,
            UInt8(_) => ELEMENT_TYPE_U1,
            Int16(_) => ELEMENT_TYPE_I2,
            UInt16(_) => ELEMENT_TYPE_U2,
            Int32(_) => ELEMENT_TYPE_I4,
            UInt32(_) => ELEMENT_TYPE_U4,
            Int64(_) => ELEMENT_TYPE_I8,
            UInt64(_) => ELEMENT_TYPE_U8,
            Float32(_) => ELEMENT_TYPE_R4,
            Float64(_) => ELEMENT_TYPE_R8,
            String(_) => ELEMENT_TYPE_STRING,
            Type(_) => CA_TYPE,
            Enum(id, _) => return self.enum_tag(buf, offset, *id),
            Array(element, _) => {
                buf.gwrite_with(ELEMENT_TYPE_SZARRAY, offset, scroll::LE)?;
                return self.type_tag(buf, offset, element);
            }
        };
        buf.gwrite_with(tag, offset, scroll::LE)?;
        Ok(())
    }

    fn value(&self, buf: &mut DynamicBuffer, offset: &mut usize, value: &AttributeValue) -> Result<()> {
        use AttributeValue::*;
        match value {
            Boolean(b) => buf.gwrite_with(u8::from(*b), offset, scroll::LE)?,
            Char(c) => buf.gwrite_with(*c, offset, scroll::LE)?,
            Int8(v) => buf.gwrite_with(*v as u8, offset, scroll::LE)?,
            UInt8(v) => buf.gwrite_with(*v, offset, scroll::LE)?,
            Int16(v) => buf.gwrite_with(*v as u16, offset, scroll::LE)?,
            UInt16(v) => buf.gwrite_with(*v, offset, scroll::LE)?,
            Int32(v) => buf.gwrite_with(*v as u32, offset, scroll::LE)?,
            UInt32(v) => buf.gwrite_with(*v, offset, scroll::LE)?,
            Int64(v) => buf.gwrite_with(*v as u64, offset, scroll::LE)?,
            UInt64(v) => buf.gwrite_with(*v, offset, scroll::LE)?,
            Float32(v) => buf.gwrite_with(v.to_bits(), offset, scroll::LE)?,
            Float64(v) => buf.gwrite_with(v.to_bits(), offset, scroll::LE)?,
            String(s) => buf.gwrite(SerString(s.as_deref()), offset)?,
            Type(t) => match t {
                Some(sig) => {
                    let name = self.serialized_type_name(sig)?;
                    buf.gwrite(SerString(Some(name.as_str())), offset)?
                }
                None => buf.gwrite(SerString(None), offset)?,
            },
            Enum(id, underlying) => return self.enum_value(buf, offset, *id, underlying),
            Array(element, items) => return self.array(buf, offset, element, items.as_deref()),
        };
        Ok(())
    }

    /// An enum argument is its underlying value, which must be integral and, for
    /// enums defined here, of the type of the instance field.
    fn enum_value(
        &self,
        buf: &mut DynamicBuffer,
        offset: &mut usize,
        id: TypeId,
        underlying: &AttributeValue,
    ) -> Result<()> {
        let node = self.module.type_node(id)?;
        if node.kind != TypeKind::Enum {
            return Err(Error::Encoding(format!("{} is not an enum", node.type_name())));
        }

        let declared = node.fields.iter().find(|f| !f.static_member).map(|f| f.field_type.unmodified());
        let matches = match declared {
            Some(declared) => primitive_matches(declared, underlying),
            None => is_integral(underlying),
        };
        if !matches {
            return Err(Error::Encoding(format!(
                "{:?} is not a valid value of enum {}",
                underlying,
                node.type_name()
            )));
        }

        self.value(buf, offset, underlying)
    }

    fn array(
        &self,
        buf: &mut DynamicBuffer,
        offset: &mut usize,
        element: &TypeSig,
        items: Option<&[AttributeValue]>,
    ) -> Result<()> {
        match items {
            None => {
                buf.gwrite_with(u32::MAX, offset, scroll::LE)?;
            }
            Some(items) => {
                buf.gwrite_with(items.len() as u32, offset, scroll::LE)?;
                for i in items {
                    self.fixed_argument(buf, offset, element, i)?;
                }
            }
        }
        Ok(())
    }

    /// Writes `value` for a parameter declared as `declared`, rejecting values of another type.
    fn fixed_argument(
        &self,
        buf: &mut DynamicBuffer,
        offset: &mut usize,
        declared: &TypeSig,
        value: &AttributeValue,
    ) -> Result<()> {
        let declared = declared.unmodified();
        match (declared, value) {
            (TypeSig::Object, value) => {
                self.value_tag(buf, offset, value)?;
                self.value(buf, offset, value)
            }
            (TypeSig::Vector(element), AttributeValue::Array(items_type, items)) => {
                if items_type.unmodified() != element.unmodified() {
                    return Err(mismatch(declared, value));
                }
                self.array(buf, offset, element, items.as_deref())
            }
            (TypeSig::Named(id), value) => {
                let node = self.module.type_node(*id)?;
                match value {
                    AttributeValue::Enum(e, underlying) if e == id && node.kind == TypeKind::Enum => {
                        self.enum_value(buf, offset, *e, underlying)
                    }
                    AttributeValue::Type(_) if node.type_name() == "System.Type" => self.value(buf, offset, value),
                    _ => Err(mismatch(declared, value)),
                }
            }
            (declared, value) if primitive_matches(declared, value) => self.value(buf, offset, value),
            (declared, value) => Err(mismatch(declared, value)),
        }
    }

    fn named_arguments(&self, buf: &mut DynamicBuffer, offset: &mut usize, named: &[NamedArgument]) -> Result<()> {
        for n in named {
            let tag = match n.target {
                NamedTarget::Field => CA_FIELD,
                NamedTarget::Property => CA_PROPERTY,
            };
            buf.gwrite_with(tag, offset, scroll::LE)?;
            self.type_tag(buf, offset, &n.argument_type)?;
            buf.gwrite(SerString(Some(n.name.as_str())), offset)?;
            self.fixed_argument(buf, offset, &n.argument_type, &n.value)?;
        }
        Ok(())
    }

    pub(super) fn attribute_blob(&self, attribute: &Attribute) -> Result<Vec<u8>> {
        let constructor = self.module.method(attribute.constructor.method)?;
        let parameters = &constructor.signature.parameters;
        if parameters.len() != attribute.arguments.len() {
            return Err(Error::Encoding(format!(
                "attribute constructor takes {} arguments, {} given",
                parameters.len(),
                attribute.arguments.len()
            )));
        }
        let num_named = u16::try_from(attribute.named.len())
            .map_err(|_| Error::Encoding(format!("{} named arguments", attribute.named.len())))?;

        let mut buffer = DynamicBuffer::with_increment(8);
        let offset = &mut 0;

        buffer.gwrite_with(CA_PROLOG, offset, scroll::LE)?;
        for (declared, value) in parameters.iter().zip(&attribute.arguments) {
            self.fixed_argument(&mut buffer, offset, declared, value)?;
        }

        buffer.gwrite_with(num_named, offset, scroll::LE)?;
        self.named_arguments(&mut buffer, offset, &attribute.named)?;

        Ok(buffer.into_vec())
    }

    pub(super) fn permission_set_blob(&self, set: &PermissionSet) -> Result<Vec<u8>> {
        let attributes = match set {
            PermissionSet::Raw(bytes) => return Ok(bytes.clone()),
            PermissionSet::Attributes(a) => a,
        };

        let mut buffer = DynamicBuffer::with_increment(8);
        let offset = &mut 0;

        buffer.gwrite_with(SECURITY_SET_PREFIX, offset, scroll::LE)?;
        buffer.gwrite(Unsigned(attributes.len() as u32), offset)?;
        for a in attributes {
            let name = self.serialized_type_name(&TypeSig::Named(a.attribute_type))?;
            buffer.gwrite(SerString(Some(name.as_str())), offset)?;

            let mut properties = DynamicBuffer::with_increment(8);
            let properties_offset = &mut 0;
            properties.gwrite(Unsigned(a.named.len() as u32), properties_offset)?;
            self.named_arguments(&mut properties, properties_offset, &a.named)?;

            let properties = properties.get();
            buffer.gwrite(Unsigned(properties.len() as u32), offset)?;
            buffer.gwrite(properties, offset)?;
        }

        Ok(buffer.into_vec())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        emit::{Session, WriteOptions},
        model::{attribute::*, members::*, module::*, signature::*, types::*, AssemblyRefId, TypeId},
        Error,
    };

    fn corlib_module() -> (Module, TypeId, AssemblyRefId) {
        let mut module = Module::new("test.dll");
        let corlib = module.push_assembly_reference(AssemblyReference {
            public_key_or_token: Some(vec![0xb7, 0x7a, 0x5c, 0x56, 0x19, 0x34, 0xe0, 0x89]),
            ..AssemblyReference::new("mscorlib", Version::new(4, 0, 0, 0))
        });
        let attribute = module.push_type(TypeNode::external(
            Some("System"),
            "ObsoleteAttribute",
            TypeKind::Class,
            ResolutionScope::Assembly(corlib),
        ));
        (module, attribute, corlib)
    }

    #[test]
    fn string_and_bool_arguments() -> Result<(), Box<dyn std::error::Error>> {
        let (mut module, obsolete, _) = corlib_module();
        let ctor = module.push_method(
            obsolete,
            Method::constructor(vec![TypeSig::String, TypeSig::Boolean], None),
        );

        let options = WriteOptions::default();
        let session = Session::new(&module, &options);

        let attribute = Attribute::new(
            ctor,
            vec![
                AttributeValue::String(Some("old".to_string())),
                AttributeValue::Boolean(true),
            ],
        );
        assert_eq!(
            session.attribute_blob(&attribute)?,
            [0x01, 0x00, 0x03, b'o', b'l', b'd', 0x01, 0x00, 0x00]
        );
        Ok(())
    }

    #[test]
    fn boxed_and_named_arguments() -> Result<(), Box<dyn std::error::Error>> {
        let (mut module, obsolete, _) = corlib_module();
        let ctor = module.push_method(obsolete, Method::constructor(vec![TypeSig::Object], None));

        let options = WriteOptions::default();
        let session = Session::new(&module, &options);

        let attribute = Attribute {
            named: vec![NamedArgument {
                target: NamedTarget::Property,
                name: "X".to_string(),
                argument_type: TypeSig::Int32,
                value: AttributeValue::Int32(2),
            }],
            ..Attribute::new(ctor, vec![AttributeValue::Int16(-1)])
        };
        assert_eq!(
            session.attribute_blob(&attribute)?,
            [
                0x01, 0x00, // prolog
                0x06, 0xFF, 0xFF, // boxed int16
                0x01, 0x00, // one named argument
                0x54, 0x08, 0x01, b'X', 0x02, 0x00, 0x00, 0x00,
            ]
        );
        Ok(())
    }

    #[test]
    fn qualified_names() -> Result<(), Box<dyn std::error::Error>> {
        let (mut module, obsolete, _) = corlib_module();
        let outer = module.push_type(TypeNode::new(Some("Demo"), "Outer", TypeKind::Class));
        let inner = module.push_nested_type(outer, TypeNode::new(None, "Inner", TypeKind::Class));

        let options = WriteOptions::default();
        let session = Session::new(&module, &options);

        assert_eq!(session.serialized_type_name(&TypeSig::Named(inner))?, "Demo.Outer+Inner");
        assert_eq!(
            session.serialized_type_name(&TypeSig::vector(TypeSig::Named(obsolete)))?,
            "System.ObsoleteAttribute[], mscorlib, Version=4.0.0.0, Culture=neutral, PublicKeyToken=b77a5c561934e089"
        );
        assert_eq!(session.serialized_type_name(&TypeSig::Int32)?, "System.Int32");
        Ok(())
    }

    #[test]
    fn null_values() -> Result<(), Box<dyn std::error::Error>> {
        let (mut module, obsolete, _) = corlib_module();
        let ctor = module.push_method(
            obsolete,
            Method::constructor(vec![TypeSig::String, TypeSig::vector(TypeSig::Int32)], None),
        );

        let options = WriteOptions::default();
        let session = Session::new(&module, &options);

        let attribute = Attribute::new(
            ctor,
            vec![
                AttributeValue::String(None),
                AttributeValue::Array(TypeSig::Int32, None),
            ],
        );
        assert_eq!(
            session.attribute_blob(&attribute)?,
            [0x01, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00]
        );
        Ok(())
    }

    #[test]
    fn mismatched_argument_types() -> Result<(), Box<dyn std::error::Error>> {
        let (mut module, obsolete, _) = corlib_module();
        let int_ctor = module.push_method(obsolete, Method::constructor(vec![TypeSig::Int32], None));
        let array_ctor = module.push_method(
            obsolete,
            Method::constructor(vec![TypeSig::vector(TypeSig::Int32)], None),
        );

        let options = WriteOptions::default();
        let session = Session::new(&module, &options);

        let narrow = Attribute::new(int_ctor, vec![AttributeValue::Int16(1)]);
        assert!(matches!(session.attribute_blob(&narrow), Err(Error::Encoding(_))));

        let wrong_element = Attribute::new(
            array_ctor,
            vec![AttributeValue::Array(TypeSig::Int64, Some(vec![AttributeValue::Int64(1)]))],
        );
        assert!(matches!(session.attribute_blob(&wrong_element), Err(Error::Encoding(_))));

        let wrong_item = Attribute::new(
            array_ctor,
            vec![AttributeValue::Array(TypeSig::Int32, Some(vec![AttributeValue::String(None)]))],
        );
        assert!(matches!(session.attribute_blob(&wrong_item), Err(Error::Encoding(_))));
        Ok(())
    }

    #[test]
    fn enum_arguments_use_the_underlying_type() -> Result<(), Box<dyn std::error::Error>> {
        let (mut module, obsolete, _) = corlib_module();
        let color = module.push_type(TypeNode::new(Some("Demo"), "Color", TypeKind::Enum));
        module.push_field(color, Field::new("value__", TypeSig::UInt8));
        let ctor = module.push_method(obsolete, Method::constructor(vec![TypeSig::Named(color)], None));

        let options = WriteOptions::default();
        let session = Session::new(&module, &options);

        let good = Attribute::new(ctor, vec![AttributeValue::Enum(color, Box::new(AttributeValue::UInt8(2)))]);
        assert_eq!(session.attribute_blob(&good)?, [0x01, 0x00, 0x02, 0x00, 0x00]);

        let wide = Attribute::new(ctor, vec![AttributeValue::Enum(color, Box::new(AttributeValue::Int32(2)))]);
        assert!(matches!(session.attribute_blob(&wide), Err(Error::Encoding(_))));

        let bare = Attribute::new(ctor, vec![AttributeValue::UInt8(2)]);
        assert!(matches!(session.attribute_blob(&bare), Err(Error::Encoding(_))));
        Ok(())
    }
}
