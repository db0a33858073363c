//! Signature blobs (ECMA-335, II.23.2). Model signatures are resolved to the
//! encodings in [`crate::binary::signature`], allocating reference rows as needed.

use super::Session;
use crate::{
    binary::{
        compressed,
        signature::{self as encoded, *},
    },
    error::{Error, Result},
    model::{
        body::LocalVariable,
        members::{Field, Property},
        signature::{CallingConvention, MethodSignature, TypeSig},
        TypeId,
    },
};
use scroll::{ctx::TryIntoCtx, Pwrite};
use scroll_buffer::DynamicBuffer;

pub(super) fn into_blob(value: impl TryIntoCtx<(), DynamicBuffer, Error = scroll::Error>) -> Result<Vec<u8>> {
    let mut buffer = DynamicBuffer::with_increment(8);
    buffer.pwrite(value, 0)?;
    Ok(buffer.into_vec())
}

// lengths and indices inside a signature are compressed integers
fn count(value: usize) -> Result<u32> {
    if value > compressed::MAX_UNSIGNED as usize {
        return Err(Error::Encoding(format!("{} does not fit in a compressed integer", value)));
    }
    Ok(value as u32)
}

fn element_type(sig: &TypeSig) -> Option<u8> {
    use TypeSig::*;
    Some(match sig {
        Void => ELEMENT_TYPE_VOID,
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
        IntPtr => ELEMENT_TYPE_I,
        UIntPtr => ELEMENT_TYPE_U,
        Object => ELEMENT_TYPE_OBJECT,
        String => ELEMENT_TYPE_STRING,
        TypedReference => ELEMENT_TYPE_TYPEDBYREF,
        _ => return None,
    })
}

impl Session<'_> {
    fn is_value_type(&self, id: TypeId) -> Result<bool> {
        Ok(self.module.type_node(id)?.kind.is_value_type())
    }

    fn custom_mod(&mut self, modifier: TypeId, required: bool) -> Result<CustomMod> {
        Ok(CustomMod {
            required,
            token: self.named_type(modifier)?,
        })
    }

    fn resolve_boxed(&mut self, sig: &TypeSig) -> Result<Box<encoded::Type>> {
        Ok(Box::new(self.resolve_type(sig)?))
    }

    pub(super) fn resolve_type(&mut self, sig: &TypeSig) -> Result<encoded::Type> {
        use encoded::Type;

        if let Some(tag) = element_type(sig) {
            return Ok(Type::Element(tag));
        }

        Ok(match sig {
            TypeSig::Named(id) => {
                let token = self.named_type(*id)?;
                if self.is_value_type(*id)? {
                    Type::ValueType(token)
                } else {
                    Type::Class(token)
                }
            }
            TypeSig::GenericInstance(id, arguments) => {
                count(arguments.len())?;
                Type::GenericInst {
                    value_type: self.is_value_type(*id)?,
                    template: self.named_type(*id)?,
                    arguments: arguments
                        .iter()
                        .map(|a| self.resolve_type(a))
                        .collect::<Result<_>>()?,
                }
            }
            TypeSig::Array(element, shape) => {
                count(shape.rank as usize)?;
                for &s in &shape.sizes {
                    count(s as usize)?;
                }
                Type::Array {
                    element: self.resolve_boxed(element)?,
                    rank: shape.rank,
                    sizes: shape.sizes.clone(),
                    lower_bounds: shape.lower_bounds.clone(),
                }
            }
            TypeSig::Vector(element) => Type::Vector(self.resolve_boxed(element)?),
            TypeSig::Pointer(pointee) => Type::Pointer(match pointee {
                Some(p) => Some(self.resolve_boxed(p)?),
                None => None,
            }),
            TypeSig::Reference(inner) => Type::ByRef(self.resolve_boxed(inner)?),
            TypeSig::Pinned(inner) => Type::Pinned(self.resolve_boxed(inner)?),
            TypeSig::Modified {
                modifier,
                required,
                inner,
            } => Type::Modified(self.custom_mod(*modifier, *required)?, self.resolve_boxed(inner)?),
            TypeSig::TypeParameter(n) => Type::Var(count(*n as usize)?),
            TypeSig::MethodParameter(n) => Type::MVar(count(*n as usize)?),
            TypeSig::FunctionPointer(signature) => Type::FnPtr(Box::new(self.resolve_method(signature, 0, &[])?)),
            primitive => {
                return Err(Error::InvariantViolation(format!(
                    "{:?} has no element type",
                    primitive
                )))
            }
        })
    }

    pub(super) fn type_sig_blob(&mut self, sig: &TypeSig) -> Result<Vec<u8>> {
        let resolved = self.resolve_type(sig)?;
        into_blob(resolved)
    }

    fn resolve_method(
        &mut self,
        signature: &MethodSignature,
        generic_arity: usize,
        varargs: &[TypeSig],
    ) -> Result<MethodSig> {
        let mut calling_convention = match signature.calling_convention {
            CallingConvention::Default => CALL_DEFAULT,
            CallingConvention::Vararg => CALL_VARARG,
            CallingConvention::C => CALL_C,
            CallingConvention::StdCall => CALL_STDCALL,
            CallingConvention::ThisCall => CALL_THISCALL,
            CallingConvention::FastCall => CALL_FASTCALL,
        };
        if signature.instance {
            calling_convention |= CALL_HASTHIS;
        }
        if signature.explicit_this {
            calling_convention |= CALL_EXPLICITTHIS;
        }
        if generic_arity > 0 {
            calling_convention |= CALL_GENERIC;
        }
        count(signature.parameters.len() + varargs.len())?;

        Ok(MethodSig {
            calling_convention,
            generic_arity: count(generic_arity)?,
            return_type: self.resolve_type(&signature.return_type)?,
            params: signature
                .parameters
                .iter()
                .map(|p| self.resolve_type(p))
                .collect::<Result<_>>()?,
            varargs: varargs.iter().map(|v| self.resolve_type(v)).collect::<Result<_>>()?,
        })
    }

    /// A method signature; `varargs` is non-empty only for vararg call sites.
    pub(super) fn method_sig(
        &mut self,
        signature: &MethodSignature,
        generic_arity: usize,
        varargs: &[TypeSig],
    ) -> Result<Vec<u8>> {
        let resolved = self.resolve_method(signature, generic_arity, varargs)?;
        into_blob(resolved)
    }

    pub(super) fn field_sig(&mut self, field: &Field) -> Result<Vec<u8>> {
        let mut modifiers = vec![];
        if field.volatile {
            let is_volatile = self.module.is_volatile.ok_or_else(|| {
                Error::UnresolvedReference(format!(
                    "volatile field {} needs the IsVolatile modifier type",
                    field.name
                ))
            })?;
            modifiers.push(self.custom_mod(is_volatile, true)?);
        }

        let field_type = self.resolve_type(&field.field_type)?;
        into_blob(FieldSig { modifiers, field_type })
    }

    pub(super) fn property_sig(&mut self, property: &Property) -> Result<Vec<u8>> {
        count(property.parameters.len())?;
        let signature = PropertySig {
            has_this: property.instance,
            property_type: self.resolve_type(&property.property_type)?,
            params: property
                .parameters
                .iter()
                .map(|p| self.resolve_type(p))
                .collect::<Result<_>>()?,
        };
        into_blob(signature)
    }

    pub(super) fn local_sig(&mut self, locals: &[LocalVariable]) -> Result<Vec<u8>> {
        count(locals.len())?;
        let locals = locals
            .iter()
            .map(|l| {
                Ok(LocalVar {
                    pinned: l.pinned,
                    var_type: self.resolve_type(&l.variable_type)?,
                })
            })
            .collect::<Result<_>>()?;
        into_blob(LocalVarSig(locals))
    }

    pub(super) fn method_spec_sig(&mut self, arguments: &[TypeSig]) -> Result<Vec<u8>> {
        count(arguments.len())?;
        let arguments = arguments
            .iter()
            .map(|a| self.resolve_type(a))
            .collect::<Result<_>>()?;
        into_blob(encoded::MethodSpec(arguments))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        emit::{Session, WriteOptions},
        model::{module::*, signature::*, types::*},
    };

    #[test]
    fn vector_of_external_class() -> Result<(), Box<dyn std::error::Error>> {
        let mut module = Module::new("test.dll");
        let corlib = module.push_assembly_reference(AssemblyReference::new("mscorlib", Version::new(4, 0, 0, 0)));
        let string_builder = module.push_type(TypeNode::external(
            Some("System.Text"),
            "StringBuilder",
            TypeKind::Class,
            ResolutionScope::Assembly(corlib),
        ));

        let options = WriteOptions::default();
        let mut session = Session::new(&module, &options);

        let blob = session.type_sig_blob(&TypeSig::vector(TypeSig::Named(string_builder)))?;
        // TypeRef row 1 is coded as (1 << 2) | 1
        assert_eq!(blob, [0x1D, 0x12, 0x05]);
        assert_eq!(session.tables.type_ref.len(), 1);
        assert_eq!(session.tables.assembly_ref.len(), 1);
        Ok(())
    }

    #[test]
    fn generic_vararg_method() -> Result<(), Box<dyn std::error::Error>> {
        let module = Module::new("test.dll");
        let options = WriteOptions::default();
        let mut session = Session::new(&module, &options);

        let signature = MethodSignature {
            calling_convention: CallingConvention::Vararg,
            ..MethodSignature::instance(TypeSig::Int32, vec![TypeSig::MethodParameter(0)])
        };
        let blob = session.method_sig(&signature, 1, &[TypeSig::Float64])?;
        assert_eq!(blob, [0x35, 0x01, 0x02, 0x08, 0x1E, 0x00, 0x41, 0x0D]);
        Ok(())
    }

    #[test]
    fn volatile_field_needs_modifier_type() {
        let module = Module::new("test.dll");
        let options = WriteOptions::default();
        let mut session = Session::new(&module, &options);

        let field = crate::model::members::Field {
            volatile: true,
            ..crate::model::members::Field::new("flag", TypeSig::Boolean)
        };
        assert!(matches!(
            session.field_sig(&field),
            Err(crate::Error::UnresolvedReference(_))
        ));
    }

    #[test]
    fn array_shape() -> Result<(), Box<dyn std::error::Error>> {
        let module = Module::new("test.dll");
        let options = WriteOptions::default();
        let mut session = Session::new(&module, &options);

        let shape = ArrayShape {
            rank: 2,
            sizes: vec![3],
            lower_bounds: vec![0, -1],
        };
        let blob = session.type_sig_blob(&TypeSig::array(TypeSig::Float32, shape))?;
        assert_eq!(blob, [0x14, 0x0C, 0x02, 0x01, 0x03, 0x02, 0x00, 0x7F]);
        Ok(())
    }
}
