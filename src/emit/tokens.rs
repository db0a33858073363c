//! Row allocation for definitions and lazily created reference rows.

use super::Session;
use crate::{
    binary::{
        index::{self, Token},
        table::*,
    },
    error::{Error, Result},
    model::{
        members::{FieldRef, MethodRef},
        signature::{MethodSignature, TypeSig},
        types::{ResolutionScope, TypeScope},
        AssemblyRefId, EventId, FieldId, MethodId, ModuleRefId, PropertyId, TypeId,
    },
    utils::hash,
};
use std::collections::HashMap;
use tracing::trace;

/// Whether a type must be referenced through a TypeSpec row. Named types and
/// the primitives of the core library have TypeDef or TypeRef rows of their own.
pub fn is_structural(sig: &TypeSig) -> bool {
    !matches!(sig, TypeSig::Named(_)) && sig.primitive_name().is_none()
}

/// Row numbers handed out during one write. All rows are 1-based.
#[derive(Debug, Default)]
pub(crate) struct Tokens {
    pub type_order: Vec<TypeId>,
    pub type_defs: HashMap<TypeId, usize>,
    /// First Field and MethodDef row of each defined type.
    pub type_lists: HashMap<TypeId, (usize, usize)>,
    pub fields: HashMap<FieldId, usize>,
    pub methods: HashMap<MethodId, usize>,
    /// First Param row of each method, and the number of rows it owns.
    pub params: HashMap<MethodId, (usize, usize)>,
    pub properties: HashMap<PropertyId, usize>,
    pub events: HashMap<EventId, usize>,

    type_refs: HashMap<TypeId, usize>,
    primitive_refs: HashMap<&'static str, usize>,
    type_specs: HashMap<u64, Vec<usize>>,
    member_refs: HashMap<(index::MemberRefParent, index::String, index::Blob), usize>,
    method_specs: HashMap<u64, Vec<usize>>,
    stand_alone_sigs: HashMap<index::Blob, usize>,
    assembly_refs: HashMap<AssemblyRefId, usize>,
    module_refs: HashMap<ModuleRefId, usize>,
}

fn token_of(coded: index::MethodDefOrRef) -> Result<Token> {
    match coded {
        index::MethodDefOrRef::MethodDef(row) => Ok(Token::new(Kind::MethodDef, row)),
        index::MethodDefOrRef::MemberRef(row) => Ok(Token::new(Kind::MemberRef, row)),
        index::MethodDefOrRef::Null => Err(Error::InvariantViolation("null method token".to_string())),
    }
}

impl Session<'_> {
    pub(super) fn type_def(&self, id: TypeId) -> Result<usize> {
        self.tokens
            .type_defs
            .get(&id)
            .copied()
            .ok_or_else(|| Error::InvariantViolation(format!("type {:?} was not discovered", id)))
    }

    pub(super) fn field_def(&self, id: FieldId) -> Result<usize> {
        self.tokens
            .fields
            .get(&id)
            .copied()
            .ok_or_else(|| Error::InvariantViolation(format!("field {:?} was not discovered", id)))
    }

    pub(super) fn method_def(&self, id: MethodId) -> Result<usize> {
        self.tokens
            .methods
            .get(&id)
            .copied()
            .ok_or_else(|| Error::InvariantViolation(format!("method {:?} was not discovered", id)))
    }

    pub(super) fn assembly_ref(&mut self, id: AssemblyRefId) -> Result<usize> {
        if let Some(&row) = self.tokens.assembly_refs.get(&id) {
            return Ok(row);
        }

        let reference = self.module.assembly_references.get(id.0).ok_or_else(|| {
            Error::UnresolvedReference(format!("assembly reference {} is out of range", id.0))
        })?;

        let public_key_or_token = match &reference.public_key_or_token {
            Some(k) => self.blobs.write(k)?,
            None => index::Blob(0),
        };
        let hash_value = match &reference.hash_value {
            Some(h) => self.blobs.write(h)?,
            None => index::Blob(0),
        };
        let culture = match &reference.culture {
            Some(c) => self.strings.write(c),
            None => index::String(0),
        };

        self.tables.assembly_ref.push(AssemblyRef {
            major_version: reference.version.major,
            minor_version: reference.version.minor,
            build_number: reference.version.build,
            revision_number: reference.version.revision,
            flags: crate::utils::build_bitmask!(
                reference.has_full_public_key => 0x0001,
                reference.retargetable => 0x0100,
            ),
            public_key_or_token,
            name: self.strings.write(&reference.name),
            culture,
            hash_value,
        });

        let row = self.tables.assembly_ref.len();
        trace!(name = %reference.name, row, "allocated AssemblyRef");
        self.tokens.assembly_refs.insert(id, row);
        Ok(row)
    }

    pub(super) fn module_ref(&mut self, id: ModuleRefId) -> Result<usize> {
        if let Some(&row) = self.tokens.module_refs.get(&id) {
            return Ok(row);
        }

        let reference = self
            .module
            .module_references
            .get(id.0)
            .ok_or_else(|| Error::UnresolvedReference(format!("module reference {} is out of range", id.0)))?;

        self.tables.module_ref.push(ModuleRef {
            name: self.strings.write(&reference.name),
        });

        let row = self.tables.module_ref.len();
        trace!(name = %reference.name, row, "allocated ModuleRef");
        self.tokens.module_refs.insert(id, row);
        Ok(row)
    }

    pub(super) fn type_ref(&mut self, id: TypeId) -> Result<usize> {
        if let Some(&row) = self.tokens.type_refs.get(&id) {
            return Ok(row);
        }

        let module = self.module;
        let node = module.type_node(id)?;

        let resolution_scope = match (node.declaring_type, node.scope) {
            (_, TypeScope::Unresolved) => {
                return Err(Error::UnresolvedReference(format!(
                    "type {} has no resolution scope",
                    node.type_name()
                )))
            }
            (_, TypeScope::Defined) => {
                return Err(Error::InvariantViolation(format!(
                    "type {} is defined in this module",
                    node.type_name()
                )))
            }
            (Some(declaring), TypeScope::External(_)) => {
                if module.type_node(declaring)?.is_defined() {
                    return Err(Error::InvariantViolation(format!(
                        "external type {} is nested in a defined type",
                        node.type_name()
                    )));
                }
                index::ResolutionScope::TypeRef(self.type_ref(declaring)?)
            }
            (None, TypeScope::External(ResolutionScope::Assembly(a))) => {
                index::ResolutionScope::AssemblyRef(self.assembly_ref(a)?)
            }
            (None, TypeScope::External(ResolutionScope::Module(m))) => {
                index::ResolutionScope::ModuleRef(self.module_ref(m)?)
            }
        };

        let type_namespace = match &node.namespace {
            Some(ns) => self.strings.write(ns),
            None => index::String(0),
        };
        self.tables.type_ref.push(TypeRef {
            resolution_scope,
            type_name: self.strings.write(&node.name),
            type_namespace,
        });

        let row = self.tables.type_ref.len();
        trace!(name = %node.type_name(), row, "allocated TypeRef");
        self.tokens.type_refs.insert(id, row);
        Ok(row)
    }

    /// The TypeDef or TypeRef row of a named type.
    pub(super) fn named_type(&mut self, id: TypeId) -> Result<index::TypeDefOrRef> {
        if self.module.type_node(id)?.is_defined() {
            Ok(index::TypeDefOrRef::TypeDef(self.type_def(id)?))
        } else {
            Ok(index::TypeDefOrRef::TypeRef(self.type_ref(id)?))
        }
    }

    pub(super) fn type_spec(&mut self, sig: &TypeSig) -> Result<usize> {
        let blob = self.type_sig_blob(sig)?;
        let key = hash(&blob);
        let signature = self.blobs.write(&blob)?;

        if let Some(rows) = self.tokens.type_specs.get(&key) {
            if let Some(&row) = rows.iter().find(|&&r| self.tables.type_spec[r - 1].signature == signature) {
                return Ok(row);
            }
        }

        self.tables.type_spec.push(TypeSpec { signature });
        let row = self.tables.type_spec.len();
        trace!(row, "allocated TypeSpec");
        self.tokens.type_specs.entry(key).or_default().push(row);
        Ok(row)
    }

    /// `System.<name>` as a row of its own: the module's own node for it when it has one,
    /// otherwise a TypeRef into the core library.
    fn primitive_type(&mut self, name: &'static str) -> Result<index::TypeDefOrRef> {
        let module = self.module;
        let node = module.types.iter().position(|t| {
            t.declaring_type.is_none() && t.namespace.as_deref() == Some("System") && t.name == name
        });
        if let Some(id) = node {
            return self.named_type(TypeId(id));
        }

        if let Some(&row) = self.tokens.primitive_refs.get(name) {
            return Ok(index::TypeDefOrRef::TypeRef(row));
        }

        let core_library = module.core_library.ok_or_else(|| {
            Error::UnresolvedReference(format!("System.{} needs a core library reference", name))
        })?;
        let resolution_scope = index::ResolutionScope::AssemblyRef(self.assembly_ref(core_library)?);

        self.tables.type_ref.push(TypeRef {
            resolution_scope,
            type_name: self.strings.write(name),
            type_namespace: self.strings.write("System"),
        });

        let row = self.tables.type_ref.len();
        trace!(name, row, "allocated core library TypeRef");
        self.tokens.primitive_refs.insert(name, row);
        Ok(index::TypeDefOrRef::TypeRef(row))
    }

    pub(super) fn type_token(&mut self, sig: &TypeSig) -> Result<index::TypeDefOrRef> {
        match sig {
            TypeSig::Named(id) => self.named_type(*id),
            other => match other.primitive_name() {
                Some(name) => self.primitive_type(name),
                None => Ok(index::TypeDefOrRef::TypeSpec(self.type_spec(other)?)),
            },
        }
    }

    pub(super) fn type_metadata_token(&mut self, sig: &TypeSig) -> Result<Token> {
        Ok(match self.type_token(sig)? {
            index::TypeDefOrRef::TypeDef(r) => Token::new(Kind::TypeDef, r),
            index::TypeDefOrRef::TypeRef(r) => Token::new(Kind::TypeRef, r),
            index::TypeDefOrRef::TypeSpec(r) => Token::new(Kind::TypeSpec, r),
            index::TypeDefOrRef::Null => return Err(Error::InvariantViolation("null type token".to_string())),
        })
    }

    fn member_ref(&mut self, class: index::MemberRefParent, name: &str, signature: &[u8]) -> Result<usize> {
        let name = self.strings.write(name);
        let signature = self.blobs.write(signature)?;

        let key = (class, name, signature);
        if let Some(&row) = self.tokens.member_refs.get(&key) {
            return Ok(row);
        }

        self.tables.member_ref.push(MemberRef { class, name, signature });
        let row = self.tables.member_ref.len();
        trace!(row, "allocated MemberRef");
        self.tokens.member_refs.insert(key, row);
        Ok(row)
    }

    /// The parent a reference row needs, or `None` when the definition row can be used directly.
    fn member_parent(&mut self, parent: Option<&TypeSig>, owner: TypeId) -> Result<Option<index::MemberRefParent>> {
        let parent = match parent {
            Some(TypeSig::Named(id)) if *id == owner => None,
            other => other,
        };

        Ok(match parent {
            Some(sig) if is_structural(sig) => Some(index::MemberRefParent::TypeSpec(self.type_spec(sig)?)),
            Some(sig) => Some(match self.type_token(sig)? {
                index::TypeDefOrRef::TypeDef(r) => index::MemberRefParent::TypeDef(r),
                index::TypeDefOrRef::TypeRef(r) => index::MemberRefParent::TypeRef(r),
                index::TypeDefOrRef::TypeSpec(r) => index::MemberRefParent::TypeSpec(r),
                index::TypeDefOrRef::Null => {
                    return Err(Error::InvariantViolation("null member parent".to_string()))
                }
            }),
            _ if self.module.type_node(owner)?.is_defined() => None,
            _ => Some(index::MemberRefParent::TypeRef(self.type_ref(owner)?)),
        })
    }

    /// A MethodDef or MemberRef for the method, ignoring generic method arguments.
    pub(super) fn method_def_or_ref(&mut self, method: &MethodRef) -> Result<index::MethodDefOrRef> {
        let module = self.module;
        let definition = module.method(method.method)?;

        let parent = self.member_parent(method.parent.as_ref(), method.method.parent_type)?;

        if !method.vararg_types.is_empty() {
            let parent = match parent {
                Some(p) => p,
                None => index::MemberRefParent::MethodDef(self.method_def(method.method)?),
            };
            let signature = self.method_sig(
                &definition.signature,
                definition.generic_parameters.len(),
                &method.vararg_types,
            )?;
            return Ok(index::MethodDefOrRef::MemberRef(self.member_ref(
                parent,
                &definition.name,
                &signature,
            )?));
        }

        match parent {
            Some(parent) => {
                let signature = self.method_sig(&definition.signature, definition.generic_parameters.len(), &[])?;
                Ok(index::MethodDefOrRef::MemberRef(self.member_ref(
                    parent,
                    &definition.name,
                    &signature,
                )?))
            }
            None => Ok(index::MethodDefOrRef::MethodDef(self.method_def(method.method)?)),
        }
    }

    pub(super) fn method_token(&mut self, method: &MethodRef) -> Result<Token> {
        let base = self.method_def_or_ref(method)?;
        if method.generic_arguments.is_empty() {
            return token_of(base);
        }

        let signature = self.method_spec_sig(&method.generic_arguments)?;
        let instantiation = self.blobs.write(&signature)?;
        let key = hash((base, instantiation));

        if let Some(rows) = self.tokens.method_specs.get(&key) {
            if let Some(&row) = rows.iter().find(|&&r| {
                let spec = &self.tables.method_spec[r - 1];
                spec.method == base && spec.instantiation == instantiation
            }) {
                return Ok(Token::new(Kind::MethodSpec, row));
            }
        }

        self.tables.method_spec.push(MethodSpec {
            method: base,
            instantiation,
        });
        let row = self.tables.method_spec.len();
        trace!(row, "allocated MethodSpec");
        self.tokens.method_specs.entry(key).or_default().push(row);
        Ok(Token::new(Kind::MethodSpec, row))
    }

    pub(super) fn field_token(&mut self, field: &FieldRef) -> Result<Token> {
        let module = self.module;
        let definition = module.field(field.field)?;

        match self.member_parent(field.parent.as_ref(), field.field.parent_type)? {
            Some(parent) => {
                let signature = self.field_sig(definition)?;
                let row = self.member_ref(parent, &definition.name, &signature)?;
                Ok(Token::new(Kind::MemberRef, row))
            }
            None => Ok(Token::new(Kind::Field, self.field_def(field.field)?)),
        }
    }

    /// A runtime-provided method of a general array type, such as `Get`, `Set`,
    /// `Address` or `.ctor`.
    pub(super) fn array_method(&mut self, array: &TypeSig, name: &str, signature: &MethodSignature) -> Result<Token> {
        let parent = index::MemberRefParent::TypeSpec(self.type_spec(array)?);
        let signature = self.method_sig(signature, 0, &[])?;
        Ok(Token::new(Kind::MemberRef, self.member_ref(parent, name, &signature)?))
    }

    pub(super) fn stand_alone_sig(&mut self, signature: &[u8]) -> Result<Token> {
        let signature = self.blobs.write(signature)?;
        if let Some(&row) = self.tokens.stand_alone_sigs.get(&signature) {
            return Ok(Token::new(Kind::StandAloneSig, row));
        }

        self.tables.stand_alone_sig.push(StandAloneSig { signature });
        let row = self.tables.stand_alone_sig.len();
        trace!(row, "allocated StandAloneSig");
        self.tokens.stand_alone_sigs.insert(signature, row);
        Ok(Token::new(Kind::StandAloneSig, row))
    }

    pub(super) fn user_string(&mut self, value: &str) -> Result<Token> {
        Ok(Token::user_string(self.user_strings.write(value)?))
    }

    pub(super) fn custom_attribute_type(&mut self, constructor: &MethodRef) -> Result<index::CustomAttributeType> {
        if !constructor.generic_arguments.is_empty() {
            return Err(Error::InvariantViolation(
                "attribute constructors cannot be generic methods".to_string(),
            ));
        }
        Ok(match self.method_def_or_ref(constructor)? {
            index::MethodDefOrRef::MethodDef(r) => index::CustomAttributeType::MethodDef(r),
            index::MethodDefOrRef::MemberRef(r) => index::CustomAttributeType::MemberRef(r),
            index::MethodDefOrRef::Null => index::CustomAttributeType::Null,
        })
    }
}
