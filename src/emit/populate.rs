//! Table population in a fixed order once rows and bodies are known.

use super::Session;
use crate::{
    binary::{
        index::{self, Simple, Token},
        signature::*,
        table::*,
    },
    error::{Error, Result},
    model::{
        attribute::{Attribute, SecurityDeclaration},
        members::{Constant as ConstantValue, ParameterInfo},
        module::{EntryPoint, ResourceData, TypeImplementation},
        types::TypeNode,
        AssemblyRefId, EventId, FieldId, MethodId, ModuleRefId, PropertyId, TypeId,
    },
    utils::build_bitmask,
};
use tracing::{debug, warn};

/// Owner of a custom attribute. Rows of sorted tables move while they are
/// populated, so some owners are located by key once their table is final.
#[derive(Debug, Copy, Clone)]
enum Owner {
    Coded(index::HasCustomAttribute),
    InterfaceImpl {
        class: usize,
        interface: index::TypeDefOrRef,
    },
    GenericParam {
        owner: index::TypeOrMethodDef,
        number: u16,
    },
    GenericParamConstraint {
        owner: index::TypeOrMethodDef,
        number: u16,
        constraint: index::TypeDefOrRef,
    },
}

const SEMANTICS_SETTER: u16 = 0x1;
const SEMANTICS_GETTER: u16 = 0x2;
const SEMANTICS_OTHER: u16 = 0x4;
const SEMANTICS_ADD_ON: u16 = 0x8;
const SEMANTICS_REMOVE_ON: u16 = 0x10;
const SEMANTICS_FIRE: u16 = 0x20;

fn constant_blob(value: &ConstantValue) -> (u8, Vec<u8>) {
    use ConstantValue::*;
    match value {
        Boolean(b) => (ELEMENT_TYPE_BOOLEAN, vec![u8::from(*b)]),
        Char(c) => (ELEMENT_TYPE_CHAR, c.to_le_bytes().to_vec()),
        Int8(v) => (ELEMENT_TYPE_I1, v.to_le_bytes().to_vec()),
        UInt8(v) => (ELEMENT_TYPE_U1, v.to_le_bytes().to_vec()),
        Int16(v) => (ELEMENT_TYPE_I2, v.to_le_bytes().to_vec()),
        UInt16(v) => (ELEMENT_TYPE_U2, v.to_le_bytes().to_vec()),
        Int32(v) => (ELEMENT_TYPE_I4, v.to_le_bytes().to_vec()),
        UInt32(v) => (ELEMENT_TYPE_U4, v.to_le_bytes().to_vec()),
        Int64(v) => (ELEMENT_TYPE_I8, v.to_le_bytes().to_vec()),
        UInt64(v) => (ELEMENT_TYPE_U8, v.to_le_bytes().to_vec()),
        Float32(v) => (ELEMENT_TYPE_R4, v.to_le_bytes().to_vec()),
        Float64(v) => (ELEMENT_TYPE_R8, v.to_le_bytes().to_vec()),
        String(s) => (
            ELEMENT_TYPE_STRING,
            s.encode_utf16().flat_map(u16::to_le_bytes).collect(),
        ),
        Null => (ELEMENT_TYPE_CLASS, vec![0; 4]),
    }
}

impl<'m> Session<'m> {
    fn optional_string(&mut self, value: Option<&str>) -> index::String {
        match value {
            Some(s) => self.strings.write(s),
            None => index::String(0),
        }
    }

    fn constant(&mut self, parent: index::HasConstant, value: &ConstantValue) -> Result<()> {
        let (constant_type, bytes) = constant_blob(value);
        let value = self.blobs.write(&bytes)?;
        insert_sorted(
            &mut self.tables.constant,
            Constant {
                constant_type,
                padding: 0,
                parent,
                value,
            },
        );
        Ok(())
    }

    fn marshal(&mut self, parent: index::HasFieldMarshal, native_type: &[u8]) -> Result<()> {
        let native_type = self.blobs.write(native_type)?;
        insert_sorted(&mut self.tables.field_marshal, FieldMarshal { parent, native_type });
        Ok(())
    }

    fn security(&mut self, parent: index::HasDeclSecurity, declarations: &[SecurityDeclaration]) -> Result<()> {
        for d in declarations {
            let blob = self.permission_set_blob(&d.permission_set)?;
            let permission_set = self.blobs.write(&blob)?;
            insert_sorted(
                &mut self.tables.decl_security,
                DeclSecurity {
                    action: d.action.to_u16(),
                    parent,
                    permission_set,
                },
            );
        }
        Ok(())
    }

    fn semantics(
        &mut self,
        owner: TypeId,
        association: index::HasSemantics,
        semantics: u16,
        method: MethodId,
    ) -> Result<()> {
        if method.parent_type != owner {
            warn!(?method, ?owner, "accessor is declared on another type");
        }
        let row = self.method_def(method)?;
        insert_sorted(
            &mut self.tables.method_semantics,
            MethodSemantics {
                semantics,
                method: Simple::new(row),
                association,
            },
        );
        Ok(())
    }

    fn param(&mut self, sequence: u16, info: &ParameterInfo) -> Result<usize> {
        let name = self.optional_string(info.name.as_deref());
        self.tables.param.push(Param {
            flags: info.flags(),
            sequence,
            name,
        });
        let row = self.tables.param.len();

        if let Some(default) = &info.default {
            self.constant(index::HasConstant::Param(row), default)?;
        }
        if let Some(marshal) = &info.marshal {
            self.marshal(index::HasFieldMarshal::Param(row), marshal)?;
        }
        Ok(row)
    }

    fn type_definition(
        &mut self,
        id: TypeId,
        node: &'m TypeNode,
        attributes: &mut Vec<(Owner, &'m Attribute)>,
    ) -> Result<()> {
        let row = self.type_def(id)?;
        let (first_field, first_method) = self.tokens.type_lists.get(&id).copied().ok_or_else(|| {
            Error::InvariantViolation(format!("type {} has no member lists", node.type_name()))
        })?;

        let extends = match &node.base {
            Some(base) => self.type_token(base)?,
            None => index::TypeDefOrRef::Null,
        };
        let type_namespace = self.optional_string(node.namespace.as_deref());
        self.tables.type_def.push(TypeDef {
            flags: node.flags.to_mask(node.kind, !node.security.is_empty()),
            type_name: self.strings.write(&node.name),
            type_namespace,
            extends,
            field_list: Simple::new(first_field),
            method_list: Simple::new(first_method),
        });

        for a in &node.attributes {
            attributes.push((Owner::Coded(index::HasCustomAttribute::TypeDef(row)), a));
        }
        Ok(())
    }

    fn fields(&mut self, id: TypeId, node: &'m TypeNode, attributes: &mut Vec<(Owner, &'m Attribute)>) -> Result<()> {
        for (i, field) in node.fields.iter().enumerate() {
            let row = self.field_def(FieldId::new(id, i))?;
            let sig = self.field_sig(field)?;
            self.tables.field.push(Field {
                flags: field.flags(),
                name: self.strings.write(&field.name),
                signature: self.blobs.write(&sig)?,
            });

            for a in &field.attributes {
                attributes.push((Owner::Coded(index::HasCustomAttribute::Field(row)), a));
            }
        }
        Ok(())
    }

    fn methods(&mut self, id: TypeId, node: &'m TypeNode, attributes: &mut Vec<(Owner, &'m Attribute)>) -> Result<()> {
        for (i, method) in node.methods.iter().enumerate() {
            let method_id = MethodId::new(id, i);
            let row = self.method_def(method_id)?;
            let (first_param, _) = self.tokens.params.get(&method_id).copied().ok_or_else(|| {
                Error::InvariantViolation(format!("method {} has no parameter list", method.name))
            })?;

            let sig = self.method_sig(&method.signature, method.generic_parameters.len(), &[])?;
            self.tables.method_def.push(MethodDef {
                rva: 0,
                impl_flags: method.impl_flags.to_mask(),
                flags: method.flags(),
                name: self.strings.write(&method.name),
                signature: self.blobs.write(&sig)?,
                param_list: Simple::new(first_param),
            });

            for a in &method.attributes {
                attributes.push((Owner::Coded(index::HasCustomAttribute::MethodDef(row)), a));
            }
        }
        Ok(())
    }

    fn params(&mut self, id: TypeId, node: &'m TypeNode, attributes: &mut Vec<(Owner, &'m Attribute)>) -> Result<()> {
        for (i, method) in node.methods.iter().enumerate() {
            let expected = self.tokens.params.get(&MethodId::new(id, i)).map(|&(first, _)| first);
            if expected != Some(self.tables.param.len() + 1) {
                return Err(Error::InvariantViolation(format!(
                    "parameter rows of {} are out of order",
                    method.name
                )));
            }

            if let Some(info) = &method.return_info {
                let row = self.param(0, info)?;
                for a in &info.attributes {
                    attributes.push((Owner::Coded(index::HasCustomAttribute::Param(row)), a));
                }
            }
            for (sequence, info) in method.parameters.iter().enumerate() {
                let row = self.param(sequence as u16 + 1, info)?;
                for a in &info.attributes {
                    attributes.push((Owner::Coded(index::HasCustomAttribute::Param(row)), a));
                }
            }
        }
        Ok(())
    }

    fn members(&mut self, id: TypeId, node: &'m TypeNode, attributes: &mut Vec<(Owner, &'m Attribute)>) -> Result<()> {
        let class = self.type_def(id)?;

        for implementation in &node.interfaces {
            let interface = self.type_token(&implementation.interface)?;
            insert_sorted(
                &mut self.tables.interface_impl,
                InterfaceImpl {
                    class: Simple::new(class),
                    interface,
                },
            );
            for a in &implementation.attributes {
                attributes.push((Owner::InterfaceImpl { class, interface }, a));
            }
        }

        for (i, field) in node.fields.iter().enumerate() {
            let row = self.field_def(FieldId::new(id, i))?;
            if let Some(default) = &field.default {
                self.constant(index::HasConstant::Field(row), default)?;
            }
            if let Some(marshal) = &field.marshal {
                self.marshal(index::HasFieldMarshal::Field(row), marshal)?;
            }
        }

        self.security(index::HasDeclSecurity::TypeDef(class), &node.security)?;
        for (i, method) in node.methods.iter().enumerate() {
            let row = self.method_def(MethodId::new(id, i))?;
            self.security(index::HasDeclSecurity::MethodDef(row), &method.security)?;
        }

        if let Some(layout) = node.class_layout {
            insert_sorted(
                &mut self.tables.class_layout,
                ClassLayout {
                    packing_size: layout.packing_size,
                    class_size: layout.class_size,
                    parent: Simple::new(class),
                },
            );
        }
        for (i, field) in node.fields.iter().enumerate() {
            if let Some(offset) = field.offset {
                let row = self.field_def(FieldId::new(id, i))?;
                insert_sorted(
                    &mut self.tables.field_layout,
                    FieldLayout {
                        offset,
                        field: Simple::new(row),
                    },
                );
            }
        }

        Ok(())
    }

    fn properties(
        &mut self,
        id: TypeId,
        node: &'m TypeNode,
        attributes: &mut Vec<(Owner, &'m Attribute)>,
    ) -> Result<()> {
        if node.properties.is_empty() {
            return Ok(());
        }

        let first = self.tokens.properties.get(&PropertyId::new(id, 0)).copied();
        self.tables.property_map.push(PropertyMap {
            parent: Simple::new(self.type_def(id)?),
            property_list: Simple::new(first.unwrap_or(self.tables.property.len() + 1)),
        });

        for (i, property) in node.properties.iter().enumerate() {
            let sig = self.property_sig(property)?;
            self.tables.property.push(Property {
                flags: property.flags(),
                name: self.strings.write(&property.name),
                property_type: self.blobs.write(&sig)?,
            });
            let row = self.tables.property.len();
            if self.tokens.properties.get(&PropertyId::new(id, i)) != Some(&row) {
                return Err(Error::InvariantViolation(format!(
                    "property {} landed on an unexpected row",
                    property.name
                )));
            }

            if let Some(default) = &property.default {
                self.constant(index::HasConstant::Property(row), default)?;
            }
            for a in &property.attributes {
                attributes.push((Owner::Coded(index::HasCustomAttribute::Property(row)), a));
            }
        }
        Ok(())
    }

    fn events(&mut self, id: TypeId, node: &'m TypeNode, attributes: &mut Vec<(Owner, &'m Attribute)>) -> Result<()> {
        if node.events.is_empty() {
            return Ok(());
        }

        let first = self.tokens.events.get(&EventId::new(id, 0)).copied();
        self.tables.event_map.push(EventMap {
            parent: Simple::new(self.type_def(id)?),
            event_list: Simple::new(first.unwrap_or(self.tables.event.len() + 1)),
        });

        for event in &node.events {
            let event_type = self.type_token(&event.delegate_type)?;
            self.tables.event.push(Event {
                event_flags: event.flags(),
                name: self.strings.write(&event.name),
                event_type,
            });
            let row = self.tables.event.len();
            for a in &event.attributes {
                attributes.push((Owner::Coded(index::HasCustomAttribute::Event(row)), a));
            }
        }
        Ok(())
    }

    fn method_semantics(&mut self, id: TypeId, node: &TypeNode) -> Result<()> {
        for (i, property) in node.properties.iter().enumerate() {
            let row = self.tokens.properties.get(&PropertyId::new(id, i)).copied();
            let association = index::HasSemantics::Property(row.ok_or_else(|| {
                Error::InvariantViolation(format!("property {} was not discovered", property.name))
            })?);
            if let Some(setter) = property.setter {
                self.semantics(id, association, SEMANTICS_SETTER, setter)?;
            }
            if let Some(getter) = property.getter {
                self.semantics(id, association, SEMANTICS_GETTER, getter)?;
            }
            for &other in &property.other {
                self.semantics(id, association, SEMANTICS_OTHER, other)?;
            }
        }

        for (i, event) in node.events.iter().enumerate() {
            let row = self.tokens.events.get(&EventId::new(id, i)).copied();
            let association = index::HasSemantics::Event(row.ok_or_else(|| {
                Error::InvariantViolation(format!("event {} was not discovered", event.name))
            })?);
            if let Some(add) = event.add_listener {
                self.semantics(id, association, SEMANTICS_ADD_ON, add)?;
            }
            if let Some(remove) = event.remove_listener {
                self.semantics(id, association, SEMANTICS_REMOVE_ON, remove)?;
            }
            if let Some(raise) = event.raise_event {
                self.semantics(id, association, SEMANTICS_FIRE, raise)?;
            }
            for &other in &event.other {
                self.semantics(id, association, SEMANTICS_OTHER, other)?;
            }
        }
        Ok(())
    }

    fn method_impls(&mut self, id: TypeId, node: &TypeNode) -> Result<()> {
        let class = Simple::new(self.type_def(id)?);
        for o in &node.overrides {
            let method_body = self.method_def_or_ref(&o.implementation)?;
            let method_declaration = self.method_def_or_ref(&o.declaration)?;
            insert_sorted(
                &mut self.tables.method_impl,
                MethodImpl {
                    class,
                    method_body,
                    method_declaration,
                },
            );
        }
        Ok(())
    }

    fn impl_maps(&mut self, id: TypeId, node: &TypeNode) -> Result<()> {
        let mut forwarded = vec![];
        for (i, field) in node.fields.iter().enumerate() {
            if let Some(pinvoke) = &field.pinvoke {
                let row = self.field_def(FieldId::new(id, i))?;
                forwarded.push((index::MemberForwarded::Field(row), pinvoke));
            }
        }
        for (i, method) in node.methods.iter().enumerate() {
            if let Some(pinvoke) = &method.pinvoke {
                let row = self.method_def(MethodId::new(id, i))?;
                forwarded.push((index::MemberForwarded::MethodDef(row), pinvoke));
            }
        }

        for (member_forwarded, pinvoke) in forwarded {
            let import_scope = Simple::new(self.module_ref(pinvoke.module)?);
            let import_name = self.strings.write(&pinvoke.import_name);
            insert_sorted(
                &mut self.tables.impl_map,
                ImplMap {
                    mapping_flags: pinvoke.flags(),
                    member_forwarded,
                    import_name,
                    import_scope,
                },
            );
        }
        Ok(())
    }

    fn field_rvas(&mut self, id: TypeId, node: &TypeNode) -> Result<()> {
        for (i, field) in node.fields.iter().enumerate() {
            let Some(initial) = &field.initial_value else {
                continue;
            };
            let row = self.field_def(FieldId::new(id, i))?;
            let offset = self.static_data.append(&initial.data, initial.section);
            let position = insert_sorted(
                &mut self.tables.field_rva,
                FieldRVA {
                    rva: 0,
                    field: Simple::new(row),
                },
            );
            self.field_data.insert(position, (initial.section, offset));
        }
        Ok(())
    }

    fn manifest(&mut self, attributes: &mut Vec<(Owner, &'m Attribute)>) -> Result<()> {
        let module = self.module;

        if let Some(assembly) = &module.assembly {
            let public_key = match &self.public_key {
                Some(key) => self.blobs.write(key)?,
                None => index::Blob(0),
            };
            let culture = self.optional_string(assembly.culture.as_deref());
            self.tables.assembly.push(Assembly {
                hash_alg_id: assembly.hash_algorithm.id(),
                major_version: assembly.version.major,
                minor_version: assembly.version.minor,
                build_number: assembly.version.build,
                revision_number: assembly.version.revision,
                flags: build_bitmask!(
                    self.public_key.is_some() => 0x0001,
                    assembly.retargetable => 0x0100,
                    assembly.disable_jit_optimizer => 0x4000,
                    assembly.enable_jit_tracking => 0x8000,
                ),
                public_key,
                name: self.strings.write(&assembly.name),
                culture,
            });

            self.security(index::HasDeclSecurity::Assembly(1), &assembly.security)?;
            for a in &assembly.attributes {
                attributes.push((Owner::Coded(index::HasCustomAttribute::Assembly(1)), a));
            }
        }

        for resource in &module.resources {
            let (offset, implementation) = match &resource.data {
                ResourceData::Embedded(data) => (self.resources.append(data)?, index::Implementation::Null),
                ResourceData::File { file, offset } => (*offset, index::Implementation::File(self.file_row(file.0)?)),
                ResourceData::Assembly(a) => (0, index::Implementation::AssemblyRef(self.assembly_ref(*a)?)),
            };
            self.tables.manifest_resource.push(ManifestResource {
                offset,
                flags: if resource.public { 0x1 } else { 0x2 },
                name: self.strings.write(&resource.name),
                implementation,
            });
            let row = self.tables.manifest_resource.len();
            for a in &resource.attributes {
                attributes.push((Owner::Coded(index::HasCustomAttribute::ManifestResource(row)), a));
            }
        }

        for file in &module.files {
            let hash_value = self.blobs.write(&file.hash_value)?;
            self.tables.file.push(File {
                flags: if file.has_metadata { 0x0 } else { 0x1 },
                name: self.strings.write(&file.name),
                hash_value,
            });
            let row = self.tables.file.len();
            for a in &file.attributes {
                attributes.push((Owner::Coded(index::HasCustomAttribute::File(row)), a));
            }
        }

        for exported in &module.exported_types {
            let (type_def_id, implementation) = match exported.implementation {
                TypeImplementation::ModuleFile { file, type_def } => {
                    (type_def, index::Implementation::File(self.file_row(file.0)?))
                }
                TypeImplementation::TypeForwarder(a) => (0, index::Implementation::AssemblyRef(self.assembly_ref(a)?)),
                TypeImplementation::Nested(e) => {
                    if e.0 >= module.exported_types.len() {
                        return Err(Error::UnresolvedReference(format!("exported type {} is out of range", e.0)));
                    }
                    (0, index::Implementation::ExportedType(e.0 + 1))
                }
            };
            let type_namespace = self.optional_string(exported.namespace.as_deref());
            self.tables.exported_type.push(ExportedType {
                flags: build_bitmask!(exported.public => 0x0000_0001, exported.forwarder => 0x0020_0000),
                type_def_id,
                type_name: self.strings.write(&exported.name),
                type_namespace,
                implementation,
            });
            let row = self.tables.exported_type.len();
            for a in &exported.attributes {
                attributes.push((Owner::Coded(index::HasCustomAttribute::ExportedType(row)), a));
            }
        }

        Ok(())
    }

    fn file_row(&self, index: usize) -> Result<usize> {
        if index < self.module.files.len() {
            Ok(index + 1)
        } else {
            Err(Error::UnresolvedReference(format!("file {} is out of range", index)))
        }
    }

    fn nested_classes(&mut self) -> Result<()> {
        for id in self.tokens.type_order.clone() {
            if let Some(outer) = self.module.type_node(id)?.declaring_type {
                let row = NestedClass {
                    nested_class: Simple::new(self.type_def(id)?),
                    enclosing_class: Simple::new(self.type_def(outer)?),
                };
                insert_sorted(&mut self.tables.nested_class, row);
            }
        }
        Ok(())
    }

    /// GenericParam rows for every owner, then their constraints against the
    /// final GenericParam order.
    fn generic_params(&mut self, attributes: &mut Vec<(Owner, &'m Attribute)>) -> Result<()> {
        let module = self.module;
        let mut owners = vec![];
        for &id in &self.tokens.type_order {
            let node = module.type_node(id)?;
            if !node.generic_parameters.is_empty() {
                owners.push((index::TypeOrMethodDef::TypeDef(self.type_def(id)?), &node.generic_parameters));
            }
            for (i, method) in node.methods.iter().enumerate() {
                if !method.generic_parameters.is_empty() {
                    let row = self.method_def(MethodId::new(id, i))?;
                    owners.push((index::TypeOrMethodDef::MethodDef(row), &method.generic_parameters));
                }
            }
        }

        for &(owner, parameters) in &owners {
            for (number, p) in parameters.iter().enumerate() {
                let number = number as u16;
                let row = GenericParam {
                    number,
                    flags: p.flags(),
                    owner,
                    name: self.strings.write(&p.name),
                };
                insert_sorted(&mut self.tables.generic_param, row);
                for a in &p.attributes {
                    attributes.push((Owner::GenericParam { owner, number }, a));
                }
            }
        }

        for &(owner, parameters) in &owners {
            for (number, p) in parameters.iter().enumerate() {
                let number = number as u16;
                let param_row = self.generic_param_row(owner, number)?;
                for c in &p.constraints {
                    let constraint = self.type_token(&c.constraint)?;
                    insert_sorted(
                        &mut self.tables.generic_param_constraint,
                        GenericParamConstraint {
                            owner: Simple::new(param_row),
                            constraint,
                        },
                    );
                    for a in &c.attributes {
                        attributes.push((
                            Owner::GenericParamConstraint {
                                owner,
                                number,
                                constraint,
                            },
                            a,
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    fn generic_param_row(&self, owner: index::TypeOrMethodDef, number: u16) -> Result<usize> {
        self.tables
            .generic_param
            .iter()
            .position(|p| p.owner == owner && p.number == number)
            .map(|i| i + 1)
            .ok_or_else(|| Error::InvariantViolation(format!("generic parameter {} of {:?} is missing", number, owner)))
    }

    fn resolve_owner(&self, owner: Owner) -> Result<index::HasCustomAttribute> {
        Ok(match owner {
            Owner::Coded(parent) => parent,
            Owner::InterfaceImpl { class, interface } => {
                let class = Simple::new(class);
                let position = self
                    .tables
                    .interface_impl
                    .iter()
                    .position(|r| r.class == class && r.interface == interface)
                    .ok_or_else(|| {
                        Error::InvariantViolation("attributed interface implementation is missing".to_string())
                    })?;
                index::HasCustomAttribute::InterfaceImpl(position + 1)
            }
            Owner::GenericParam { owner, number } => {
                index::HasCustomAttribute::GenericParam(self.generic_param_row(owner, number)?)
            }
            Owner::GenericParamConstraint {
                owner,
                number,
                constraint,
            } => {
                let param = Simple::new(self.generic_param_row(owner, number)?);
                let position = self
                    .tables
                    .generic_param_constraint
                    .iter()
                    .position(|r| r.owner == param && r.constraint == constraint)
                    .ok_or_else(|| Error::InvariantViolation("attributed generic constraint is missing".to_string()))?;
                index::HasCustomAttribute::GenericParamConstraint(position + 1)
            }
        })
    }

    /// Declared references get rows even when nothing uses them, so their
    /// attributes have an owner.
    fn references(&mut self, attributes: &mut Vec<(Owner, &'m Attribute)>) -> Result<()> {
        let module = self.module;
        for (i, reference) in module.assembly_references.iter().enumerate() {
            let row = self.assembly_ref(AssemblyRefId(i))?;
            for a in &reference.attributes {
                attributes.push((Owner::Coded(index::HasCustomAttribute::AssemblyRef(row)), a));
            }
        }
        for (i, reference) in module.module_references.iter().enumerate() {
            let row = self.module_ref(ModuleRefId(i))?;
            for a in &reference.attributes {
                attributes.push((Owner::Coded(index::HasCustomAttribute::ModuleRef(row)), a));
            }
        }
        Ok(())
    }

    fn custom_attributes(&mut self, attributes: Vec<(Owner, &'m Attribute)>) -> Result<()> {
        for (owner, attribute) in attributes {
            let parent = self.resolve_owner(owner)?;
            let attribute_type = self.custom_attribute_type(&attribute.constructor)?;
            let value = self.attribute_blob(attribute)?;
            let value = self.blobs.write(&value)?;
            insert_sorted(
                &mut self.tables.custom_attribute,
                CustomAttribute {
                    parent,
                    attribute_type,
                    value,
                },
            );
        }
        Ok(())
    }

    pub(super) fn populate(&mut self) -> Result<()> {
        let module = self.module;
        let order = self.tokens.type_order.clone();
        let nodes = order
            .iter()
            .map(|&id| Ok((id, module.type_node(id)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut attributes = vec![];
        for a in &module.attributes {
            attributes.push((Owner::Coded(index::HasCustomAttribute::Module(1)), a));
        }

        macro_rules! each_type {
            ($pass:ident) => {
                for &(id, node) in &nodes {
                    self.$pass(id, node, &mut attributes)?;
                }
                debug!(pass = stringify!($pass), "populated");
            };
            ($pass:ident, plain) => {
                for &(id, node) in &nodes {
                    self.$pass(id, node)?;
                }
                debug!(pass = stringify!($pass), "populated");
            };
        }

        each_type!(type_definition);
        each_type!(fields);
        each_type!(methods);
        each_type!(params);
        each_type!(members);
        each_type!(properties);
        each_type!(events);
        each_type!(method_semantics, plain);
        each_type!(method_impls, plain);
        each_type!(impl_maps, plain);
        each_type!(field_rvas, plain);

        self.manifest(&mut attributes)?;
        self.nested_classes()?;
        self.generic_params(&mut attributes)?;
        self.references(&mut attributes)?;

        debug!(count = attributes.len(), "writing custom attributes");
        self.custom_attributes(attributes)?;

        Ok(())
    }

    pub(super) fn entry_point_token(&self) -> Result<u32> {
        let token = match self.module.entry_point {
            None => return Ok(0),
            Some(EntryPoint::Method(method)) => {
                let row = self.tokens.methods.get(&method).copied().ok_or_else(|| {
                    Error::UnresolvedReference(format!("entry point {:?} is not a defined method", method))
                })?;
                Token::new(Kind::MethodDef, row)
            }
            Some(EntryPoint::File(file)) => Token::new(Kind::File, self.file_row(file.0)?),
        };
        Ok(token.encode()?)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        binary::index,
        emit::WriteOptions,
        model::{attribute::*, members::*, module::*, signature::*, types::*, Accessibility, MethodId, TypeId},
        Error,
    };

    fn attribute_type(module: &mut Module) -> MethodId {
        let attribute = module.push_type(TypeNode::new(Some("Demo"), "MarkerAttribute", TypeKind::Class));
        module.push_method(attribute, Method::constructor(vec![], None))
    }

    #[test]
    fn constants_are_sorted_by_parent() -> Result<(), Box<dyn std::error::Error>> {
        let mut module = Module::new("constants.dll");
        let holder = module.push_type(TypeNode::new(None, "Holder", TypeKind::Class));
        let mut method = Method::new("M", MethodSignature::static_member(TypeSig::Void, vec![TypeSig::Int32]));
        method.parameters = vec![ParameterInfo {
            default: Some(Constant::Int32(7)),
            ..ParameterInfo::named("p")
        }];
        module.push_method(holder, method);
        module.push_field(
            holder,
            Field {
                literal: true,
                default: Some(Constant::String("hi".to_string())),
                ..Field::static_member("Greeting", TypeSig::String)
            },
        );
        module.push_field(
            holder,
            Field {
                literal: true,
                default: Some(Constant::Null),
                ..Field::static_member("Nothing", TypeSig::Object)
            },
        );

        let image = module.assemble(&WriteOptions::default())?;
        let parents: Vec<_> = image.tables.constant.iter().map(|c| c.parent).collect();
        // ordered by row, then by coded index tag
        assert_eq!(
            parents,
            [
                index::HasConstant::Field(1),
                index::HasConstant::Param(1),
                index::HasConstant::Field(2)
            ]
        );
        let types: Vec<_> = image.tables.constant.iter().map(|c| c.constant_type).collect();
        assert_eq!(types, [0x0E, 0x08, 0x12]);
        Ok(())
    }

    #[test]
    fn generic_parameters_and_constraints() -> Result<(), Box<dyn std::error::Error>> {
        let mut module = Module::new("generics.dll");
        let comparable = module.push_type(TypeNode::new(Some("Demo"), "IComparable", TypeKind::Interface));

        let mut method_owner = TypeNode::new(Some("Demo"), "Algorithms", TypeKind::Class);
        let mut sort = Method::new("Sort", MethodSignature::static_member(TypeSig::Void, vec![]));
        sort.generic_parameters = vec![GenericParameter::new("T")];
        method_owner.methods.push(sort);
        module.push_type(method_owner);

        let mut list = TypeNode::new(Some("Demo"), "List", TypeKind::Class);
        let mut parameter = GenericParameter::new("T");
        parameter.constraints.push(GenericConstraint {
            constraint: TypeSig::Named(comparable),
            attributes: vec![],
        });
        list.generic_parameters = vec![parameter, GenericParameter::new("U")];
        module.push_type(list);

        let image = module.assemble(&WriteOptions::default())?;
        let owners: Vec<_> = image
            .tables
            .generic_param
            .iter()
            .map(|p| (p.owner, p.number))
            .collect();
        // TypeOrMethodDef codes: List is TypeDef 4 => 8, Sort is MethodDef 1 => 3
        assert_eq!(
            owners,
            [
                (index::TypeOrMethodDef::MethodDef(1), 0),
                (index::TypeOrMethodDef::TypeDef(4), 0),
                (index::TypeOrMethodDef::TypeDef(4), 1),
            ]
        );
        assert_eq!(image.tables.generic_param_constraint.len(), 1);
        assert_eq!(image.tables.generic_param_constraint[0].owner.0, 2);
        assert_eq!(
            image.tables.generic_param_constraint[0].constraint,
            index::TypeDefOrRef::TypeDef(2)
        );
        Ok(())
    }

    #[test]
    fn attributes_on_many_owners() -> Result<(), Box<dyn std::error::Error>> {
        let mut module = Module::new("attributes.dll");
        let marker = attribute_type(&mut module);
        let target = module.push_type(TypeNode::new(None, "Target", TypeKind::Class));
        module.types[target.0].attributes.push(Attribute::new(marker, vec![]));
        module.attributes.push(Attribute::new(marker, vec![]));

        let image = module.assemble(&WriteOptions::default())?;
        let parents: Vec<_> = image.tables.custom_attribute.iter().map(|a| a.parent).collect();
        assert_eq!(
            parents,
            [
                index::HasCustomAttribute::Module(1),
                index::HasCustomAttribute::TypeDef(3)
            ]
        );
        assert_eq!(
            image.tables.custom_attribute[0].attribute_type,
            index::CustomAttributeType::MethodDef(1)
        );
        Ok(())
    }

    #[test]
    fn property_semantics() -> Result<(), Box<dyn std::error::Error>> {
        let mut module = Module::new("properties.dll");
        let widget = module.push_type(TypeNode::new(None, "Widget", TypeKind::Class));
        let getter = module.push_method(
            widget,
            Method {
                special_name: true,
                accessibility: Accessibility::Public,
                ..Method::new("get_Size", MethodSignature::instance(TypeSig::Int32, vec![]))
            },
        );
        let setter = module.push_method(
            widget,
            Method::new("set_Size", MethodSignature::instance(TypeSig::Void, vec![TypeSig::Int32])),
        );
        module.push_property(
            widget,
            Property {
                getter: Some(getter),
                setter: Some(setter),
                ..Property::new("Size", TypeSig::Int32)
            },
        );

        let image = module.assemble(&WriteOptions::default())?;
        assert_eq!(image.tables.property_map.len(), 1);
        let semantics: Vec<_> = image
            .tables
            .method_semantics
            .iter()
            .map(|s| (s.semantics, s.method.0))
            .collect();
        assert_eq!(semantics, [(0x1, 2), (0x2, 1)]);
        Ok(())
    }

    #[test]
    fn entry_point_must_be_defined() {
        let mut module = Module::new("entry.exe");
        module.entry_point = Some(EntryPoint::Method(MethodId::new(TypeId(0), 3)));
        assert!(matches!(
            module.assemble(&WriteOptions::default()),
            Err(Error::UnresolvedReference(_))
        ));
    }

    #[test]
    fn entry_point_token() -> Result<(), Box<dyn std::error::Error>> {
        let mut module = Module::new("entry.exe");
        let main = module.push_method(
            TypeId::MODULE,
            Method::with_body(
                "Main",
                MethodSignature::static_member(TypeSig::Void, vec![]),
                crate::model::body::Body::new(crate::model::body::Block::new(
                    crate::model::body::BlockId(0),
                    vec![],
                )),
            ),
        );
        module.entry_point = Some(EntryPoint::Method(main));
        let image = module.assemble(&WriteOptions::default())?;
        assert_eq!(image.entry_point, 0x0600_0001);
        Ok(())
    }
}
