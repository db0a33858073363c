use super::{
    attribute::{Attribute, SecurityDeclaration},
    members::{Event, Field, Method, Property},
    types::{TypeKind, TypeNode},
    AssemblyRefId, EventId, ExportedTypeId, FieldId, FileId, MethodId, ModuleRefId, PropertyId, TypeId,
};
use crate::{
    emit::{self, Collaborators, WriteOptions},
    error::{Error, Result},
    image::Image,
    pe::{ImageWriter, PeWriter},
};
use ilemit_macros::From;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
}

impl Version {
    pub const ZERO: Self = Self {
        major: 0,
        minor: 0,
        build: 0,
        revision: 0,
    };

    pub const fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        Version {
            major,
            minor,
            build,
            revision,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum HashAlgorithm {
    #[default]
    None,
    ReservedMD5,
    SHA1,
}

impl HashAlgorithm {
    pub fn id(self) -> u32 {
        match self {
            HashAlgorithm::None => 0x0000,
            HashAlgorithm::ReservedMD5 => 0x8003,
            HashAlgorithm::SHA1 => 0x8004,
        }
    }
}

/// Identity of the assembly whose manifest this module carries.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub name: String,
    pub version: Version,
    pub culture: Option<String>,
    pub public_key: Option<Vec<u8>>,
    pub hash_algorithm: HashAlgorithm,
    pub retargetable: bool,
    pub disable_jit_optimizer: bool,
    pub enable_jit_tracking: bool,
    pub attributes: Vec<Attribute>,
    pub security: Vec<SecurityDeclaration>,
}

impl Assembly {
    pub fn new(name: impl Into<String>) -> Self {
        Assembly {
            name: name.into(),
            version: Version::ZERO,
            culture: None,
            public_key: None,
            hash_algorithm: HashAlgorithm::SHA1,
            retargetable: false,
            disable_jit_optimizer: false,
            enable_jit_tracking: false,
            attributes: vec![],
            security: vec![],
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssemblyReference {
    pub name: String,
    pub version: Version,
    pub culture: Option<String>,
    pub has_full_public_key: bool,
    pub public_key_or_token: Option<Vec<u8>>,
    pub retargetable: bool,
    pub hash_value: Option<Vec<u8>>,
    pub attributes: Vec<Attribute>,
}

impl AssemblyReference {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        AssemblyReference {
            name: name.into(),
            version,
            culture: None,
            has_full_public_key: false,
            public_key_or_token: None,
            retargetable: false,
            hash_value: None,
            attributes: vec![],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleReference {
    pub name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct File {
    pub name: String,
    pub has_metadata: bool,
    pub hash_value: Vec<u8>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub enum ResourceData {
    /// Stored in this image's resource section.
    Embedded(Vec<u8>),
    /// Stored at an offset in another file of the assembly.
    File { file: FileId, offset: u32 },
    /// Stored in another assembly.
    Assembly(AssemblyRefId),
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub name: String,
    pub public: bool,
    pub data: ResourceData,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub enum TypeImplementation {
    /// Defined in another module of this assembly, at the given TypeDef row.
    ModuleFile { file: FileId, type_def: u32 },
    /// Forwarded to another assembly.
    TypeForwarder(AssemblyRefId),
    Nested(ExportedTypeId),
}

#[derive(Debug, Clone)]
pub struct ExportedType {
    pub name: String,
    pub namespace: Option<String>,
    pub public: bool,
    pub forwarder: bool,
    pub implementation: TypeImplementation,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, From)]
pub enum EntryPoint {
    Method(MethodId),
    File(FileId),
}

/// A source document referenced by sequence points.
#[derive(Debug, Clone)]
pub struct Document {
    pub url: String,
    pub language: [u8; 16],
    pub vendor: [u8; 16],
    pub document_type: [u8; 16],
}

impl Document {
    pub fn new(url: impl Into<String>) -> Self {
        Document {
            url: url.into(),
            language: [0; 16],
            vendor: [0; 16],
            document_type: [0; 16],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub mvid: [u8; 16],
    pub assembly: Option<Assembly>,
    pub attributes: Vec<Attribute>,
    /// Index 0 is always the `<Module>` pseudo-type.
    pub types: Vec<TypeNode>,
    pub assembly_references: Vec<AssemblyReference>,
    pub module_references: Vec<ModuleReference>,
    pub files: Vec<File>,
    pub resources: Vec<Resource>,
    pub exported_types: Vec<ExportedType>,
    pub documents: Vec<Document>,
    pub entry_point: Option<EntryPoint>,
    /// `System.Runtime.CompilerServices.IsVolatile`, for volatile field signatures.
    pub is_volatile: Option<TypeId>,
    /// The assembly defining `System.Object` and the primitive types. Primitives used
    /// where a TypeDefOrRef token is required resolve to TypeRef rows scoped to it.
    pub core_library: Option<AssemblyRefId>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            mvid: [0; 16],
            assembly: None,
            attributes: vec![],
            types: vec![TypeNode::new(None, "<Module>", TypeKind::Class)],
            assembly_references: vec![],
            module_references: vec![],
            files: vec![],
            resources: vec![],
            exported_types: vec![],
            documents: vec![],
            entry_point: None,
            is_volatile: None,
            core_library: None,
        }
    }

    pub fn push_type(&mut self, node: TypeNode) -> TypeId {
        self.types.push(node);
        TypeId(self.types.len() - 1)
    }

    pub fn push_nested_type(&mut self, declaring_type: TypeId, node: TypeNode) -> TypeId {
        self.push_type(TypeNode {
            declaring_type: Some(declaring_type),
            ..node
        })
    }

    pub fn push_assembly_reference(&mut self, reference: AssemblyReference) -> AssemblyRefId {
        self.assembly_references.push(reference);
        AssemblyRefId(self.assembly_references.len() - 1)
    }

    pub fn push_module_reference(&mut self, name: impl Into<String>) -> ModuleRefId {
        self.module_references.push(ModuleReference {
            name: name.into(),
            attributes: vec![],
        });
        ModuleRefId(self.module_references.len() - 1)
    }

    pub fn push_file(&mut self, file: File) -> FileId {
        self.files.push(file);
        FileId(self.files.len() - 1)
    }

    pub fn push_exported_type(&mut self, exported: ExportedType) -> ExportedTypeId {
        self.exported_types.push(exported);
        ExportedTypeId(self.exported_types.len() - 1)
    }

    pub fn push_document(&mut self, document: Document) -> super::DocumentId {
        self.documents.push(document);
        super::DocumentId(self.documents.len() - 1)
    }

    pub fn push_field(&mut self, parent: TypeId, field: Field) -> FieldId {
        let fields = &mut self.types[parent.0].fields;
        fields.push(field);
        FieldId::new(parent, fields.len() - 1)
    }

    pub fn push_method(&mut self, parent: TypeId, method: Method) -> MethodId {
        let methods = &mut self.types[parent.0].methods;
        methods.push(method);
        MethodId::new(parent, methods.len() - 1)
    }

    pub fn push_property(&mut self, parent: TypeId, property: Property) -> PropertyId {
        let properties = &mut self.types[parent.0].properties;
        properties.push(property);
        PropertyId::new(parent, properties.len() - 1)
    }

    pub fn push_event(&mut self, parent: TypeId, event: Event) -> EventId {
        let events = &mut self.types[parent.0].events;
        events.push(event);
        EventId::new(parent, events.len() - 1)
    }

    pub fn type_node(&self, id: TypeId) -> Result<&TypeNode> {
        self.types
            .get(id.0)
            .ok_or_else(|| Error::UnresolvedReference(format!("type {:?} is not in the module", id)))
    }

    pub fn field(&self, id: FieldId) -> Result<&Field> {
        self.type_node(id.parent_type)?
            .fields
            .get(id.index)
            .ok_or_else(|| Error::UnresolvedReference(format!("field {:?} is not in the module", id)))
    }

    pub fn method(&self, id: MethodId) -> Result<&Method> {
        self.type_node(id.parent_type)?
            .methods
            .get(id.index)
            .ok_or_else(|| Error::UnresolvedReference(format!("method {:?} is not in the module", id)))
    }

    /// Assembles the metadata tables, heaps and method bodies without laying out a PE file.
    pub fn assemble(&self, options: &WriteOptions) -> Result<Image> {
        emit::assemble(self, options, &mut Collaborators::default())
    }

    /// Writes a complete PE image.
    pub fn write(&self, options: &WriteOptions) -> Result<Vec<u8>> {
        self.write_with(options, Collaborators::default())
    }

    /// Writes a PE image, driving the given symbol writer and signer.
    pub fn write_with(&self, options: &WriteOptions, mut collaborators: Collaborators) -> Result<Vec<u8>> {
        let image = emit::assemble(self, options, &mut collaborators)?;
        PeWriter::new(options).write_image(&image, collaborators.signer)
    }

    /// Writes a PE image to `path`; the file is only created once the image is complete.
    pub fn write_to_path(&self, path: impl AsRef<Path>, options: &WriteOptions) -> Result<()> {
        let bytes = self.write(options)?;
        debug!(path = %path.as_ref().display(), len = bytes.len(), "writing image");
        std::fs::write(path, bytes)?;
        Ok(())
    }
}
