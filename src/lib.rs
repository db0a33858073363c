//! Writes CLI metadata (ECMA-335 partition II) and IL method bodies from an
//! in-memory module model.
//!
//! The [`model`] module describes the input graph. [`model::module::Module::assemble`]
//! produces an [`image::Image`] holding the finished tables and heaps, and
//! [`model::module::Module::write`] lays that image out as a PE file.

pub mod binary;
pub mod emit;
pub mod error;
pub mod image;
pub mod model;
pub mod pe;
mod utils;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::emit::{
        symbols::{MetadataNames, SequencePoint, SymbolWriter},
        Collaborators, WriteOptions,
    };
    pub use crate::error::Error;
    pub use crate::image::Image;
    pub use crate::model::{
        attribute::*,
        body::*,
        members::*,
        module::*,
        signature::*,
        types::*,
        Accessibility, AssemblyRefId, DocumentId, EventId, ExportedTypeId, FieldId, FileId, MethodId, ModuleRefId,
        PropertyId, TypeId,
    };
    pub use crate::pe::{ImageWriter, PeWriter, Signer};
}

#[cfg(test)]
mod tests;
