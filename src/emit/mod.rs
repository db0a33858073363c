//! The write session: discovery, body encoding and table population over one
//! borrowed [`Module`], producing an [`Image`].

mod attribute;
mod body;
mod discover;
mod populate;
mod signature;
pub mod symbols;
mod tokens;

pub use tokens::is_structural;

use crate::{
    binary::{
        heap::{BlobWriter, DataSection, GUIDWriter, ResourceWriter, StaticDataWriter, StringsWriter, UserStringWriter},
        table::Tables,
    },
    error::{Error, Result},
    image::Image,
    model::module::Module,
    pe::Signer,
};
use std::{ops::Range, path::PathBuf};
use symbols::{MethodDebug, SymbolWriter};
use tokens::Tokens;
use tracing::debug;

pub const DEFAULT_METADATA_VERSION: &str = "Standard CLI 2005";

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub is_32_bit: bool,
    pub is_executable: bool,
    /// Version string of the metadata root.
    pub metadata_version: String,
    /// PE header timestamp; fixed so output is reproducible.
    pub time_date_stamp: u32,
    /// A file holding the public key blob used to strong-name the assembly.
    pub key_file: Option<PathBuf>,
    /// Record scopes, locals and sequence points for a [`SymbolWriter`].
    pub debug_symbols: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            is_32_bit: false,
            is_executable: false,
            metadata_version: DEFAULT_METADATA_VERSION.to_string(),
            time_date_stamp: 0,
            key_file: None,
            debug_symbols: false,
        }
    }
}

/// External services driven during a write.
#[derive(Default)]
pub struct Collaborators<'a> {
    pub symbols: Option<&'a mut dyn SymbolWriter>,
    pub signer: Option<&'a dyn Signer>,
}

/// All mutable state of one write. Dropped at the end of the write, including on error.
pub(crate) struct Session<'m> {
    pub module: &'m Module,
    pub options: &'m WriteOptions,
    pub tables: Tables,
    pub strings: StringsWriter,
    pub blobs: BlobWriter,
    pub guids: GUIDWriter,
    pub user_strings: UserStringWriter,
    pub bodies: Vec<u8>,
    /// Encoded body per MethodDef row, 0-based.
    pub body_ranges: Vec<Option<Range<usize>>>,
    pub static_data: StaticDataWriter,
    /// Section and offset for each FieldRVA row, kept in row order.
    pub field_data: Vec<(DataSection, u32)>,
    pub resources: ResourceWriter,
    pub tokens: Tokens,
    pub debug: Vec<MethodDebug>,
    pub public_key: Option<Vec<u8>>,
}

impl<'m> Session<'m> {
    fn new(module: &'m Module, options: &'m WriteOptions) -> Self {
        Session {
            module,
            options,
            tables: Tables::new(),
            strings: StringsWriter::new(),
            blobs: BlobWriter::new(),
            guids: GUIDWriter::new(),
            user_strings: UserStringWriter::new(),
            bodies: vec![],
            body_ranges: vec![],
            static_data: StaticDataWriter::default(),
            field_data: vec![],
            resources: ResourceWriter::default(),
            tokens: Tokens::default(),
            debug: vec![],
            public_key: None,
        }
    }

    fn load_public_key(&mut self) -> Result<()> {
        self.public_key = self.module.assembly.as_ref().and_then(|a| a.public_key.clone());

        if let Some(path) = &self.options.key_file {
            if !path.exists() {
                return Err(Error::KeyFileNotFound(path.clone()));
            }
            let key = std::fs::read(path)?;
            debug!(path = %path.display(), len = key.len(), "loaded public key");
            self.public_key = Some(key);
        }

        Ok(())
    }

    fn finish(self) -> Result<Image> {
        let entry_point = self.entry_point_token()?;

        Ok(Image {
            tables: self.tables,
            strings: self.strings.into_vec(),
            blobs: self.blobs.into_vec(),
            guids: self.guids.into_vec(),
            user_strings: self.user_strings.into_vec(),
            bodies: self.bodies,
            body_ranges: self.body_ranges,
            static_data: self.static_data,
            field_data: self.field_data,
            resources: self.resources.into_vec(),
            entry_point,
            metadata_version: self.options.metadata_version.clone(),
            strong_name: self.public_key.is_some(),
        })
    }
}

pub(crate) fn assemble(module: &Module, options: &WriteOptions, collaborators: &mut Collaborators) -> Result<Image> {
    let mut session = Session::new(module, options);
    session.load_public_key()?;

    debug!(module = %module.name, types = module.types.len(), "discovering definitions");
    session.discover()?;

    debug!("encoding method bodies");
    session.encode_bodies()?;

    debug!("populating tables");
    session.populate()?;

    let debug_info = std::mem::take(&mut session.debug);
    let image = session.finish()?;

    if options.debug_symbols {
        match collaborators.symbols.as_deref_mut() {
            Some(writer) => symbols::replay(writer, module, &image, &debug_info)?,
            None => {
                return Err(Error::DebugSymbols(
                    "debug symbols were requested without a symbol writer".to_string(),
                ))
            }
        }
    }

    Ok(image)
}
