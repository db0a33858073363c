//! The finished tables, heaps and data buffers of one module.

use crate::{
    binary::{
        cli::{Metadata, METADATA_SIGNATURE},
        heap::{BlobWriter, DataSection, GUIDWriter, StaticDataWriter, StringsWriter, UserStringWriter},
        index::{self, Token, TokenTarget},
        stream,
        table::{Kind, Tables},
    },
    emit::symbols::MetadataNames,
    error::Result,
    utils::{align, round_up_to_4},
};
use scroll::{ctx::StrCtx, Pread, Pwrite};
use std::ops::Range;

/// Everything the metadata root and a PE writer need. RVAs in the tables are
/// left at zero until [`Image::metadata_at`] patches them for a layout.
#[derive(Debug)]
pub struct Image {
    pub tables: Tables,
    pub strings: Vec<u8>,
    pub blobs: Vec<u8>,
    pub guids: Vec<u8>,
    pub user_strings: Vec<u8>,
    /// Encoded method bodies, each 4-byte aligned.
    pub bodies: Vec<u8>,
    /// Range in [`Image::bodies`] of each MethodDef row's body, 0-based.
    pub body_ranges: Vec<Option<Range<usize>>>,
    pub static_data: StaticDataWriter,
    /// Section and section-relative offset of each FieldRVA row, in row order.
    pub field_data: Vec<(DataSection, u32)>,
    pub resources: Vec<u8>,
    pub entry_point: u32,
    pub metadata_version: String,
    pub strong_name: bool,
}

/// Where the image's buffers were placed, as RVAs.
#[derive(Debug, Default, Copy, Clone)]
pub struct Layout {
    pub bodies: u32,
    pub text_data: u32,
    pub sdata: u32,
    pub tls: u32,
}

impl Layout {
    fn section(&self, section: DataSection) -> u32 {
        match section {
            DataSection::SData => self.sdata,
            DataSection::Tls => self.tls,
            DataSection::Text => self.text_data,
        }
    }
}

impl Image {
    /// The encoded body (header, code and exception sections) of a MethodDef row.
    pub fn method_body(&self, row: usize) -> Option<&[u8]> {
        let range = self.body_ranges.get(row.checked_sub(1)?)?.clone()?;
        self.bodies.get(range)
    }

    /// Serializes the metadata root with method body offsets standing in for RVAs.
    pub fn metadata(&self) -> Result<Vec<u8>> {
        self.metadata_at(&Layout::default())
    }

    pub fn metadata_at(&self, layout: &Layout) -> Result<Vec<u8>> {
        let mut tables = self.tables.clone();
        for (row, range) in tables.method_def.iter_mut().zip(&self.body_ranges) {
            row.rva = match range {
                Some(r) => layout.bodies + r.start as u32,
                None => 0,
            };
        }
        for (row, &(section, offset)) in tables.field_rva.iter_mut().zip(&self.field_data) {
            row.rva = layout.section(section) + offset;
        }

        let heap_sizes = stream::heap_sizes(self.strings.len(), self.guids.len(), self.blobs.len());
        let table_stream = stream::write_tables(&tables, heap_sizes)?;

        let mut streams: Vec<(&str, &[u8])> = vec![
            (stream::NAME, &table_stream[..]),
            (StringsWriter::NAME, &self.strings[..]),
        ];
        if self.user_strings.len() > 1 {
            streams.push((UserStringWriter::NAME, &self.user_strings[..]));
        }
        if !self.guids.is_empty() {
            streams.push((GUIDWriter::NAME, &self.guids[..]));
        }
        streams.push((BlobWriter::NAME, &self.blobs[..]));

        let names: Vec<&str> = streams.iter().map(|&(name, _)| name).collect();
        let root_size = Metadata::size(&self.metadata_version, &names);

        let mut offset = root_size;
        let stream_headers = streams
            .iter()
            .map(|&(name, data)| {
                let (size, _) = round_up_to_4(data.len());
                let header = stream::Header {
                    offset: offset as u32,
                    size: size as u32,
                    name,
                };
                offset += size;
                header
            })
            .collect();

        let mut out = vec![0_u8; root_size];
        out.pwrite(
            Metadata {
                signature: METADATA_SIGNATURE,
                major_version: 1,
                minor_version: 1,
                reserved: 0,
                version: &self.metadata_version,
                flags: 0,
                stream_headers,
            },
            0,
        )?;
        for (_, data) in streams {
            out.extend_from_slice(data);
            align(&mut out, 4);
        }

        Ok(out)
    }

    fn string(&self, index::String(i): index::String) -> Option<String> {
        self.strings
            .pread_with::<&str>(i, StrCtx::Delimiter(0))
            .ok()
            .map(str::to_string)
    }

    fn row(token: u32, kind: Kind) -> Option<usize> {
        match Token::decode(token).ok()? {
            Token {
                target: TokenTarget::Table(k),
                index,
            } if k == kind && index > 0 => Some(index - 1),
            _ => None,
        }
    }
}

impl MetadataNames for Image {
    fn type_name(&self, token: u32) -> Option<String> {
        let row = self.tables.type_def.get(Self::row(token, Kind::TypeDef)?)?;
        let name = self.string(row.type_name)?;
        Some(match self.string(row.type_namespace) {
            Some(ns) if !ns.is_empty() => format!("{}.{}", ns, name),
            _ => name,
        })
    }

    fn method_name(&self, token: u32) -> Option<String> {
        let row = self.tables.method_def.get(Self::row(token, Kind::MethodDef)?)?;
        self.string(row.name)
    }

    fn method_parent(&self, token: u32) -> Option<u32> {
        let method = Self::row(token, Kind::MethodDef)? + 1;
        if method > self.tables.method_def.len() {
            return None;
        }
        // the owner is the last type whose method list starts at or before the row
        let owner = self
            .tables
            .type_def
            .iter()
            .rposition(|t| t.method_list.0 != 0 && t.method_list.0 <= method)?;
        Token::new(Kind::TypeDef, owner + 1).encode().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        emit::WriteOptions,
        model::{
            body::*,
            members::*,
            module::*,
            signature::*,
            types::{TypeKind, TypeNode},
        },
    };

    fn sample() -> Module {
        let mut module = Module::new("image.dll");
        module.mvid = [7; 16];
        module.push_type(TypeNode::new(Some("Demo"), "Empty", TypeKind::Class));
        let program = module.push_type(TypeNode::new(Some("Demo"), "Program", TypeKind::Class));
        let body = Body::new(Block::new(
            BlockId(0),
            vec![Statement::Expression(Expression::string("hi"))],
        ));
        module.push_method(
            program,
            Method::with_body("Main", MethodSignature::static_member(TypeSig::Void, vec![]), body),
        );
        module.push_method(program, Method::new("Other", MethodSignature::static_member(TypeSig::Void, vec![])));
        module
    }

    #[test]
    fn metadata_streams() -> Result<()> {
        let image = sample().assemble(&WriteOptions::default())?;
        let metadata = image.metadata()?;

        assert_eq!(&metadata[..4], b"BSJB");
        assert_eq!(metadata.len() % 4, 0);
        // "Standard CLI 2005" plus NUL, padded to 20
        assert_eq!(&metadata[12..16], [20, 0, 0, 0]);
        // #~, #Strings, #US, #GUID and #Blob
        assert_eq!(&metadata[38..40], [5, 0]);
        for name in ["#~", "#Strings", "#US", "#GUID", "#Blob"] {
            let needle = format!("{}\0", name);
            assert!(metadata.windows(needle.len()).any(|w| w == needle.as_bytes()));
        }
        Ok(())
    }

    #[test]
    fn body_rvas_follow_layout() -> Result<()> {
        let image = sample().assemble(&WriteOptions::default())?;
        assert_eq!(image.method_body(2), None);
        // ldstr; pop; ret
        assert_eq!(image.method_body(1).map(<[u8]>::len), Some(1 + 5 + 1 + 1));

        let layout = Layout {
            bodies: 0x2050,
            ..Layout::default()
        };
        let first = image.metadata_at(&layout)?;
        let second = image.metadata_at(&layout)?;
        assert_eq!(first, second);
        assert!(first.windows(4).any(|w| w == 0x2050_u32.to_le_bytes()));
        Ok(())
    }

    #[test]
    fn metadata_names() -> Result<()> {
        let image = sample().assemble(&WriteOptions::default())?;

        assert_eq!(image.method_name(0x0600_0002).as_deref(), Some("Other"));
        assert_eq!(image.method_parent(0x0600_0001), Some(0x0200_0003));
        assert_eq!(image.type_name(0x0200_0003).as_deref(), Some("Demo.Program"));
        assert_eq!(image.type_name(0x0200_0001).as_deref(), Some("<Module>"));
        assert_eq!(image.method_parent(0x0600_0003), None);
        assert_eq!(image.type_name(0x0600_0001), None);
        Ok(())
    }
}
