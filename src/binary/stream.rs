//! Metadata stream headers and the `#~` table stream (ECMA-335, II.24.2.2 and II.24.2.6).

use super::{
    index::Sizes,
    table::{Kind, Tables},
};
use crate::utils::{align, round_up_to_4};
use bitvec::{order::Lsb0, view::BitView};
use num_traits::FromPrimitive;
use scroll::{ctx::TryIntoCtx, Pwrite};

pub const NAME: &str = "#~";

const HEAP_THRESHOLD: usize = 1 << 16;

#[derive(Debug, Copy, Clone)]
pub struct Header<'a> {
    pub offset: u32,
    pub size: u32,
    pub name: &'a str,
}

impl Header<'_> {
    pub fn size(name: &str) -> usize {
        8 + round_up_to_4(name.len() + 1).0
    }
}

impl TryIntoCtx for Header<'_> {
    type Error = scroll::Error;

    fn try_into_ctx(self, into: &mut [u8], _: ()) -> Result<usize, Self::Error> {
        let offset = &mut 0;

        into.gwrite_with(self.offset, offset, scroll::LE)?;
        into.gwrite_with(self.size, offset, scroll::LE)?;
        into.gwrite(self.name.as_bytes(), offset)?;

        let (padded, _) = round_up_to_4(self.name.len() + 1);
        for _ in self.name.len()..padded {
            into.gwrite_with(0_u8, offset, scroll::LE)?;
        }

        Ok(*offset)
    }
}

/// The HeapSizes byte: bit 0 for #Strings, bit 1 for #GUID, bit 2 for #Blob.
pub fn heap_sizes(strings: usize, guids: usize, blobs: usize) -> u8 {
    let mut mask = 0_u8;
    let bits = mask.view_bits_mut::<Lsb0>();
    bits.set(0, strings >= HEAP_THRESHOLD);
    bits.set(1, guids >= HEAP_THRESHOLD);
    bits.set(2, blobs >= HEAP_THRESHOLD);
    mask
}

/// Serializes the `#~` stream, padded to a 4-byte boundary.
pub fn write_tables(tables: &Tables, heap_sizes: u8) -> Result<Vec<u8>, scroll::Error> {
    let counts = tables.row_counts();
    let present: Vec<u32> = counts.iter().copied().filter(|&c| c != 0).collect();

    let mut out = vec![0_u8; 24 + present.len() * 4];
    let offset = &mut 0;
    out.gwrite_with(0_u32, offset, scroll::LE)?;
    out.gwrite_with(2_u8, offset, scroll::LE)?;
    out.gwrite_with(0_u8, offset, scroll::LE)?;
    out.gwrite_with(heap_sizes, offset, scroll::LE)?;
    out.gwrite_with(1_u8, offset, scroll::LE)?;
    out.gwrite_with(tables.valid_mask(), offset, scroll::LE)?;
    out.gwrite_with(Tables::SORTED_MASK, offset, scroll::LE)?;
    for count in present {
        out.gwrite_with(count, offset, scroll::LE)?;
    }

    let sizes = Sizes {
        heap: heap_sizes.view_bits::<Lsb0>(),
        tables: &counts,
    };
    out.extend(tables.write_rows(sizes)?);
    align(&mut out, 4);

    Ok(out)
}

/// Number of rows each table would serialize, keyed by table kind, for diagnostics.
pub fn summary(tables: &Tables) -> Vec<(Kind, usize)> {
    tables
        .row_counts()
        .iter()
        .enumerate()
        .filter(|&(_, &c)| c != 0)
        .filter_map(|(i, &c)| Kind::from_usize(i).map(|k| (k, c as usize)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::{index, table};

    #[test]
    fn heap_size_flags() {
        assert_eq!(heap_sizes(10, 16, 100), 0);
        assert_eq!(heap_sizes(1 << 16, 16, 100), 0x01);
        assert_eq!(heap_sizes(10, 1 << 16, 1 << 17), 0x06);
    }

    #[test]
    fn stream_header_padding() -> Result<(), scroll::Error> {
        let mut buf = [0xFF_u8; 20];
        let len = buf.pwrite(
            Header {
                offset: 0x6C,
                size: 0x10,
                name: "#Strings",
            },
            0,
        )?;
        assert_eq!(len, Header::size("#Strings"));
        assert_eq!(len, 20);
        assert_eq!(&buf[8..], b"#Strings\0\0\0\0");
        Ok(())
    }

    #[test]
    fn table_stream_layout() -> Result<(), scroll::Error> {
        let mut tables = Tables::new();
        tables.module.push(table::Module {
            generation: 0,
            name: index::String(1),
            mvid: index::GUID(1),
            enc_id: index::GUID(0),
            enc_base_id: index::GUID(0),
        });
        tables.type_def.push(table::TypeDef {
            flags: 0,
            type_name: index::String(10),
            type_namespace: index::String(0),
            extends: index::TypeDefOrRef::Null,
            field_list: index::Simple::new(1),
            method_list: index::Simple::new(1),
        });

        let stream = write_tables(&tables, 0)?;
        assert_eq!(stream[4], 2);
        assert_eq!(stream[7], 1);
        assert_eq!(&stream[8..16], (1_u64 | 1 << 2).to_le_bytes());
        assert_eq!(&stream[16..24], Tables::SORTED_MASK.to_le_bytes());
        assert_eq!(&stream[24..32], [1, 0, 0, 0, 1, 0, 0, 0]);
        // Module row (10 bytes) then TypeDef row (14 bytes), padded
        assert_eq!(stream.len(), 32 + 24);
        assert_eq!(stream.len() % 4, 0);

        assert_eq!(summary(&tables), [(Kind::Module, 1), (Kind::TypeDef, 1)]);
        Ok(())
    }
}
