//! Append-only heap writers. Every heap begins with a reserved empty slot and
//! content-addressed heaps return the first offset a value was written at.

use super::{compressed, index};
use crate::utils::align;
use scroll::{ctx::StrCtx, Pread, Pwrite, Result};
use scroll_buffer::DynamicBuffer;
use std::collections::HashMap;

#[derive(Debug)]
pub struct StringsWriter {
    buffer: Vec<u8>,
    cache: HashMap<String, usize>,
}

impl Default for StringsWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl StringsWriter {
    pub const NAME: &'static str = "#Strings";

    pub fn new() -> Self {
        StringsWriter {
            buffer: vec![0],
            cache: HashMap::new(),
        }
    }

    pub fn write(&mut self, value: &str) -> index::String {
        if value.is_empty() {
            return index::String(0);
        }
        if let Some(&offset) = self.cache.get(value) {
            return index::String(offset);
        }

        let offset = self.buffer.len();
        self.buffer.extend_from_slice(value.as_bytes());
        self.buffer.push(0);
        self.cache.insert(value.to_string(), offset);
        index::String(offset)
    }

    pub fn at_index(&self, index::String(idx): index::String) -> Result<&str> {
        self.buffer.pread_with(idx, StrCtx::Delimiter(0))
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.len() <= 1
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

const EMPTY_HEAP: &[u8] = &[0];

// heaps whose entries carry a compressed length prefix
macro_rules! prefixed_heap {
    ($name:ident, $key:ty) => {
        pub struct $name {
            buffer: DynamicBuffer,
            cache: HashMap<$key, usize>,
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            pub fn new() -> Self {
                $name {
                    buffer: DynamicBuffer::with_increment(256),
                    cache: HashMap::new(),
                }
            }

            // the reserved slot is written with the first entry
            fn end(&mut self) -> Result<usize> {
                if self.buffer.get().is_empty() {
                    self.buffer.pwrite_with(0_u8, 0, scroll::LE)?;
                }
                Ok(self.buffer.get().len())
            }

            pub fn len(&self) -> usize {
                self.as_bytes().len()
            }

            pub fn is_empty(&self) -> bool {
                self.len() <= 1
            }

            pub fn as_bytes(&self) -> &[u8] {
                match self.buffer.get() {
                    [] => EMPTY_HEAP,
                    bytes => bytes,
                }
            }

            pub fn into_vec(self) -> Vec<u8> {
                if self.buffer.get().is_empty() {
                    vec![0]
                } else {
                    self.buffer.into_vec()
                }
            }
        }
    };
}

prefixed_heap!(BlobWriter, Vec<u8>);
prefixed_heap!(UserStringWriter, String);

fn read_bytes(bytes: &[u8], idx: usize) -> Result<&[u8]> {
    let mut offset = idx;

    let compressed::Unsigned(size) = bytes.gread(&mut offset)?;

    bytes.pread_with(offset, size as usize)
}

impl BlobWriter {
    pub const NAME: &'static str = "#Blob";

    pub fn write(&mut self, value: &[u8]) -> Result<index::Blob> {
        if value.is_empty() {
            return Ok(index::Blob(0));
        }
        if let Some(&offset) = self.cache.get(value) {
            return Ok(index::Blob(offset));
        }

        let start = self.end()?;
        let mut offset = start;
        self.buffer.gwrite(compressed::Unsigned(value.len() as u32), &mut offset)?;
        self.buffer.gwrite(value, &mut offset)?;
        self.cache.insert(value.to_vec(), start);
        Ok(index::Blob(start))
    }

    pub fn at_index(&self, index::Blob(idx): index::Blob) -> Result<&[u8]> {
        if idx == 0 {
            return Ok(&[]);
        }
        read_bytes(self.as_bytes(), idx)
    }
}

fn is_special(unit: u16) -> bool {
    let [low, high] = unit.to_le_bytes();
    high != 0 || matches!(low, 0x01..=0x08 | 0x0E..=0x1F | 0x27 | 0x2D | 0x7F)
}

impl UserStringWriter {
    pub const NAME: &'static str = "#US";

    pub fn write(&mut self, value: &str) -> Result<usize> {
        if let Some(&offset) = self.cache.get(value) {
            return Ok(offset);
        }

        let units: Vec<u16> = value.encode_utf16().collect();
        let start = self.end()?;
        let offset = &mut { start };

        self.buffer.gwrite(compressed::Unsigned(units.len() as u32 * 2 + 1), offset)?;
        for &u in &units {
            self.buffer.gwrite_with(u, offset, scroll::LE)?;
        }
        self.buffer
            .gwrite_with(u8::from(units.iter().copied().any(is_special)), offset, scroll::LE)?;

        self.cache.insert(value.to_string(), start);
        Ok(start)
    }

    pub fn at_index(&self, idx: usize) -> Result<Vec<u16>> {
        let bytes = read_bytes(self.as_bytes(), idx)?;

        let num_utf16 = bytes.len().saturating_sub(1) / 2;
        let offset = &mut 0;
        (0..num_utf16)
            .map(|_| bytes.gread_with::<u16>(offset, scroll::LE))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct GUIDWriter {
    guids: Vec<[u8; 16]>,
    cache: HashMap<[u8; 16], usize>,
}

impl GUIDWriter {
    pub const NAME: &'static str = "#GUID";

    pub fn new() -> Self {
        Self::default()
    }

    // GUID indices are 1-based, so 0 stays the null GUID
    pub fn write(&mut self, value: [u8; 16]) -> index::GUID {
        if let Some(&idx) = self.cache.get(&value) {
            return index::GUID(idx);
        }
        self.guids.push(value);
        let idx = self.guids.len();
        self.cache.insert(value, idx);
        index::GUID(idx)
    }

    pub fn at_index(&self, index::GUID(idx): index::GUID) -> Option<[u8; 16]> {
        idx.checked_sub(1).and_then(|i| self.guids.get(i)).copied()
    }

    pub fn len(&self) -> usize {
        self.guids.len() * 16
    }

    pub fn is_empty(&self) -> bool {
        self.guids.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.guids.concat()
    }
}

/// Where RVA-mapped field data is placed in the image.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DataSection {
    SData,
    Tls,
    Text,
}

/// Static field data, one buffer per section. Entries are not deduplicated.
#[derive(Debug, Default)]
pub struct StaticDataWriter {
    pub sdata: Vec<u8>,
    pub tls: Vec<u8>,
    pub text: Vec<u8>,
}

impl StaticDataWriter {
    pub fn append(&mut self, bytes: &[u8], section: DataSection) -> u32 {
        let buf = self.section_mut(section);
        align(buf, 8);
        let offset = buf.len() as u32;
        buf.extend_from_slice(bytes);
        offset
    }

    fn section_mut(&mut self, section: DataSection) -> &mut Vec<u8> {
        match section {
            DataSection::SData => &mut self.sdata,
            DataSection::Tls => &mut self.tls,
            DataSection::Text => &mut self.text,
        }
    }

    pub fn section(&self, section: DataSection) -> &[u8] {
        match section {
            DataSection::SData => &self.sdata,
            DataSection::Tls => &self.tls,
            DataSection::Text => &self.text,
        }
    }
}

/// Embedded manifest resources, each a little-endian length followed by the data.
pub struct ResourceWriter {
    buffer: DynamicBuffer,
}

impl Default for ResourceWriter {
    fn default() -> Self {
        ResourceWriter {
            buffer: DynamicBuffer::with_increment(1024),
        }
    }
}

impl ResourceWriter {
    pub fn append(&mut self, data: &[u8]) -> Result<u32> {
        let offset = &mut self.buffer.get().len();
        while *offset % 8 != 0 {
            self.buffer.gwrite_with(0_u8, offset, scroll::LE)?;
        }

        let start = *offset as u32;
        self.buffer.gwrite_with(data.len() as u32, offset, scroll::LE)?;
        self.buffer.gwrite(data, offset)?;
        Ok(start)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.get()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer.into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_dedup() {
        let mut strings = StringsWriter::new();
        assert_eq!(strings.write(""), index::String(0));
        let a = strings.write("System");
        let b = strings.write("Object");
        assert_eq!(a, index::String(1));
        assert_eq!(strings.write("System"), a);
        assert_ne!(a, b);
        assert_eq!(strings.at_index(b).unwrap(), "Object");
        assert_eq!(strings.into_vec(), b"\0System\0Object\0");
    }

    #[test]
    fn blob_dedup() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut blobs = BlobWriter::new();
        let sig = blobs.write(&[0x00, 0x00, 0x01])?;
        let other = blobs.write(&[0x06, 0x08])?;
        assert_eq!(sig, index::Blob(1));
        assert_eq!(blobs.write(&[0x00, 0x00, 0x01])?, sig);
        assert_ne!(sig, other);
        assert_eq!(blobs.at_index(other)?, [0x06, 0x08]);
        assert_eq!(blobs.as_bytes()[0], 0);
        Ok(())
    }

    #[test]
    fn large_blob_prefix() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut blobs = BlobWriter::new();
        let data = vec![0xAB; 200];
        let idx = blobs.write(&data)?;
        assert_eq!(&blobs.as_bytes()[idx.0..idx.0 + 2], [0x80, 200]);
        assert_eq!(blobs.at_index(idx)?, data.as_slice());
        Ok(())
    }

    #[test]
    fn guid_indices() {
        let mut guids = GUIDWriter::new();
        let first = guids.write([1; 16]);
        let second = guids.write([2; 16]);
        assert_eq!(first, index::GUID(1));
        assert_eq!(second, index::GUID(2));
        assert_eq!(guids.write([1; 16]), first);
        assert_eq!(guids.at_index(index::GUID(0)), None);
        assert_eq!(guids.len(), 32);
    }

    #[test]
    fn user_string_flag() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut us = UserStringWriter::new();
        let plain = us.write("hi")?;
        assert_eq!(plain, 1);
        assert_eq!(&us.as_bytes()[1..], [0x05, b'h', 0, b'i', 0, 0]);

        let special = us.write("it's")?;
        assert_eq!(*us.as_bytes().last().unwrap(), 1);
        assert_eq!(us.write("hi")?, plain);
        assert_eq!(String::from_utf16(&us.at_index(special)?)?, "it's");
        Ok(())
    }

    #[test]
    fn static_data_alignment() {
        let mut data = StaticDataWriter::default();
        assert_eq!(data.append(&[1, 2, 3], DataSection::SData), 0);
        assert_eq!(data.append(&[4], DataSection::SData), 8);
        assert_eq!(data.append(&[5], DataSection::Tls), 0);
        assert_eq!(data.section(DataSection::SData).len(), 9);
    }

    #[test]
    fn resources_are_length_prefixed() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut resources = ResourceWriter::default();
        assert_eq!(resources.append(b"abc")?, 0);
        assert_eq!(resources.append(b"d")?, 8);
        assert_eq!(resources.as_bytes()[..7], [3, 0, 0, 0, b'a', b'b', b'c']);
        assert_eq!(resources.as_bytes()[7], 0);
        assert_eq!(resources.into_vec()[8..], [1, 0, 0, 0, b'd']);
        Ok(())
    }
}
