use super::stream;
use crate::utils::round_up_to_4;
use scroll::{ctx::TryIntoCtx, Pwrite, SizeWith};

pub const METADATA_SIGNATURE: u32 = 0x424A_5342;

pub const COMIMAGE_FLAGS_ILONLY: u32 = 0x0000_0001;
pub const COMIMAGE_FLAGS_32BITREQUIRED: u32 = 0x0000_0002;
pub const COMIMAGE_FLAGS_STRONGNAMESIGNED: u32 = 0x0000_0008;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Pwrite, SizeWith)]
pub struct RVASize {
    pub rva: u32,
    pub size: u32,
}

/// The CLI header (ECMA-335, II.25.3.3) pointed to by the COM descriptor directory.
#[derive(Debug, Default, Copy, Clone, Pwrite, SizeWith)]
pub struct Header {
    pub cb: u32,
    pub major_runtime_version: u16,
    pub minor_runtime_version: u16,
    pub metadata: RVASize,
    pub flags: u32,
    pub entry_point_token: u32,
    pub resources: RVASize,
    pub strong_name_signature: RVASize,
    pub code_manager_table: RVASize,
    pub vtable_fixups: RVASize,
    pub export_address_table_jumps: RVASize,
    pub managed_native_header: RVASize,
}

impl Header {
    pub const SIZE: u32 = 72;
}

/// The metadata root (ECMA-335, II.24.2.1).
#[derive(Debug)]
pub struct Metadata<'a> {
    pub signature: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub reserved: u32,
    pub version: &'a str,
    pub flags: u16,
    pub stream_headers: Vec<stream::Header<'a>>,
}

impl Metadata<'_> {
    /// Serialized length of the version string: NUL terminated, padded to 4.
    pub fn version_len(version: &str) -> usize {
        round_up_to_4(version.len() + 1).0
    }

    pub fn size(version: &str, stream_names: &[&str]) -> usize {
        20 + Self::version_len(version) + stream_names.iter().map(|n| stream::Header::size(n)).sum::<usize>()
    }
}

impl TryIntoCtx for Metadata<'_> {
    type Error = scroll::Error;

    fn try_into_ctx(self, into: &mut [u8], _: ()) -> Result<usize, Self::Error> {
        let offset = &mut 0;

        into.gwrite_with(self.signature, offset, scroll::LE)?;
        into.gwrite_with(self.major_version, offset, scroll::LE)?;
        into.gwrite_with(self.minor_version, offset, scroll::LE)?;
        into.gwrite_with(self.reserved, offset, scroll::LE)?;

        let length = Metadata::version_len(self.version);
        into.gwrite_with(length as u32, offset, scroll::LE)?;
        into.gwrite(self.version.as_bytes(), offset)?;
        for _ in self.version.len()..length {
            into.gwrite_with(0_u8, offset, scroll::LE)?;
        }

        into.gwrite_with(self.flags, offset, scroll::LE)?;
        into.gwrite_with(self.stream_headers.len() as u16, offset, scroll::LE)?;
        for header in self.stream_headers {
            into.gwrite(header, offset)?;
        }

        Ok(*offset)
    }
}
