//! PE/COFF layout of an [`Image`] (ECMA-335, II.25).

use crate::{
    binary::cli::{
        Header, RVASize, COMIMAGE_FLAGS_32BITREQUIRED, COMIMAGE_FLAGS_ILONLY, COMIMAGE_FLAGS_STRONGNAMESIGNED,
    },
    emit::WriteOptions,
    error::{Error, Result},
    image::{Image, Layout},
    utils::align,
};
use object::{
    endian::{LittleEndian, U32Bytes},
    pe,
    write::pe::{NtHeaders, Writer},
};
use scroll::Pwrite;
use tracing::debug;

const IMAGE_BASE: u64 = 0x0040_0000;
const SECTION_ALIGNMENT: u32 = 0x2000;
const FILE_ALIGNMENT: u32 = 0x200;

/// Space reserved for a strong-name signature when no signer is present (RSA-1024).
const DEFAULT_SIGNATURE_SIZE: usize = 128;

/// Produces the strong-name signature of a finished image.
pub trait Signer {
    /// Exact length of every signature [`Signer::sign`] returns.
    fn signature_size(&self) -> usize;
    /// Signs the whole file, in which the signature area is zeroed.
    fn sign(&self, image: &[u8]) -> Result<Vec<u8>>;
}

/// Lays an [`Image`] out as an executable file.
pub trait ImageWriter {
    fn write_image(&self, image: &Image, signer: Option<&dyn Signer>) -> Result<Vec<u8>>;
}

/// The default [`ImageWriter`], built on `object`'s PE writer.
#[derive(Debug, Clone)]
pub struct PeWriter {
    is_32_bit: bool,
    is_executable: bool,
    time_date_stamp: u32,
}

impl PeWriter {
    pub fn new(options: &WriteOptions) -> Self {
        PeWriter {
            is_32_bit: options.is_32_bit,
            is_executable: options.is_executable,
            time_date_stamp: options.time_date_stamp,
        }
    }

    /// The `.idata` section importing `mscoree.dll!_CorExeMain`, based at `rva`.
    /// Returns the section bytes, the IAT's RVA and the import directory's RVA.
    fn imports(&self, rva: u32) -> (Vec<u8>, u32, u32) {
        let mut idata = Vec::with_capacity(0x100);
        idata.extend(b"mscoree.dll\0");

        macro_rules! current_rva {
            () => {
                rva + idata.len() as u32
            };
        }

        let hint_name_rva = current_rva!();
        idata.extend(b"\0\0_CorExeMain\0");
        align(&mut idata, 8);

        let lookup_rva = current_rva!();
        let mut lookup_table: Vec<u8> = vec![];
        if self.is_32_bit {
            lookup_table.extend(hint_name_rva.to_le_bytes());
            lookup_table.extend([0; 4]);
        } else {
            lookup_table.extend(u64::from(hint_name_rva).to_le_bytes());
            lookup_table.extend([0; 8]);
        }
        idata.extend_from_slice(&lookup_table);

        let iat_rva = current_rva!();
        idata.extend(lookup_table);

        macro_rules! u32 {
            ($v:expr) => {
                U32Bytes::new(LittleEndian, $v)
            };
        }

        let directory_rva = current_rva!();
        idata.extend_from_slice(object::pod::bytes_of(&pe::ImageImportDescriptor {
            original_first_thunk: u32!(lookup_rva),
            time_date_stamp: u32!(0),
            forwarder_chain: u32!(0),
            name: u32!(rva),
            first_thunk: u32!(iat_rva),
        }));
        idata.extend([0; 20]);

        (idata, iat_rva, directory_rva)
    }
}

impl ImageWriter for PeWriter {
    fn write_image(&self, image: &Image, signer: Option<&dyn Signer>) -> Result<Vec<u8>> {
        let has_sdata = !image.static_data.sdata.is_empty();
        let has_tls = !image.static_data.tls.is_empty();

        let mut num_sections = 1; // .text
        if self.is_executable {
            // .idata and .reloc
            num_sections += 2;
        }
        num_sections += u16::from(has_sdata) + u16::from(has_tls);

        let mut buffer = vec![];
        let mut writer = Writer::new(!self.is_32_bit, SECTION_ALIGNMENT, FILE_ALIGNMENT, &mut buffer);

        writer.reserve_dos_header_and_stub();
        writer.reserve_nt_headers(pe::IMAGE_NUMBEROF_DIRECTORY_ENTRIES);
        writer.reserve_section_headers(num_sections);

        let imports = if self.is_executable {
            let (idata, iat_rva, directory_rva) = self.imports(writer.virtual_len());
            let size = idata.len() as u32;
            // reserve_idata_section would mark the section writable, which the runtime rejects
            let section = writer.reserve_section(
                *b".idata\0\0",
                pe::IMAGE_SCN_CNT_INITIALIZED_DATA | pe::IMAGE_SCN_MEM_READ,
                size,
                size,
            );
            writer.set_data_directory(pe::IMAGE_DIRECTORY_ENTRY_IAT, iat_rva, 8);
            writer.set_data_directory(pe::IMAGE_DIRECTORY_ENTRY_IMPORT, directory_rva, 40);
            Some((idata, section, iat_rva))
        } else {
            None
        };

        // .text: entry stub, bodies, static text data, metadata, resources,
        // strong-name signature, CLI header
        let mut text = vec![];
        if let Some((_, _, iat_rva)) = &imports {
            text.extend([0xFF, 0x25]);
            text.extend((IMAGE_BASE as u32 + iat_rva).to_le_bytes());
        }
        align(&mut text, 4);

        let bodies_offset = text.len();
        text.extend_from_slice(&image.bodies);
        align(&mut text, 8);

        let text_data_offset = text.len();
        text.extend_from_slice(&image.static_data.text);
        align(&mut text, 4);

        // column widths do not depend on RVAs, so the length is final
        let metadata_len = image.metadata()?.len();
        let metadata_offset = text.len();
        text.resize(metadata_offset + metadata_len, 0);

        let resources_offset = text.len();
        text.extend_from_slice(&image.resources);
        align(&mut text, 4);

        let signature = if image.strong_name {
            let size = signer.map_or(DEFAULT_SIGNATURE_SIZE, |s| s.signature_size());
            let offset = text.len();
            text.resize(offset + size, 0);
            align(&mut text, 4);
            Some((offset, size))
        } else {
            None
        };

        let cli_offset = text.len();
        text.resize(cli_offset + Header::SIZE as usize, 0);

        let text_range = writer.reserve_text_section(text.len() as u32);
        let text_rva = text_range.virtual_address;
        let rva = |offset: usize| text_rva + offset as u32;

        let data_characteristics =
            pe::IMAGE_SCN_CNT_INITIALIZED_DATA | pe::IMAGE_SCN_MEM_READ | pe::IMAGE_SCN_MEM_WRITE;
        let sdata = has_sdata.then(|| {
            let len = image.static_data.sdata.len() as u32;
            writer.reserve_section(*b".sdata\0\0", data_characteristics, len, len)
        });
        let tls = has_tls.then(|| {
            let len = image.static_data.tls.len() as u32;
            writer.reserve_section(*b".tls\0\0\0\0", data_characteristics, len, len)
        });

        let layout = Layout {
            bodies: rva(bodies_offset),
            text_data: rva(text_data_offset),
            sdata: sdata.as_ref().map_or(0, |s| s.virtual_address),
            tls: tls.as_ref().map_or(0, |s| s.virtual_address),
        };
        let metadata = image.metadata_at(&layout)?;
        if metadata.len() != metadata_len {
            return Err(Error::Pe(format!(
                "metadata changed size from {} to {} bytes during layout",
                metadata_len,
                metadata.len()
            )));
        }
        text[metadata_offset..metadata_offset + metadata_len].copy_from_slice(&metadata);

        let mut flags = COMIMAGE_FLAGS_ILONLY;
        if self.is_32_bit {
            flags |= COMIMAGE_FLAGS_32BITREQUIRED;
        }
        if signature.is_some() && signer.is_some() {
            flags |= COMIMAGE_FLAGS_STRONGNAMESIGNED;
        }

        let cli_header = Header {
            cb: Header::SIZE,
            major_runtime_version: 2,
            minor_runtime_version: 5,
            metadata: RVASize {
                rva: rva(metadata_offset),
                size: metadata_len as u32,
            },
            flags,
            entry_point_token: image.entry_point,
            resources: match image.resources.len() {
                0 => RVASize::default(),
                size => RVASize {
                    rva: rva(resources_offset),
                    size: size as u32,
                },
            },
            strong_name_signature: match signature {
                Some((offset, size)) => RVASize {
                    rva: rva(offset),
                    size: size as u32,
                },
                None => RVASize::default(),
            },
            ..Header::default()
        };
        text.pwrite_with(cli_header, cli_offset, scroll::LE)?;
        writer.set_data_directory(pe::IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR, rva(cli_offset), Header::SIZE);

        if self.is_executable {
            // the operand of the entry stub's jmp
            writer.add_reloc(text_rva + 2, pe::IMAGE_REL_BASED_HIGHLOW);
            writer.reserve_reloc_section();
        }

        debug!(
            text_rva,
            text_len = text.len(),
            metadata_rva = rva(metadata_offset),
            sdata_rva = layout.sdata,
            "laid out PE sections"
        );

        writer
            .write_dos_header_and_stub()
            .map_err(|e| Error::Pe(e.to_string()))?;
        writer.write_nt_headers(NtHeaders {
            machine: if self.is_32_bit {
                pe::IMAGE_FILE_MACHINE_I386
            } else {
                pe::IMAGE_FILE_MACHINE_AMD64
            },
            time_date_stamp: self.time_date_stamp,
            characteristics: {
                let mut flags = pe::IMAGE_FILE_EXECUTABLE_IMAGE;
                if self.is_32_bit {
                    flags |= pe::IMAGE_FILE_32BIT_MACHINE;
                } else {
                    flags |= pe::IMAGE_FILE_LARGE_ADDRESS_AWARE;
                }
                if !self.is_executable {
                    flags |= pe::IMAGE_FILE_DLL;
                }
                flags
            },
            major_linker_version: 8,
            minor_linker_version: 0,
            address_of_entry_point: if self.is_executable { text_rva } else { 0 },
            image_base: IMAGE_BASE,
            major_operating_system_version: 4,
            minor_operating_system_version: 0,
            major_image_version: 0,
            minor_image_version: 0,
            major_subsystem_version: 4,
            minor_subsystem_version: 0,
            subsystem: pe::IMAGE_SUBSYSTEM_WINDOWS_CUI,
            dll_characteristics: pe::IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE
                | pe::IMAGE_DLLCHARACTERISTICS_NX_COMPAT
                | pe::IMAGE_DLLCHARACTERISTICS_NO_SEH,
            size_of_stack_reserve: 0x0010_0000,
            size_of_stack_commit: 0x1000,
            size_of_heap_reserve: 0x0010_0000,
            size_of_heap_commit: 0x1000,
        });
        writer.write_section_headers();
        if let Some((idata, section, _)) = &imports {
            writer.write_section(section.file_offset, idata);
        }
        writer.write_section(text_range.file_offset, &text);
        if let Some(section) = &sdata {
            writer.write_section(section.file_offset, &image.static_data.sdata);
        }
        if let Some(section) = &tls {
            writer.write_section(section.file_offset, &image.static_data.tls);
        }
        // ignored if no relocs have been added
        writer.write_reloc_section();

        if let (Some((offset, size)), Some(signer)) = (signature, signer) {
            let signed = signer.sign(&buffer)?;
            if signed.len() != size {
                return Err(Error::SigningFailed(format!(
                    "expected a {} byte signature, the signer produced {}",
                    size,
                    signed.len()
                )));
            }
            let start = text_range.file_offset as usize + offset;
            buffer[start..start + size].copy_from_slice(&signed);
            debug!(size, "strong-name signed");
        }

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        emit::Collaborators,
        model::{body::*, members::*, module::*, signature::*, types::*},
    };

    fn program() -> Module {
        let mut module = Module::new("pe.exe");
        module.mvid = [3; 16];
        module.assembly = Some(Assembly::new("pe"));
        let program = module.push_type(TypeNode::new(Some("Demo"), "Program", TypeKind::Class));
        let main = module.push_method(
            program,
            Method::with_body(
                "Main",
                MethodSignature::static_member(TypeSig::Void, vec![]),
                Body::new(Block::new(BlockId(0), vec![])),
            ),
        );
        module.entry_point = Some(main.into());
        module
    }

    fn u16_at(bytes: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([bytes[at], bytes[at + 1]])
    }

    fn cli_flags(bytes: &[u8]) -> Option<u32> {
        // cb = 72 followed by runtime version 2.5
        let at = bytes.windows(8).position(|w| w == [72, 0, 0, 0, 2, 0, 5, 0])?;
        Some(u32::from_le_bytes([bytes[at + 16], bytes[at + 17], bytes[at + 18], bytes[at + 19]]))
    }

    #[test]
    fn pe32_plus_headers() -> Result<()> {
        let options = WriteOptions {
            is_executable: true,
            ..WriteOptions::default()
        };
        let bytes = program().write(&options)?;

        assert_eq!(&bytes[..2], b"MZ");
        let pe_offset = u32::from_le_bytes([bytes[0x3C], bytes[0x3D], bytes[0x3E], bytes[0x3F]]) as usize;
        assert_eq!(&bytes[pe_offset..pe_offset + 4], b"PE\0\0");
        assert_eq!(u16_at(&bytes, pe_offset + 4), pe::IMAGE_FILE_MACHINE_AMD64);
        // idata, text and reloc
        assert_eq!(u16_at(&bytes, pe_offset + 6), 3);
        assert_eq!(u16_at(&bytes, pe_offset + 24), 0x20B);

        assert!(bytes.windows(4).any(|w| w == b"BSJB"));
        assert!(bytes.windows(12).any(|w| w == b"_CorExeMain\0"));
        assert_eq!(cli_flags(&bytes), Some(COMIMAGE_FLAGS_ILONLY));
        // entry point token
        assert!(bytes.windows(4).any(|w| w == 0x0600_0001_u32.to_le_bytes()));
        Ok(())
    }

    #[test]
    fn pe32_library() -> Result<()> {
        let options = WriteOptions {
            is_32_bit: true,
            ..WriteOptions::default()
        };
        let mut module = program();
        module.entry_point = None;
        let bytes = module.write(&options)?;

        let pe_offset = u32::from_le_bytes([bytes[0x3C], bytes[0x3D], bytes[0x3E], bytes[0x3F]]) as usize;
        assert_eq!(u16_at(&bytes, pe_offset + 4), pe::IMAGE_FILE_MACHINE_I386);
        assert_eq!(u16_at(&bytes, pe_offset + 6), 1);
        assert_eq!(u16_at(&bytes, pe_offset + 24), 0x10B);
        assert_ne!(u16_at(&bytes, pe_offset + 22) & pe::IMAGE_FILE_DLL, 0);
        assert_eq!(
            cli_flags(&bytes),
            Some(COMIMAGE_FLAGS_ILONLY | COMIMAGE_FLAGS_32BITREQUIRED)
        );
        assert!(!bytes.windows(12).any(|w| w == b"_CorExeMain\0"));
        Ok(())
    }

    #[test]
    fn static_data_gets_its_own_section() -> Result<()> {
        let mut module = program();
        let holder = module.push_type(TypeNode::new(Some("Demo"), "Data", TypeKind::Class));
        let mut field = Field::static_member("Table", TypeSig::Int32);
        field.initial_value = Some(StaticData {
            data: vec![0xDE, 0xC0, 0xAD, 0x0B],
            section: DataSection::SData,
        });
        module.push_field(holder, field);

        let bytes = module.write(&WriteOptions::default())?;
        assert!(bytes.windows(8).any(|w| w == b".sdata\0\0"));
        assert!(bytes.windows(4).any(|w| w == [0xDE, 0xC0, 0xAD, 0x0B]));
        Ok(())
    }

    struct FixedSigner(usize);

    impl Signer for FixedSigner {
        fn signature_size(&self) -> usize {
            128
        }

        fn sign(&self, image: &[u8]) -> Result<Vec<u8>> {
            // the signature area is still zeroed while signing
            assert!(image.windows(128).any(|w| w.iter().all(|&b| b == 0)));
            Ok(vec![0xAB; self.0])
        }
    }

    fn strong_named() -> Module {
        let mut module = program();
        if let Some(assembly) = &mut module.assembly {
            assembly.public_key = Some(vec![0x5A; 160]);
        }
        module
    }

    #[test]
    fn signature_is_patched_in() -> Result<()> {
        let signer = FixedSigner(128);
        let collaborators = Collaborators {
            symbols: None,
            signer: Some(&signer),
        };
        let bytes = strong_named().write_with(&WriteOptions::default(), collaborators)?;

        assert!(bytes.windows(128).any(|w| w.iter().all(|&b| b == 0xAB)));
        assert_eq!(
            cli_flags(&bytes),
            Some(COMIMAGE_FLAGS_ILONLY | COMIMAGE_FLAGS_STRONGNAMESIGNED)
        );
        Ok(())
    }

    #[test]
    fn delay_signed_without_a_signer() -> Result<()> {
        let bytes = strong_named().write(&WriteOptions::default())?;
        assert_eq!(cli_flags(&bytes), Some(COMIMAGE_FLAGS_ILONLY));
        Ok(())
    }

    #[test]
    fn wrong_signature_length() {
        let signer = FixedSigner(64);
        let collaborators = Collaborators {
            symbols: None,
            signer: Some(&signer),
        };
        let result = strong_named().write_with(&WriteOptions::default(), collaborators);
        assert!(matches!(result, Err(Error::SigningFailed(_))));
    }
}
