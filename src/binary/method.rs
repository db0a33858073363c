//! Method body headers and exception-handling data sections (ECMA-335, II.25.4).

use crate::utils::{throw, try_into_ctx};
use scroll::{ctx::TryFromCtx, Pread, Pwrite};

pub const FAT_FORMAT: u16 = 0x3;
pub const MORE_SECTS: u16 = 0x8;
pub const INIT_LOCALS: u16 = 0x10;
// fat header size in 4-byte units, stored in the top nibble
const FAT_SIZE_FIELD: u16 = 3 << 12;

const SECTION_EH_TABLE: u8 = 0x01;
const SECTION_FAT_FORMAT: u8 = 0x40;

pub const CLAUSE_TYPED: u32 = 0x0;
pub const CLAUSE_FILTER: u32 = 0x1;
pub const CLAUSE_FINALLY: u32 = 0x2;
pub const CLAUSE_FAULT: u32 = 0x4;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Header {
    Tiny {
        size: usize,
    },
    Fat {
        flags: u16,
        max_stack: u16,
        size: usize,
        local_var_sig_tok: u32,
    },
}

impl Header {
    pub fn len(&self) -> usize {
        match self {
            Header::Tiny { .. } => 1,
            Header::Fat { .. } => 12,
        }
    }
}

impl TryFromCtx<'_> for Header {
    type Error = scroll::Error;

    fn try_from_ctx(from: &[u8], _: ()) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;

        let b1: u8 = from.gread_with(offset, scroll::LE)?;
        let header = if b1 & 0b11 == 2 {
            Header::Tiny {
                size: (b1 >> 2) as usize,
            }
        } else {
            let b2: u8 = from.gread_with(offset, scroll::LE)?;

            Header::Fat {
                flags: ((b2 as u16 & 0b1111) << 8) | b1 as u16,
                max_stack: from.gread_with(offset, scroll::LE)?,
                size: from.gread_with::<u32>(offset, scroll::LE)? as usize,
                local_var_sig_tok: from.gread_with(offset, scroll::LE)?,
            }
        };

        Ok((header, *offset))
    }
}

try_into_ctx!(Header, |self, into| {
    let offset = &mut 0;

    match self {
        Header::Tiny { size } => {
            into.gwrite_with(((size as u8) << 2) | 0x2, offset, scroll::LE)?;
        }
        Header::Fat {
            flags,
            max_stack,
            size,
            local_var_sig_tok,
        } => {
            if size > u32::MAX as usize {
                throw!("method body of {} bytes is too large", size);
            }
            into.gwrite_with(flags | FAT_SIZE_FIELD, offset, scroll::LE)?;
            into.gwrite_with(max_stack, offset, scroll::LE)?;
            into.gwrite_with(size as u32, offset, scroll::LE)?;
            into.gwrite_with(local_var_sig_tok, offset, scroll::LE)?;
        }
    }

    Ok(*offset)
});

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Exception {
    pub flags: u32,
    pub try_offset: usize,
    pub try_length: usize,
    pub handler_offset: usize,
    pub handler_length: usize,
    pub class_token_or_filter: u32,
}

impl Exception {
    fn fits_small(&self) -> bool {
        self.try_offset <= 0xFFFF
            && self.handler_offset <= 0xFFFF
            && self.try_length <= 0xFF
            && self.handler_length <= 0xFF
    }
}

/// Whether the clauses can use the small (thin) section format.
pub fn small_clauses(exceptions: &[Exception]) -> bool {
    4 + exceptions.len() * 12 <= 0xFF && exceptions.iter().all(Exception::fits_small)
}

/// An encoded method: header, code and exception clauses.
#[derive(Debug)]
pub struct Method {
    pub header: Header,
    pub body: Vec<u8>,
    pub exceptions: Vec<Exception>,
}

impl Method {
    /// Picks a tiny header whenever the body allows one.
    pub fn new(
        body: Vec<u8>,
        max_stack: u16,
        local_var_sig_tok: u32,
        init_locals: bool,
        exceptions: Vec<Exception>,
    ) -> Method {
        let size = body.len();

        let header = if size < 64
            && max_stack <= 8
            && local_var_sig_tok == 0
            && !init_locals
            && exceptions.is_empty()
        {
            Header::Tiny { size }
        } else {
            let mut flags = FAT_FORMAT;
            if init_locals {
                flags |= INIT_LOCALS;
            }
            if !exceptions.is_empty() {
                flags |= MORE_SECTS;
            }
            Header::Fat {
                flags,
                max_stack,
                size,
                local_var_sig_tok,
            }
        };

        Method {
            header,
            body,
            exceptions,
        }
    }
}

// a method is written from a 4-byte aligned offset, so its sections stay aligned
try_into_ctx!(&Method, |self, into| {
    let offset = &mut 0;

    into.gwrite(self.header, offset)?;
    into.gwrite(self.body.as_slice(), offset)?;

    if self.exceptions.is_empty() {
        return Ok(*offset);
    }

    while *offset % 4 != 0 {
        into.gwrite_with(0_u8, offset, scroll::LE)?;
    }

    if small_clauses(&self.exceptions) {
        into.gwrite_with(SECTION_EH_TABLE, offset, scroll::LE)?;
        into.gwrite_with((4 + self.exceptions.len() * 12) as u8, offset, scroll::LE)?;
        into.gwrite_with(0_u16, offset, scroll::LE)?;

        for e in &self.exceptions {
            into.gwrite_with(e.flags as u16, offset, scroll::LE)?;
            into.gwrite_with(e.try_offset as u16, offset, scroll::LE)?;
            into.gwrite_with(e.try_length as u8, offset, scroll::LE)?;
            into.gwrite_with(e.handler_offset as u16, offset, scroll::LE)?;
            into.gwrite_with(e.handler_length as u8, offset, scroll::LE)?;
            into.gwrite_with(e.class_token_or_filter, offset, scroll::LE)?;
        }
    } else {
        let length = 4 + self.exceptions.len() * 24;
        if length > 0x00FF_FFFF {
            throw!("{} exception clauses do not fit in one section", self.exceptions.len());
        }

        let [l0, l1, l2, _] = (length as u32).to_le_bytes();
        for b in [SECTION_EH_TABLE | SECTION_FAT_FORMAT, l0, l1, l2] {
            into.gwrite_with(b, offset, scroll::LE)?;
        }

        for e in &self.exceptions {
            for field in [
                e.flags,
                e.try_offset as u32,
                e.try_length as u32,
                e.handler_offset as u32,
                e.handler_length as u32,
                e.class_token_or_filter,
            ] {
                into.gwrite_with(field, offset, scroll::LE)?;
            }
        }
    }

    Ok(*offset)
});

#[cfg(test)]
mod tests {
    use super::*;
    use scroll_buffer::DynamicBuffer;

    fn encode(method: &Method) -> Result<Vec<u8>, scroll::Error> {
        let mut buf = DynamicBuffer::with_increment(16);
        buf.pwrite(method, 0)?;
        Ok(buf.into_vec())
    }

    fn clause(try_offset: usize, handler_offset: usize) -> Exception {
        Exception {
            flags: CLAUSE_TYPED,
            try_offset,
            try_length: 4,
            handler_offset,
            handler_length: 6,
            class_token_or_filter: 0x0100_0001,
        }
    }

    #[test]
    fn tiny_header() -> Result<(), scroll::Error> {
        let method = Method::new(vec![0x2A], 0, 0, false, vec![]);
        assert_eq!(method.header, Header::Tiny { size: 1 });

        assert_eq!(encode(&method)?, [0x06, 0x2A]);
        Ok(())
    }

    #[test]
    fn tiny_limits() {
        assert!(matches!(Method::new(vec![0; 63], 8, 0, false, vec![]).header, Header::Tiny { .. }));
        assert!(matches!(Method::new(vec![0; 64], 8, 0, false, vec![]).header, Header::Fat { .. }));
        assert!(matches!(Method::new(vec![0; 2], 9, 0, false, vec![]).header, Header::Fat { .. }));
        assert!(matches!(Method::new(vec![0; 2], 1, 0x1100_0001, false, vec![]).header, Header::Fat { .. }));
        assert!(matches!(Method::new(vec![0; 2], 1, 0, true, vec![]).header, Header::Fat { .. }));
    }

    #[test]
    fn fat_header_with_small_clauses() -> Result<(), scroll::Error> {
        let method = Method::new(vec![0; 13], 2, 0, false, vec![clause(0, 6)]);
        let heap = encode(&method)?;

        let header: Header = heap.pread(0)?;
        assert_eq!(
            header,
            Header::Fat {
                flags: FAT_FORMAT | MORE_SECTS,
                max_stack: 2,
                size: 13,
                local_var_sig_tok: 0,
            }
        );
        assert_eq!(&heap[..2], [0x0B, 0x30]);

        // 12 + 13 = 25, padded to 28
        assert_eq!(&heap[28..32], [0x01, 16, 0, 0]);
        assert_eq!(heap.len(), 28 + 16);
        Ok(())
    }

    #[test]
    fn fat_clauses_when_offsets_overflow() -> Result<(), scroll::Error> {
        let method = Method::new(vec![0; 4], 1, 0, false, vec![clause(0x1_0000, 0x1_0004)]);
        let heap = encode(&method)?;
        assert_eq!(&heap[16..20], [0x41, 28, 0, 0]);
        assert_eq!(heap.len(), 16 + 28);
        Ok(())
    }

    #[test]
    fn fat_clauses_when_section_overflows() {
        let many = vec![clause(0, 8); 21];
        assert!(!small_clauses(&many));
        assert!(small_clauses(&many[..20]));
    }
}
