//! Compressed integers (ECMA-335, II.23.2).

use crate::utils::{throw, try_into_ctx};
use bitvec::{order::Lsb0, view::BitView};
use scroll::{ctx::TryFromCtx, Pread, Pwrite};

pub const MAX_UNSIGNED: u32 = 0x1FFF_FFFF;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Unsigned(pub u32);

impl Unsigned {
    pub fn len(&self) -> usize {
        match self.0 {
            0..=0x7F => 1,
            0x80..=0x3FFF => 2,
            _ => 4,
        }
    }
}

impl TryFromCtx<'_> for Unsigned {
    type Error = scroll::Error;

    fn try_from_ctx(from: &[u8], _: ()) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;

        let b1: u8 = from.gread_with(offset, scroll::LE)?;

        let value = if b1 >> 7 == 0 {
            b1 as u32
        } else {
            let b2: u8 = from.gread_with(offset, scroll::LE)?;
            if b1 >> 6 == 0b10 {
                u16::from_be_bytes([b1 & 0b0011_1111, b2]) as u32
            } else {
                let b3: u8 = from.gread_with(offset, scroll::LE)?;
                let b4: u8 = from.gread_with(offset, scroll::LE)?;
                u32::from_be_bytes([b1 & 0b0001_1111, b2, b3, b4])
            }
        };

        Ok((Unsigned(value), *offset))
    }
}

try_into_ctx!(Unsigned, |self, into| {
    let offset = &mut 0;

    match self.0 {
        0..=0x7F => {
            into.gwrite_with(self.0 as u8, offset, scroll::BE)?;
        }
        0x80..=0x3FFF => {
            into.gwrite_with(self.0 as u16 | 0x8000, offset, scroll::BE)?;
        }
        0x4000..=MAX_UNSIGNED => {
            into.gwrite_with(self.0 | 0xC000_0000, offset, scroll::BE)?;
        }
        _ => throw!(
            "invalid unsigned compressed integer {:#010x}, range is 0..=0x1FFFFFFF",
            self.0
        ),
    }

    Ok(*offset)
});

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Signed(pub i32);

// the sign bit is rotated into the lowest position of a `bits`-wide field
fn rotate_out(bits: u32, value: i32) -> u32 {
    let mask = (1_u32 << bits) - 1;
    let twos = (value as u32) & mask;
    ((twos << 1) | (twos >> (bits - 1))) & mask
}

fn rotate_in(bits: u32, raw: u32) -> i32 {
    let mask = (1_u32 << bits) - 1;
    let twos = ((raw >> 1) | (raw << (bits - 1))) & mask;
    // sign-extend from `bits` wide
    ((twos << (32 - bits)) as i32) >> (32 - bits)
}

impl TryFromCtx<'_> for Signed {
    type Error = scroll::Error;

    fn try_from_ctx(from: &[u8], _: ()) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;

        let b1: u8 = from.gread_with(offset, scroll::LE)?;

        let value = if b1 >> 7 == 0 {
            rotate_in(7, (b1 & 0b0111_1111) as u32)
        } else {
            let b2: u8 = from.gread_with(offset, scroll::LE)?;
            if b1 >> 6 == 0b10 {
                rotate_in(14, u16::from_be_bytes([b1 & 0b0011_1111, b2]) as u32)
            } else {
                let b3: u8 = from.gread_with(offset, scroll::LE)?;
                let b4: u8 = from.gread_with(offset, scroll::LE)?;
                rotate_in(29, u32::from_be_bytes([b1 & 0b0001_1111, b2, b3, b4]))
            }
        };

        Ok((Signed(value), *offset))
    }
}

try_into_ctx!(Signed, |self, into| {
    let offset = &mut 0;

    if -(1 << 6) <= self.0 && self.0 < (1 << 6) {
        let mut rotated = rotate_out(7, self.0) as u8;
        rotated.view_bits_mut::<Lsb0>().set(7, false);
        into.gwrite_with(rotated, offset, scroll::BE)?;
    } else if -(1 << 13) <= self.0 && self.0 < (1 << 13) {
        let mut rotated = rotate_out(14, self.0) as u16;
        let view = rotated.view_bits_mut::<Lsb0>();
        view.set(15, true);
        view.set(14, false);
        into.gwrite_with(rotated, offset, scroll::BE)?;
    } else if -(1 << 28) <= self.0 && self.0 < (1 << 28) {
        let mut rotated = rotate_out(29, self.0);
        let view = rotated.view_bits_mut::<Lsb0>();
        view.set(31, true);
        view.set(30, true);
        view.set(29, false);
        into.gwrite_with(rotated, offset, scroll::BE)?;
    } else {
        throw!(
            "invalid signed compressed integer {}, range is (-2^28)..=(2^28 - 1)",
            self.0
        );
    }

    Ok(*offset)
});

#[cfg(test)]
mod tests {
    use super::*;
    use scroll_buffer::DynamicBuffer;

    #[test]
    fn compression() {
        macro_rules! case {
            ($ty:ident($val:expr) => [$($byte:literal),+]) => {
                let $ty(val) = [$($byte),+].pread(0).unwrap();
                assert_eq!(val, $val);

                let mut buf = DynamicBuffer::with_increment(4);
                buf.pwrite($ty($val), 0).unwrap();
                assert_eq!(buf.get(), [$($byte),+]);
            }
        }

        case!(Unsigned(0x03) => [0x03]);
        case!(Unsigned(0x7F) => [0x7F]);
        case!(Unsigned(0x80) => [0x80, 0x80]);
        case!(Unsigned(0x3FFF) => [0xBF, 0xFF]);
        case!(Unsigned(0x4000) => [0xC0, 0x00, 0x40, 0x00]);
        case!(Unsigned(0x1FFF_FFFF) => [0xDF, 0xFF, 0xFF, 0xFF]);

        case!(Signed(3) => [0x06]);
        case!(Signed(-3) => [0x7B]);
        case!(Signed(64) => [0x80, 0x80]);
        case!(Signed(-8192) => [0x80, 0x01]);
        case!(Signed(268_435_455) => [0xDF, 0xFF, 0xFF, 0xFE]);
        case!(Signed(-268_435_456) => [0xC0, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn unsigned_round_trip_and_width() {
        for v in [0, 1, 0x7E, 0x7F, 0x80, 0x81, 0x3FFE, 0x3FFF, 0x4000, 0x4001, 0x1234_5678, MAX_UNSIGNED] {
            let mut buf = [0_u8; 4];
            assert_eq!(buf.pwrite(Unsigned(v), 0).unwrap(), Unsigned(v).len());
            let Unsigned(decoded) = buf.pread(0).unwrap();
            assert_eq!(decoded, v);
        }
    }

    #[test]
    fn unsigned_overflow() {
        let mut buf = DynamicBuffer::with_increment(4);
        assert!(buf.pwrite(Unsigned(MAX_UNSIGNED + 1), 0).is_err());
        assert!(buf.get().is_empty());
    }

    #[test]
    fn signed_overflow() {
        let mut buf = [0_u8; 4];
        assert!(buf.pwrite(Signed(1 << 28), 0).is_err());
        assert!(buf.pwrite(Signed(-(1 << 28) - 1), 0).is_err());
    }
}
