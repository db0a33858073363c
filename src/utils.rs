use std::hash::{Hash, Hasher};

macro_rules! throw {
    ($($arg:tt)*) => {
        return Err(scroll::Error::Custom(format!($($arg)*)).into())
    }
}
pub(crate) use throw;

// implements TryIntoCtx for both fixed slices and growable buffers with one body
macro_rules! try_into_ctx {
    ($ty:ty, |$self:ident, $into:ident| $body:expr) => {
        impl scroll::ctx::TryIntoCtx for $ty {
            type Error = scroll::Error;

            fn try_into_ctx($self, $into: &mut [u8], _: ()) -> ::std::result::Result<usize, Self::Error> {
                $body
            }
        }

        impl scroll::ctx::TryIntoCtx<(), scroll_buffer::DynamicBuffer> for $ty {
            type Error = scroll::Error;

            fn try_into_ctx(
                $self,
                $into: &mut scroll_buffer::DynamicBuffer,
                _: (),
            ) -> ::std::result::Result<usize, Self::Error> {
                $body
            }
        }
    };
}
pub(crate) use try_into_ctx;

// builds a u32 flag mask from (condition => bit) pairs
macro_rules! build_bitmask {
    ($($cond:expr => $bit:expr),* $(,)?) => {{
        let mut mask = 0_u32;
        $(
            if $cond {
                mask |= $bit;
            }
        )*
        mask
    }};
}
pub(crate) use build_bitmask;

pub fn round_up_to_4(n: usize) -> (usize, usize) {
    let rem = n % 4;
    if rem == 0 {
        (n, 0)
    } else {
        let pad = 4 - rem;
        (n + pad, pad)
    }
}

pub fn align(buf: &mut Vec<u8>, alignment: usize) {
    let rem = buf.len() % alignment;
    if rem != 0 {
        buf.resize(buf.len() + alignment - rem, 0);
    }
}

pub fn hash(value: impl Hash) -> u64 {
    let mut state = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut state);
    state.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_up_to_4(0), (0, 0));
        assert_eq!(round_up_to_4(5), (8, 3));
        assert_eq!(round_up_to_4(12), (12, 0));

        let mut buf = vec![1, 2, 3, 4, 5];
        align(&mut buf, 4);
        assert_eq!(buf, [1, 2, 3, 4, 5, 0, 0, 0]);
    }

    #[test]
    fn bitmask() {
        let public = true;
        let sealed = false;
        assert_eq!(build_bitmask!(public => 0x1, sealed => 0x100, true => 0x2000), 0x2001);
    }
}
