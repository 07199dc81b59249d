//! Supporting utility types.
mod bytestr;

pub use bytestr::ByteStr;

/// Length conversions for wire encoding.
///
/// Lengths are `usize` in rust while iproto wants fixed-width integers;
/// these panic on overflow instead of wrapping.
pub(crate) trait UsizeExt {
    fn to_u32(self) -> u32;
}

impl UsizeExt for usize {
    fn to_u32(self) -> u32 {
        self.try_into().expect("length too large for iproto")
    }
}
