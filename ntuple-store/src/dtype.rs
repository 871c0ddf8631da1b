use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// The basic element types a dataset can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// Variable-length UTF-8 text.
    Text,
}

impl ElementType {
    /// The width in bytes of one element, or `None` for variable-length types.
    pub const fn byte_width(&self) -> Option<usize> {
        match self {
            Self::Bool | Self::I8 | Self::U8 => Some(1),
            Self::I16 | Self::U16 => Some(2),
            Self::I32 | Self::U32 | Self::F32 => Some(4),
            Self::I64 | Self::U64 | Self::F64 => Some(8),
            Self::Text => None,
        }
    }

    pub const fn is_fixed_width(&self) -> bool {
        self.byte_width().is_some()
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Bytes an element occupies in memory while being transferred.
    ///
    /// Text elements are counted as a fat pointer (16 bytes), whatever their length.
    pub const fn memory_width(&self) -> usize {
        match self.byte_width() {
            Some(width) => width,
            None => 16,
        }
    }
}

impl Display for ElementType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Text => "text",
        };
        write!(f, "{name}")
    }
}

/// The byte order fixed-width elements are stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// The byte order of the host.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    pub fn is_native(&self) -> bool {
        *self == Self::native()
    }
}

impl Display for ByteOrder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Little => write!(f, "le"),
            Self::Big => write!(f, "be"),
        }
    }
}

/// Reverse the bytes of every `width`-sized element in `bytes`, switching its byte order.
pub(crate) fn swap_byte_order(bytes: &mut [u8], width: usize) {
    if width > 1 {
        bytes.chunks_exact_mut(width).for_each(<[u8]>::reverse);
    }
}

/// A Rust type that maps onto a fixed-width [`ElementType`].
pub trait NativeElement: Copy + Default + Send + Sync + 'static {
    const ELEMENT: ElementType;

    /// Append the native-endian bytes of `self` to `out`.
    fn write_ne(&self, out: &mut Vec<u8>);

    /// Decode a value from exactly `ELEMENT.byte_width()` native-endian bytes.
    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! native_element {
    ($T:ty, $element:ident) => {
        impl NativeElement for $T {
            const ELEMENT: ElementType = ElementType::$element;

            #[inline]
            fn write_ne(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }

            #[inline]
            fn read_ne(bytes: &[u8]) -> Self {
                let mut raw = [0u8; size_of::<$T>()];
                raw.copy_from_slice(bytes);
                <$T>::from_ne_bytes(raw)
            }
        }
    };
}

native_element!(i8, I8);
native_element!(i16, I16);
native_element!(i32, I32);
native_element!(i64, I64);
native_element!(u8, U8);
native_element!(u16, U16);
native_element!(u32, U32);
native_element!(u64, U64);
native_element!(f32, F32);
native_element!(f64, F64);

impl NativeElement for bool {
    const ELEMENT: ElementType = ElementType::Bool;

    #[inline]
    fn write_ne(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }

    #[inline]
    fn read_ne(bytes: &[u8]) -> Self {
        bytes.first().is_some_and(|b| *b != 0)
    }
}
