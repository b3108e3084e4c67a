use super::*;

/// Maps a Rust scalar type to its [`DType`].
///
/// Implemented only for plain scalars whose in-memory representation is exactly
/// `DTYPE.bytes()` bytes with no padding.
pub trait HasDType: Copy {
    const DTYPE: DType;

    /// Decode one element from native-endian bytes. `bytes.len()` must be `DTYPE.bytes()`.
    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_dtype_ext {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(impl HasDType for $ty {
            const DTYPE: DType = $dtype;

            fn read_ne(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_ne_bytes(raw)
            }
        })*
    };
}

impl_dtype_ext! {
    i8 => DType::Int8, i16 => DType::Int16, i32 => DType::Int32, i64 => DType::Int64,
    u8 => DType::UInt8, u16 => DType::UInt16, u32 => DType::UInt32, u64 => DType::UInt64,
    f32 => DType::Float32, f64 => DType::Float64,
}

impl HasDType for bool {
    const DTYPE: DType = DType::Bool;

    fn read_ne(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}
