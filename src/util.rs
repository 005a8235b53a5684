//! Small helpers shared across the crate.

use std::{
    io,
    io::Read,
    ops::{Div, Rem},
    sync::Arc,
};

use zerocopy::{FromBytes, FromZeros, IntoBytes};

#[inline(always)]
pub(crate) fn div_rem<T>(x: T, y: T) -> (T, T)
where T: Div<Output = T> + Rem<Output = T> + Copy {
    (x / y, x % y)
}

pub(crate) trait Align {
    fn align_up(self, align: Self) -> Self;

    fn align_down(self, align: Self) -> Self;
}

macro_rules! impl_align {
    ($ty:ident) => {
        impl Align for $ty {
            #[inline(always)]
            fn align_up(self, align: Self) -> Self { (self + (align - 1)) & !(align - 1) }

            #[inline(always)]
            fn align_down(self, align: Self) -> Self { self & !(align - 1) }
        }
    };
}

impl_align!(u16);
impl_align!(u32);
impl_align!(u64);
impl_align!(usize);

/// Creates a fixed-size array reference from a slice.
macro_rules! array_ref {
    ($slice:expr, $offset:expr, $size:expr) => {{
        #[inline(always)]
        fn to_array<T>(slice: &[T]) -> &[T; $size] {
            unsafe { &*(slice as *const [T] as *const [T; $size]) }
        }
        to_array(&$slice[$offset..$offset + $size])
    }};
}
pub(crate) use array_ref;

/// Creates a mutable fixed-size array reference from a slice.
macro_rules! array_ref_mut {
    ($slice:expr, $offset:expr, $size:expr) => {{
        #[inline(always)]
        fn to_array<T>(slice: &mut [T]) -> &mut [T; $size] {
            unsafe { &mut *(slice as *mut [T] as *mut [T; $size]) }
        }
        to_array(&mut $slice[$offset..$offset + $size])
    }};
}
pub(crate) use array_ref_mut;

/// Compile-time assertion.
macro_rules! static_assert {
    ($condition:expr) => {
        const _: () = core::assert!($condition);
    };
}
pub(crate) use static_assert;

#[inline(always)]
pub(crate) fn read_from<T, R>(reader: &mut R) -> io::Result<T>
where
    T: FromBytes + IntoBytes,
    R: Read + ?Sized,
{
    let mut ret = <T>::new_zeroed();
    reader.read_exact(ret.as_mut_bytes())?;
    Ok(ret)
}

/// Decodes a slice of packed structs from a byte buffer.
pub(crate) fn slice_from_bytes<T>(buf: &[u8], count: usize) -> io::Result<Arc<[T]>>
where T: FromBytes + IntoBytes + zerocopy::Immutable {
    let mut ret = <[T]>::new_box_zeroed_with_elems(count)
        .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
    let size = ret.as_bytes().len();
    if buf.len() < size {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    ret.as_mut_bytes().copy_from_slice(&buf[..size]);
    Ok(Arc::from(ret))
}
