// Frame codec: length-prefixed frames of native-order scalars, arrays and blobs.
//
// Every frame is `[u64 byte length][payload]`. Arrays carry no element count of
// their own; readers derive it from the byte length and the expected shape.
use crate::core::error::{Error, ErrorKind};

pub const FRAME_PREFIX_LEN: usize = 8;

mod sealed {
    pub trait Sealed {}
}

/// Fixed-width value that can appear on the wire.
pub trait Scalar: Copy + Default + sealed::Sealed {
    const SIZE: usize;

    fn write_ne(self, out: &mut [u8]);
    fn read_ne(buf: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Scalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn write_ne(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
                }

                fn read_ne(buf: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&buf[..Self::SIZE]);
                    <$ty>::from_ne_bytes(raw)
                }
            }
        )*
    };
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl sealed::Sealed for bool {}

impl Scalar for bool {
    const SIZE: usize = 1;

    fn write_ne(self, out: &mut [u8]) {
        out[0] = self as u8;
    }

    fn read_ne(buf: &[u8]) -> Self {
        buf[0] != 0
    }
}

pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Resumes writing at `pos`, e.g. across separate C ABI calls.
    pub fn at(buf: &'a mut [u8], pos: usize) -> Self {
        let pos = pos.min(buf.len());
        Self { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn write_value<T: Scalar>(&mut self, value: T) -> Result<(), Error> {
        let out = self.reserve(T::SIZE)?;
        value.write_ne(out);
        Ok(())
    }

    pub fn write_array<T: Scalar>(&mut self, values: &[T]) -> Result<(), Error> {
        let byte_len = values
            .len()
            .checked_mul(T::SIZE)
            .ok_or_else(|| self.overflow(usize::MAX))?;
        let out = self.reserve(byte_len)?;
        for (chunk, value) in out.chunks_exact_mut(T::SIZE).zip(values) {
            value.write_ne(chunk);
        }
        Ok(())
    }

    /// Writes a fixed-shape value such as a 4x4 matrix as a single frame.
    pub fn write_fixed<T: Scalar, const N: usize>(&mut self, values: &[T; N]) -> Result<(), Error> {
        self.write_array(values.as_slice())
    }

    /// Writes rows such as `[f32; 3]` positions as one flat array frame.
    pub fn write_rows<T: Scalar, const N: usize>(&mut self, rows: &[[T; N]]) -> Result<(), Error> {
        self.write_array(rows.as_flattened())
    }

    pub fn write_buffer(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let out = self.reserve(bytes.len())?;
        out.copy_from_slice(bytes);
        Ok(())
    }

    /// Writes `text` as a UTF-16LE blob.
    pub fn write_text(&mut self, text: &str) -> Result<(), Error> {
        let units = text.encode_utf16().count();
        let out = self.reserve(units * 2)?;
        for (chunk, unit) in out.chunks_exact_mut(2).zip(text.encode_utf16()) {
            chunk.copy_from_slice(&unit.to_le_bytes());
        }
        Ok(())
    }

    // Capacity is checked before anything is written, so a failed frame leaves no bytes behind.
    fn reserve(&mut self, payload_len: usize) -> Result<&mut [u8], Error> {
        let total = payload_len
            .checked_add(FRAME_PREFIX_LEN)
            .ok_or_else(|| self.overflow(payload_len))?;
        if total > self.remaining() {
            return Err(self.overflow(payload_len));
        }
        let start = self.pos;
        (payload_len as u64).write_ne(&mut self.buf[start..start + FRAME_PREFIX_LEN]);
        self.pos = start + total;
        Ok(&mut self.buf[start + FRAME_PREFIX_LEN..start + total])
    }

    fn overflow(&self, payload_len: usize) -> Error {
        Error::new(ErrorKind::Overflow)
            .with_message(format!(
                "frame of {payload_len} bytes exceeds segment capacity ({} bytes left)",
                self.remaining()
            ))
            .with_offset(self.pos as u64)
    }
}

pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        let pos = pos.min(buf.len());
        Self { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Returns the next frame's payload without copying.
    pub fn read_frame(&mut self) -> Result<&'a [u8], Error> {
        let start = self.pos;
        let remaining = self.buf.len() - start;
        if remaining < FRAME_PREFIX_LEN {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("read past end of message")
                .with_offset(start as u64));
        }
        let len = u64::read_ne(&self.buf[start..start + FRAME_PREFIX_LEN]);
        let len = usize::try_from(len).map_err(|_| frame_too_long(start))?;
        if len > remaining - FRAME_PREFIX_LEN {
            return Err(frame_too_long(start));
        }
        let payload_start = start + FRAME_PREFIX_LEN;
        self.pos = payload_start + len;
        Ok(&self.buf[payload_start..payload_start + len])
    }

    pub fn read_value<T: Scalar>(&mut self) -> Result<T, Error> {
        let start = self.pos;
        let frame = self.read_frame()?;
        if frame.len() != T::SIZE {
            return Err(shape_mismatch(start, frame.len(), T::SIZE));
        }
        Ok(T::read_ne(frame))
    }

    /// Reads an array whose elements are `components` scalars wide.
    pub fn read_array<T: Scalar>(&mut self, components: usize) -> Result<Vec<T>, Error> {
        let start = self.pos;
        let frame = self.read_frame()?;
        let stride = T::SIZE * components.max(1);
        if frame.len() % stride != 0 {
            return Err(shape_mismatch(start, frame.len(), stride));
        }
        Ok(frame.chunks_exact(T::SIZE).map(T::read_ne).collect())
    }

    pub fn read_fixed<T: Scalar, const N: usize>(&mut self) -> Result<[T; N], Error> {
        let start = self.pos;
        let frame = self.read_frame()?;
        if frame.len() != T::SIZE * N {
            return Err(shape_mismatch(start, frame.len(), T::SIZE * N));
        }
        let mut out = [T::default(); N];
        for (slot, chunk) in out.iter_mut().zip(frame.chunks_exact(T::SIZE)) {
            *slot = T::read_ne(chunk);
        }
        Ok(out)
    }

    pub fn read_rows<T: Scalar, const N: usize>(&mut self) -> Result<Vec<[T; N]>, Error> {
        let flat = self.read_array::<T>(N)?;
        Ok(flat
            .chunks_exact(N)
            .map(|row| std::array::from_fn(|index| row[index]))
            .collect())
    }

    pub fn read_buffer(&mut self) -> Result<&'a [u8], Error> {
        self.read_frame()
    }

    /// Reads a UTF-16LE blob; an empty frame yields an empty string.
    pub fn read_text(&mut self) -> Result<String, Error> {
        let start = self.pos;
        let frame = self.read_frame()?;
        decode_utf16le(frame).map_err(|err| err.with_offset(start as u64))
    }
}

pub fn decode_utf16le(bytes: &[u8]) -> Result<String, Error> {
    if bytes.len() % 2 != 0 {
        return Err(Error::new(ErrorKind::Decode).with_message("odd byte count in UTF-16 text"));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|err| {
        Error::new(ErrorKind::Decode)
            .with_message("invalid UTF-16 text")
            .with_source(err)
    })
}

fn frame_too_long(offset: usize) -> Error {
    Error::new(ErrorKind::Corrupt)
        .with_message("frame length exceeds message")
        .with_offset(offset as u64)
}

fn shape_mismatch(offset: usize, actual: usize, expected: usize) -> Error {
    Error::new(ErrorKind::Corrupt)
        .with_message(format!(
            "frame of {actual} bytes does not match expected shape ({expected}-byte units)"
        ))
        .with_offset(offset as u64)
}
