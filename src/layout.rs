//! Bounds-checked little endian reads over the API set schema
//!
//! Offsets found in the schema are never trusted: every access that would fall outside of the
//! buffer turns into a `WalkError::Validation` instead of a panic.

use crate::common::WalkError;
use dataview::DataView;

#[derive(Clone, Copy)]
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    view: &'a DataView,
    /// what the buffer contains, for error messages
    what: &'a str,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8], what: &'a str) -> Self {
        Self {
            bytes,
            view: DataView::from(bytes),
            what,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    fn out_of_bounds(&self, offset: usize, size: usize) -> WalkError {
        WalkError::Validation(format!(
            "{}: read of {} bytes at offset {:#x} is out of bounds (size {:#x})",
            self.what,
            size,
            offset,
            self.bytes.len()
        ))
    }

    pub(crate) fn u32(&self, offset: usize) -> Result<u32, WalkError> {
        self.view
            .try_read::<u32>(offset)
            .map(u32::from_le)
            .ok_or_else(|| self.out_of_bounds(offset, 4))
    }

    pub(crate) fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8], WalkError> {
        offset
            .checked_add(len)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or_else(|| self.out_of_bounds(offset, len))
    }

    /// UTF-16LE string of `len` bytes starting at `offset`
    pub(crate) fn utf16(&self, offset: usize, len: usize) -> Result<String, WalkError> {
        let raw = self.bytes(offset, len)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| {
            WalkError::Encoding(format!(
                "{}: string at offset {:#x} is not valid UTF-16",
                self.what, offset
            ))
        })
    }
}

/// `base + index * stride`, failing instead of overflowing
pub(crate) fn offset_of(base: usize, index: usize, stride: usize) -> Result<usize, WalkError> {
    index
        .checked_mul(stride)
        .and_then(|o| o.checked_add(base))
        .ok_or_else(|| WalkError::Validation(format!("offset overflow past {:#x}", base)))
}
