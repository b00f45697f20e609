//! Typed views over segment bytes
//!
//! A view holds a strong reference to the backing buffer, so bytes stay
//! readable for as long as any view is mapped, even if the table entry was
//! released concurrently. Dropping the view unmaps it.

use crate::table::ShmError;
use parking_lot::RwLock;
use std::sync::Arc;
use telos_kernel::{Dtype, HandleRef};

/// An independent mapping of a shared-memory segment
#[derive(Debug)]
pub struct SegmentView {
    bytes: Arc<RwLock<Vec<u8>>>,
    href: HandleRef,
}

impl SegmentView {
    pub(crate) fn new(bytes: Arc<RwLock<Vec<u8>>>, href: HandleRef) -> Self {
        Self { bytes, href }
    }

    /// Descriptor of the viewed segment
    pub fn href(&self) -> &HandleRef {
        &self.href
    }

    /// Byte length of the segment
    pub fn byte_len(&self) -> usize {
        self.href.byte_len()
    }

    fn expect_dtype(&self, dtype: Dtype) -> crate::Result<()> {
        if self.href.dtype != dtype {
            return Err(ShmError::Invalid(format!(
                "view over {} accessed as {}",
                self.href.dtype, dtype
            )));
        }
        Ok(())
    }

    /// Copy the raw little-endian bytes out of the segment
    pub fn read_bytes(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// Overwrite the raw bytes; length must match exactly
    pub fn write_bytes(&self, data: &[u8]) -> crate::Result<()> {
        let mut guard = self.bytes.write();
        if data.len() != guard.len() {
            return Err(ShmError::Invalid(format!(
                "byte write of {} into segment of {}",
                data.len(),
                guard.len()
            )));
        }
        guard.copy_from_slice(data);
        Ok(())
    }

    /// Decode the segment as f32 elements
    pub fn read_f32(&self) -> crate::Result<Vec<f32>> {
        self.expect_dtype(Dtype::F32)?;
        let guard = self.bytes.read();
        Ok(guard
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Encode f32 elements into the segment; length must match
    pub fn write_f32(&self, data: &[f32]) -> crate::Result<()> {
        self.expect_dtype(Dtype::F32)?;
        if data.len() != self.href.element_count {
            return Err(ShmError::Invalid(format!(
                "write of {} elements into segment of {}",
                data.len(),
                self.href.element_count
            )));
        }
        let mut guard = self.bytes.write();
        for (chunk, value) in guard.chunks_exact_mut(4).zip(data) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    /// Fill every f32 element with one value
    pub fn fill_f32(&self, value: f32) -> crate::Result<()> {
        let data = vec![value; self.href.element_count];
        self.write_f32(&data)
    }

    /// Decode the segment as f64 elements
    pub fn read_f64(&self) -> crate::Result<Vec<f64>> {
        self.expect_dtype(Dtype::F64)?;
        let guard = self.bytes.read();
        Ok(guard
            .chunks_exact(8)
            .map(|c| {
                f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
            })
            .collect())
    }

    /// Encode f64 elements into the segment; length must match
    pub fn write_f64(&self, data: &[f64]) -> crate::Result<()> {
        self.expect_dtype(Dtype::F64)?;
        if data.len() != self.href.element_count {
            return Err(ShmError::Invalid(format!(
                "write of {} elements into segment of {}",
                data.len(),
                self.href.element_count
            )));
        }
        let mut guard = self.bytes.write();
        for (chunk, value) in guard.chunks_exact_mut(8).zip(data) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }
}
