//! Shared-memory capability descriptors
//!
//! A [`HandleRef`] is the serializable face of a shared-memory segment: it
//! names the segment and describes its element layout, but carries no
//! lifetime. The reference count lives in the handle table; everything that
//! crosses a wire or is stored inside a [`crate::Concept`] uses `HandleRef`.

use serde::{Deserialize, Serialize};

/// Element types supported by the shared-memory layout.
///
/// Buffers are contiguous, little-endian, row-major for multi-dimensional
/// shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// 32-bit IEEE float
    F32,
    /// 64-bit IEEE float
    F64,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// Unsigned byte
    U8,
}

impl Dtype {
    /// Size of one element in bytes
    pub const fn size_bytes(&self) -> usize {
        match self {
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::F64 | Dtype::I64 => 8,
            Dtype::U8 => 1,
        }
    }

    /// Stable tag used on the task ABI
    pub fn as_str(&self) -> &'static str {
        match self {
            Dtype::F32 => "f32",
            Dtype::F64 => "f64",
            Dtype::I32 => "i32",
            Dtype::I64 => "i64",
            Dtype::U8 => "u8",
        }
    }

    /// Parse a wire tag
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "f32" => Some(Dtype::F32),
            "f64" => Some(Dtype::F64),
            "i32" => Some(Dtype::I32),
            "i64" => Some(Dtype::I64),
            "u8" => Some(Dtype::U8),
            _ => None,
        }
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable capability for a shared-memory segment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleRef {
    /// Globally unique segment name within a process generation
    pub name: String,
    /// Element type of the backing buffer
    pub dtype: Dtype,
    /// Number of elements in the buffer
    pub element_count: usize,
}

impl HandleRef {
    /// Total byte length of the referenced buffer
    pub fn byte_len(&self) -> usize {
        self.element_count * self.dtype.size_bytes()
    }
}

impl std::fmt::Display for HandleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}x{}]", self.name, self.element_count, self.dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_sizes() {
        assert_eq!(Dtype::F32.size_bytes(), 4);
        assert_eq!(Dtype::F64.size_bytes(), 8);
        assert_eq!(Dtype::U8.size_bytes(), 1);
    }

    #[test]
    fn dtype_tags_round_trip() {
        for dt in [Dtype::F32, Dtype::F64, Dtype::I32, Dtype::I64, Dtype::U8] {
            assert_eq!(Dtype::parse(dt.as_str()), Some(dt));
        }
        assert_eq!(Dtype::parse("f16"), None);
    }

    #[test]
    fn handle_byte_len() {
        let h = HandleRef {
            name: "telos-shm-g0-1".to_string(),
            dtype: Dtype::F32,
            element_count: 128,
        };
        assert_eq!(h.byte_len(), 512);
    }
}
