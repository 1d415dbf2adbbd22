//! Logits tensor.
//!
//! The core only ever materializes one tensor: the `[batch, vocab]` logits
//! returned by the backend. KV state is exposed as borrowed views from the
//! cache, never as owned tensors.

use crate::error::{Error, Result};

/// Element type tag. Data is held as `f32` on the host regardless; the tag
/// records what the backend computed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DType {
    #[default]
    F32,
    F16,
    I8,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::I8 => 1,
        }
    }
}

/// Flat float buffer with a `[batch, vocab]` shape.
#[derive(Debug, Clone)]
pub struct Logits {
    data: Vec<f32>,
    batch_size: usize,
    vocab_size: usize,
    dtype: DType,
}

impl Logits {
    /// Create a zero-filled logits tensor.
    pub fn zeros(batch_size: usize, vocab_size: usize) -> Self {
        Self {
            data: vec![0.0; batch_size * vocab_size],
            batch_size,
            vocab_size,
            dtype: DType::F32,
        }
    }

    /// Wrap an existing buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the buffer length does not match
    /// `batch_size * vocab_size`.
    pub fn from_vec(data: Vec<f32>, batch_size: usize, vocab_size: usize) -> Result<Self> {
        if data.len() != batch_size * vocab_size {
            return Err(Error::InvalidConfig(format!(
                "logits buffer has {} elements, expected {}x{}",
                data.len(),
                batch_size,
                vocab_size
            )));
        }
        Ok(Self {
            data,
            batch_size,
            vocab_size,
            dtype: DType::F32,
        })
    }

    /// Set the dtype tag.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    /// Borrow one batch row.
    pub fn row(&self, index: usize) -> Option<&[f32]> {
        if index >= self.batch_size {
            return None;
        }
        let start = index * self.vocab_size;
        Some(&self.data[start..start + self.vocab_size])
    }

    /// Mutable access to one batch row.
    pub fn row_mut(&mut self, index: usize) -> Option<&mut [f32]> {
        if index >= self.batch_size {
            return None;
        }
        let start = index * self.vocab_size;
        Some(&mut self.data[start..start + self.vocab_size])
    }

    /// The full flat buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_access() {
        let logits = Logits::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3).unwrap();
        assert_eq!(logits.row(0).unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(logits.row(1).unwrap(), &[4.0, 5.0, 6.0]);
        assert!(logits.row(2).is_none());
    }

    #[test]
    fn test_shape_mismatch() {
        assert!(Logits::from_vec(vec![0.0; 5], 2, 3).is_err());
    }

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::I8.size_in_bytes(), 1);
    }
}
