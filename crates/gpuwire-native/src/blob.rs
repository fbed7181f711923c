use std::fmt;

use crate::NativeError;

type Deleter = Box<dyn FnOnce(Vec<u8>) + Send + Sync>;

/// Owned byte buffer whose contents start at a requested alignment.
///
/// An optional deleter receives the backing storage when the blob is dropped,
/// so a pool or cache can take the allocation back.
pub struct Blob {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
    alignment: usize,
    deleter: Option<Deleter>,
}

impl Blob {
    /// Zero-initialized blob of `size` bytes.
    pub fn create(size: usize) -> Self {
        Self {
            storage: vec![0; size],
            offset: 0,
            len: size,
            alignment: 1,
            deleter: None,
        }
    }

    /// Zero-initialized blob whose first byte is aligned to `alignment`.
    pub fn create_aligned(size: usize, alignment: usize) -> Result<Self, NativeError> {
        if !alignment.is_power_of_two() {
            return Err(NativeError::InvalidDescriptor(
                "blob alignment must be a power of two",
            ));
        }
        let padded = size
            .checked_add(alignment - 1)
            .ok_or(NativeError::InvalidDescriptor("blob size overflows"))?;
        let storage = vec![0; padded];
        // `align_offset` on a `u8` pointer always succeeds.
        let offset = storage.as_ptr().align_offset(alignment).min(alignment - 1);
        Ok(Self {
            storage,
            offset,
            len: size,
            alignment,
            deleter: None,
        })
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            storage: data,
            offset: 0,
            len,
            alignment: 1,
            deleter: None,
        }
    }

    pub fn with_deleter(
        data: Vec<u8>,
        deleter: impl FnOnce(Vec<u8>) + Send + Sync + 'static,
    ) -> Self {
        let mut blob = Self::from_vec(data);
        blob.deleter = Some(Box::new(deleter));
        blob
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn data(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }
}

impl Default for Blob {
    fn default() -> Self {
        Self::create(0)
    }
}

impl AsRef<[u8]> for Blob {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("size", &self.len)
            .field("alignment", &self.alignment)
            .field("has_deleter", &self.deleter.is_some())
            .finish()
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        if let Some(deleter) = self.deleter.take() {
            deleter(std::mem::take(&mut self.storage));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn create_write_and_read_back() {
        let mut blob = Blob::create(10);
        for (i, b) in blob.data_mut().iter_mut().enumerate() {
            *b = i as u8 * 3;
        }
        assert_eq!(blob.size(), 10);
        assert!(!blob.is_empty());
        assert_eq!(blob.data(), &[0, 3, 6, 9, 12, 15, 18, 21, 24, 27]);
    }

    #[test]
    fn empty_blob() {
        let blob = Blob::create(0);
        assert!(blob.is_empty());
        assert!(blob.data().is_empty());
    }

    #[test]
    fn aligned_data_starts_on_boundary() {
        for alignment in [1usize, 2, 16, 64, 256] {
            let mut blob = Blob::create_aligned(33, alignment).unwrap();
            assert_eq!(blob.data().as_ptr() as usize % alignment, 0);
            assert_eq!(blob.size(), 33);
            assert_eq!(blob.alignment(), alignment);
            blob.data_mut()[32] = 7;
            assert_eq!(blob.data()[32], 7);
        }
        assert!(Blob::create_aligned(8, 3).is_err());
    }

    #[test]
    fn deleter_receives_storage_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let blob = Blob::with_deleter(vec![1, 2, 3], move |storage| {
            assert_eq!(storage, vec![1, 2, 3]);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(blob.data(), &[1, 2, 3]);
        drop(blob);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
