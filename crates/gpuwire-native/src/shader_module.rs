use std::sync::Arc;

use tracing::trace;

use crate::error::ensure;
use crate::{Blob, CacheKey, Device, Result};

/// Shader source accepted by the device. The null backend performs no
/// compilation; identical sources share one cached blob.
#[derive(Debug)]
pub struct ShaderModule {
    label: String,
    cache_key: CacheKey,
    code: Option<Arc<Blob>>,
}

impl ShaderModule {
    pub(crate) fn create(device: &Arc<Device>, label: Option<&str>, code: &str) -> Result<Arc<Self>> {
        device.validate_not_lost()?;
        ensure!(!code.is_empty(), "Shader module code must not be empty");

        let cache_key = CacheKey::of(&("ShaderModule", code));
        let blob = device
            .blob_cache()
            .get_or_insert_with(&cache_key, || Blob::from_vec(code.as_bytes().to_vec()));
        trace!(label = ?label, key = %cache_key, "shader module created");
        Ok(Arc::new(Self {
            label: label.unwrap_or_default().to_owned(),
            cache_key,
            code: Some(blob),
        }))
    }

    pub(crate) fn error(_device: &Arc<Device>, label: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            label: label.unwrap_or_default().to_owned(),
            cache_key: CacheKey::new(),
            code: None,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_valid(&self) -> bool {
        self.code.is_some()
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    pub fn code(&self) -> Option<&str> {
        std::str::from_utf8(self.code.as_deref()?.data()).ok()
    }
}

#[cfg(test)]
mod tests {
    use crate::Instance;

    #[test]
    fn identical_sources_share_a_blob() {
        let instance = Instance::new();
        let device = instance.create_device(&Default::default()).unwrap();
        let a = device.create_shader_module(Some("a"), "fn main() {}");
        let b = device.create_shader_module(Some("b"), "fn main() {}");
        assert!(a.is_valid() && b.is_valid());
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(b.code(), Some("fn main() {}"));
        assert_eq!(instance.blob_cache().stats().entries, 1);
        assert_eq!(instance.blob_cache().stats().hits, 1);
    }

    #[test]
    fn empty_code_is_rejected() {
        let device = Instance::new().create_device(&Default::default()).unwrap();
        assert!(!device.create_shader_module(None, "").is_valid());
    }
}
