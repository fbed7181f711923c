use std::sync::Arc;

use crate::{BlobCache, Device, DeviceDescriptor, Result};

/// Entry point of the null backend. Devices created from one instance share
/// its blob cache.
#[derive(Debug, Default)]
pub struct Instance {
    blob_cache: Arc<BlobCache>,
}

impl Instance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob_cache(&self) -> &Arc<BlobCache> {
        &self.blob_cache
    }

    pub fn create_device(&self, desc: &DeviceDescriptor<'_>) -> Result<Arc<Device>> {
        Device::new(Arc::clone(&self.blob_cache), desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NativeError;

    #[test]
    fn devices_share_the_blob_cache() {
        let instance = Instance::new();
        let a = instance.create_device(&Default::default()).unwrap();
        let b = instance.create_device(&Default::default()).unwrap();
        a.create_shader_module(None, "shader");
        b.create_shader_module(None, "shader");
        assert_eq!(instance.blob_cache().stats().entries, 1);
    }

    #[test]
    fn invalid_descriptor_is_an_error() {
        let err = Instance::new()
            .create_device(&DeviceDescriptor {
                max_buffer_size: 0,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, NativeError::InvalidDescriptor(_)));
    }
}
