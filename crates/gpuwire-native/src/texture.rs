use std::sync::Arc;

use gpuwire_types::{TextureDescriptor, TextureFormat, TextureUsage, TextureViewDescriptor};
use tracing::trace;

use crate::error::ensure;
use crate::{ApiObject, ApiObjectBase, Device, Result};

#[derive(Debug)]
pub struct Texture {
    base: ApiObjectBase,
    device: Arc<Device>,
    label: String,
    width: u32,
    height: u32,
    depth_or_array_layers: u32,
    mip_level_count: u32,
    format: TextureFormat,
    usage: TextureUsage,
    valid: bool,
}

fn max_mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

impl Texture {
    pub(crate) fn create(device: &Arc<Device>, desc: &TextureDescriptor<'_>) -> Result<Arc<Self>> {
        device.validate_not_lost()?;
        let max_dim = device.limits().max_texture_dimension;
        for (name, value) in [
            ("width", desc.width),
            ("height", desc.height),
            ("depthOrArrayLayers", desc.depth_or_array_layers),
        ] {
            ensure!(value >= 1, "Texture {name} must be at least 1");
            ensure!(
                value <= max_dim,
                "Texture {name} ({value}) exceeds the max texture dimension ({max_dim})"
            );
        }
        let max_mips = max_mip_level_count(desc.width, desc.height);
        ensure!(
            desc.mip_level_count >= 1 && desc.mip_level_count <= max_mips,
            "Texture mip level count ({}) must be in [1, {max_mips}]",
            desc.mip_level_count
        );
        ensure!(
            TextureUsage::from_bits(desc.usage.bits()).is_some(),
            "Texture usage {:#x} contains unknown bits",
            desc.usage.bits()
        );
        ensure!(!desc.usage.is_empty(), "Texture usage must not be empty");
        ensure!(
            !(desc.format.is_depth() && desc.usage.contains(TextureUsage::STORAGE_BINDING)),
            "Depth format {:?} cannot be used with STORAGE_BINDING",
            desc.format
        );

        trace!(label = ?desc.label, desc.width, desc.height, format = ?desc.format, "texture created");
        Ok(Arc::new(Self::from_descriptor(device, desc, true)))
    }

    pub(crate) fn error(device: &Arc<Device>, desc: &TextureDescriptor<'_>) -> Arc<Self> {
        Arc::new(Self::from_descriptor(device, desc, false))
    }

    fn from_descriptor(device: &Arc<Device>, desc: &TextureDescriptor<'_>, valid: bool) -> Self {
        Self {
            base: ApiObjectBase::new(),
            device: Arc::clone(device),
            label: desc.label.unwrap_or_default().to_owned(),
            width: desc.width,
            height: desc.height,
            depth_or_array_layers: desc.depth_or_array_layers,
            mip_level_count: desc.mip_level_count,
            format: desc.format,
            usage: desc.usage,
            valid,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn size(&self) -> (u32, u32, u32) {
        (self.width, self.height, self.depth_or_array_layers)
    }

    pub fn mip_level_count(&self) -> u32 {
        self.mip_level_count
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn usage(&self) -> TextureUsage {
        self.usage
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_destroyed(&self) -> bool {
        self.base.is_destroyed()
    }

    pub fn destroy(&self) {
        self.device.objects().destroy(self);
    }

    pub fn create_view(self: &Arc<Self>, desc: &TextureViewDescriptor<'_>) -> Arc<TextureView> {
        match self.validate_view(desc) {
            Ok((format, mip_level_count)) => Arc::new(TextureView {
                texture: Arc::clone(self),
                label: desc.label.unwrap_or_default().to_owned(),
                format,
                base_mip_level: desc.base_mip_level,
                mip_level_count,
                valid: true,
            }),
            Err(err) => {
                self.device.consume_error(err);
                Arc::new(TextureView {
                    texture: Arc::clone(self),
                    label: desc.label.unwrap_or_default().to_owned(),
                    format: desc.format.unwrap_or(self.format),
                    base_mip_level: desc.base_mip_level,
                    mip_level_count: desc.mip_level_count,
                    valid: false,
                })
            }
        }
    }

    fn validate_view(&self, desc: &TextureViewDescriptor<'_>) -> Result<(TextureFormat, u32)> {
        ensure!(self.valid, "Texture \"{}\" is invalid", self.label);
        ensure!(
            desc.base_mip_level < self.mip_level_count,
            "View base mip level ({}) is out of range for a texture with {} levels",
            desc.base_mip_level,
            self.mip_level_count
        );
        let remaining = self.mip_level_count - desc.base_mip_level;
        let count = if desc.mip_level_count == 0 {
            remaining
        } else {
            desc.mip_level_count
        };
        ensure!(
            count <= remaining,
            "View mip level count ({count}) exceeds the {remaining} levels from base {}",
            desc.base_mip_level
        );
        let format = desc.format.unwrap_or(self.format);
        ensure!(
            format == self.format,
            "View format {format:?} does not match texture format {:?}",
            self.format
        );
        Ok((format, count))
    }
}

impl ApiObject for Texture {
    fn base(&self) -> &ApiObjectBase {
        &self.base
    }

    fn destroy_impl(&self) {
        trace!(label = %self.label, "texture destroyed");
    }
}

#[derive(Debug)]
pub struct TextureView {
    texture: Arc<Texture>,
    label: String,
    format: TextureFormat,
    base_mip_level: u32,
    mip_level_count: u32,
    valid: bool,
}

impl TextureView {
    pub fn texture(&self) -> &Arc<Texture> {
        &self.texture
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn mip_levels(&self) -> std::ops::Range<u32> {
        self.base_mip_level..self.base_mip_level + self.mip_level_count
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}
