use crate::{BufferUsage, TextureFormat, TextureUsage};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferDescriptor<'a> {
    pub label: Option<&'a str>,
    pub usage: BufferUsage,
    pub size: u64,
    pub mapped_at_creation: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDescriptor<'a> {
    pub label: Option<&'a str>,
    pub width: u32,
    pub height: u32,
    pub depth_or_array_layers: u32,
    pub mip_level_count: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl Default for TextureDescriptor<'_> {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
            mip_level_count: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::empty(),
        }
    }
}

/// `format: None` inherits the texture's format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextureViewDescriptor<'a> {
    pub label: Option<&'a str>,
    pub format: Option<TextureFormat>,
    pub base_mip_level: u32,
    /// `0` selects every level from `base_mip_level` to the end.
    pub mip_level_count: u32,
}
