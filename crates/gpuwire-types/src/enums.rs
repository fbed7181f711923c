use bitflags::bitflags;
use thiserror::Error;

/// A `u32` read off the wire that does not name any variant of the target enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("unknown {enum_name} value {value}")]
pub struct UnknownEnumValue {
    pub enum_name: &'static str,
    pub value: u32,
}

/// Declares a `#[repr(u32)]` enum together with its checked `u32` conversion.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[repr(u32)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value, )+
        }

        impl TryFrom<u32> for $name {
            type Error = UnknownEnumValue;

            fn try_from(value: u32) -> Result<Self, UnknownEnumValue> {
                match value {
                    $( $value => Ok($name::$variant), )+
                    _ => Err(UnknownEnumValue {
                        enum_name: stringify!($name),
                        value,
                    }),
                }
            }
        }

        impl From<$name> for u32 {
            fn from(value: $name) -> u32 {
                value as u32
            }
        }
    };
}

wire_enum! {
    /// Classification of an error reported by a device.
    pub enum ErrorType {
        NoError = 0,
        Validation = 1,
        OutOfMemory = 2,
        Internal = 3,
        Unknown = 4,
        DeviceLost = 5,
    }
}

impl ErrorType {
    /// Errors that every error scope records on the way to the root.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorType::Internal | ErrorType::Unknown | ErrorType::DeviceLost
        )
    }
}

wire_enum! {
    /// Which errors an error scope captures.
    pub enum ErrorFilter {
        Validation = 0,
        OutOfMemory = 1,
        Internal = 2,
    }
}

impl ErrorFilter {
    pub fn matches(self, ty: ErrorType) -> bool {
        matches!(
            (self, ty),
            (ErrorFilter::Validation, ErrorType::Validation)
                | (ErrorFilter::OutOfMemory, ErrorType::OutOfMemory)
                | (ErrorFilter::Internal, ErrorType::Internal)
        )
    }
}

wire_enum! {
    pub enum DeviceLostReason {
        Unknown = 0,
        Destroyed = 1,
    }
}

wire_enum! {
    pub enum MapAsyncStatus {
        Success = 0,
        ValidationError = 1,
        Unknown = 2,
        DeviceLost = 3,
        DestroyedBeforeCallback = 4,
        UnmappedBeforeCallback = 5,
    }
}

wire_enum! {
    pub enum QueueWorkDoneStatus {
        Success = 0,
        Error = 1,
        Unknown = 2,
        DeviceLost = 3,
    }
}

wire_enum! {
    pub enum TextureFormat {
        R8Unorm = 1,
        Rg8Unorm = 2,
        Rgba8Unorm = 3,
        Bgra8Unorm = 4,
        Rgba16Float = 5,
        Rgba32Float = 6,
        Depth32Float = 7,
    }
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rg8Unorm => 2,
            TextureFormat::Rgba8Unorm | TextureFormat::Bgra8Unorm | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        self == TextureFormat::Depth32Float
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const MAP_READ = 1 << 0;
        const MAP_WRITE = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
        const INDEX = 1 << 4;
        const VERTEX = 1 << 5;
        const UNIFORM = 1 << 6;
        const STORAGE = 1 << 7;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const TEXTURE_BINDING = 1 << 2;
        const STORAGE_BINDING = 1 << 3;
        const RENDER_ATTACHMENT = 1 << 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MapMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}
