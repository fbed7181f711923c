use core::fmt;

/// Index of an object in a per-type table. `0` always means "no object".
pub type ObjectId = u32;

pub const NULL_OBJECT_ID: ObjectId = 0;

/// Identifies a wire-tracked object across the client/server boundary.
///
/// `id` selects a slot in the table for the object's type and `generation`
/// disambiguates reuse of that slot. A handle only resolves while the slot
/// holds an object created with the same generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle {
    pub id: ObjectId,
    pub generation: u32,
}

impl ObjectHandle {
    pub const NULL: ObjectHandle = ObjectHandle {
        id: NULL_OBJECT_ID,
        generation: 0,
    };

    pub const fn new(id: ObjectId, generation: u32) -> Self {
        Self { id, generation }
    }

    pub const fn is_null(self) -> bool {
        self.id == NULL_OBJECT_ID
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.generation)
    }
}

/// Every kind of object that can cross the wire.
///
/// The discriminants are part of the wire format (`DestroyObject` carries
/// them) and must not be renumbered.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectType {
    Device = 0,
    Queue = 1,
    Buffer = 2,
    Texture = 3,
    TextureView = 4,
    ShaderModule = 5,
    CommandEncoder = 6,
    CommandBuffer = 7,
}

impl ObjectType {
    pub const COUNT: usize = 8;

    pub const ALL: [ObjectType; Self::COUNT] = [
        ObjectType::Device,
        ObjectType::Queue,
        ObjectType::Buffer,
        ObjectType::Texture,
        ObjectType::TextureView,
        ObjectType::ShaderModule,
        ObjectType::CommandEncoder,
        ObjectType::CommandBuffer,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Types whose native handles are mapped back to wire ids on the server.
    ///
    /// The native implementation reports device-level events (uncaptured
    /// errors, device loss) with its own handle, so those types need a
    /// reverse table.
    pub const fn is_reverse_lookup(self) -> bool {
        matches!(self, ObjectType::Device | ObjectType::Queue)
    }

    pub const fn name(self) -> &'static str {
        match self {
            ObjectType::Device => "Device",
            ObjectType::Queue => "Queue",
            ObjectType::Buffer => "Buffer",
            ObjectType::Texture => "Texture",
            ObjectType::TextureView => "TextureView",
            ObjectType::ShaderModule => "ShaderModule",
            ObjectType::CommandEncoder => "CommandEncoder",
            ObjectType::CommandBuffer => "CommandBuffer",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
