use crate::WireError;

/// Smallest transport allocation that still fits a chunk header and some payload.
pub const MIN_ALLOCATION_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireClientDescriptor {
    /// Largest single `get_cmd_space` request the client makes. Bigger commands
    /// are split into chunks.
    pub max_allocation_size: usize,
    /// Upper bound on reassembled return commands.
    pub max_chunked_command_size: usize,
}

impl Default for WireClientDescriptor {
    fn default() -> Self {
        Self {
            max_allocation_size: 64 * 1024,
            max_chunked_command_size: 256 * 1024 * 1024,
        }
    }
}

impl WireClientDescriptor {
    pub fn validate(&self) -> Result<(), WireError> {
        validate_sizes(self.max_allocation_size, self.max_chunked_command_size)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireServerDescriptor {
    /// Largest single `get_cmd_space` request for return commands.
    pub max_allocation_size: usize,
    /// Upper bound on reassembled client commands.
    pub max_chunked_command_size: usize,
    /// Largest object id a client may allocate, per object type.
    pub max_object_id: u32,
}

impl Default for WireServerDescriptor {
    fn default() -> Self {
        Self {
            max_allocation_size: 64 * 1024,
            max_chunked_command_size: 256 * 1024 * 1024,
            max_object_id: 1 << 20,
        }
    }
}

impl WireServerDescriptor {
    pub fn validate(&self) -> Result<(), WireError> {
        validate_sizes(self.max_allocation_size, self.max_chunked_command_size)?;
        if self.max_object_id == 0 {
            return Err(WireError::InvalidDescriptor("max_object_id must be non-zero"));
        }
        Ok(())
    }
}

fn validate_sizes(max_allocation_size: usize, max_chunked_command_size: usize) -> Result<(), WireError> {
    if max_allocation_size < MIN_ALLOCATION_SIZE {
        return Err(WireError::InvalidDescriptor(
            "max_allocation_size is too small to carry a chunk",
        ));
    }
    if max_allocation_size % 4 != 0 {
        return Err(WireError::InvalidDescriptor(
            "max_allocation_size must be a multiple of 4",
        ));
    }
    if max_chunked_command_size < max_allocation_size {
        return Err(WireError::InvalidDescriptor(
            "max_chunked_command_size must be at least max_allocation_size",
        ));
    }
    Ok(())
}
