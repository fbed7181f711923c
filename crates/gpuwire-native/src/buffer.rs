use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use gpuwire_types::{BufferDescriptor, BufferMapCallback, BufferUsage, MapAsyncStatus, MapMode};
use tracing::trace;

use crate::error::ensure;
use crate::sync::lock;
use crate::{ApiObject, ApiObjectBase, CallbackStatus, Device, NativeError, Result};

enum MapState {
    Unmapped,
    MappedAtCreation,
    Pending {
        id: u64,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: BufferMapCallback,
    },
    Mapped {
        mode: MapMode,
        offset: u64,
        size: u64,
    },
}

impl fmt::Debug for MapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapState::Unmapped => f.write_str("Unmapped"),
            MapState::MappedAtCreation => f.write_str("MappedAtCreation"),
            MapState::Pending { id, mode, .. } => write!(f, "Pending({id}, {mode:?})"),
            MapState::Mapped { mode, .. } => write!(f, "Mapped({mode:?})"),
        }
    }
}

#[derive(Debug)]
struct BufferState {
    contents: Vec<u8>,
    map: MapState,
    next_map_id: u64,
}

/// A linear allocation in host memory.
pub struct Buffer {
    base: ApiObjectBase,
    device: Arc<Device>,
    label: String,
    size: u64,
    usage: BufferUsage,
    valid: bool,
    state: Mutex<BufferState>,
}

impl Buffer {
    pub(crate) fn create(device: &Arc<Device>, desc: &BufferDescriptor<'_>) -> Result<Arc<Self>> {
        device.validate_not_lost()?;
        validate_descriptor(device, desc)?;

        let len = usize::try_from(desc.size)
            .map_err(|_| NativeError::OutOfMemory(format!("Buffer size ({}) is too large", desc.size)))?;
        let mut contents = Vec::new();
        contents.try_reserve_exact(len).map_err(|_| {
            NativeError::OutOfMemory(format!("Failed to allocate {} bytes for a buffer", desc.size))
        })?;
        contents.resize(len, 0);

        trace!(label = ?desc.label, size = desc.size, usage = ?desc.usage, "buffer created");
        Ok(Arc::new(Self {
            base: ApiObjectBase::new(),
            device: Arc::clone(device),
            label: desc.label.unwrap_or_default().to_owned(),
            size: desc.size,
            usage: desc.usage,
            valid: true,
            state: Mutex::new(BufferState {
                contents,
                map: if desc.mapped_at_creation {
                    MapState::MappedAtCreation
                } else {
                    MapState::Unmapped
                },
                next_map_id: 0,
            }),
        }))
    }

    /// Error object standing in for a buffer that failed validation.
    pub(crate) fn error(device: &Arc<Device>, desc: &BufferDescriptor<'_>) -> Arc<Self> {
        Arc::new(Self {
            base: ApiObjectBase::new(),
            device: Arc::clone(device),
            label: desc.label.unwrap_or_default().to_owned(),
            size: desc.size,
            usage: desc.usage,
            valid: false,
            state: Mutex::new(BufferState {
                contents: Vec::new(),
                map: MapState::Unmapped,
                next_map_id: 0,
            }),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_destroyed(&self) -> bool {
        self.base.is_destroyed()
    }

    pub fn is_mapped(&self) -> bool {
        matches!(
            lock(&self.state).map,
            MapState::Mapped { .. } | MapState::MappedAtCreation
        )
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn map_async(
        self: &Arc<Self>,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: BufferMapCallback,
    ) {
        if self.device.is_lost() {
            callback(MapAsyncStatus::DeviceLost);
            return;
        }

        let id = {
            let mut state = lock(&self.state);
            if let Err(err) = self.validate_map_async(&state, mode, offset, size) {
                drop(state);
                self.device.consume_error(err);
                callback(MapAsyncStatus::ValidationError);
                return;
            }
            let id = state.next_map_id;
            state.next_map_id += 1;
            state.map = MapState::Pending {
                id,
                mode,
                offset,
                size,
                callback,
            };
            id
        };

        let buffer = Arc::downgrade(self);
        self.device
            .enqueue_callback(Box::new(move |status| finish_map(&buffer, id, status)));
    }

    fn validate_map_async(
        &self,
        state: &BufferState,
        mode: MapMode,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        ensure!(self.valid, "Buffer \"{}\" is invalid", self.label);
        ensure!(!self.is_destroyed(), "Buffer \"{}\" is destroyed", self.label);
        ensure!(
            matches!(state.map, MapState::Unmapped),
            "Buffer \"{}\" is already mapped or has a pending map",
            self.label
        );
        ensure!(
            mode == MapMode::READ || mode == MapMode::WRITE,
            "Map mode {mode:?} must be exactly READ or WRITE"
        );
        if mode == MapMode::READ {
            ensure!(
                self.usage.contains(BufferUsage::MAP_READ),
                "Buffer \"{}\" was not created with MAP_READ usage",
                self.label
            );
        } else {
            ensure!(
                self.usage.contains(BufferUsage::MAP_WRITE),
                "Buffer \"{}\" was not created with MAP_WRITE usage",
                self.label
            );
        }
        ensure!(offset % 8 == 0, "Map offset ({offset}) is not a multiple of 8");
        ensure!(size % 4 == 0, "Map size ({size}) is not a multiple of 4");
        ensure!(
            offset.checked_add(size).is_some_and(|end| end <= self.size),
            "Map range (offset {offset}, size {size}) exceeds buffer size ({})",
            self.size
        );
        Ok(())
    }

    /// Range of the current mapping, if `[offset, offset + size)` lies inside it.
    fn mapped_range(&self, state: &BufferState, offset: u64, size: u64, write: bool) -> Option<(usize, usize)> {
        let (map_offset, map_size) = match state.map {
            MapState::MappedAtCreation => (0, self.size),
            MapState::Mapped {
                mode,
                offset: mapped_offset,
                size: mapped_size,
            } if !write || mode == MapMode::WRITE => (mapped_offset, mapped_size),
            _ => return None,
        };
        let end = offset.checked_add(size)?;
        if offset < map_offset || end > map_offset + map_size {
            return None;
        }
        Some((usize::try_from(offset).ok()?, usize::try_from(end).ok()?))
    }

    pub fn read_mapped_range(&self, offset: u64, size: u64) -> Option<Vec<u8>> {
        let state = lock(&self.state);
        let (start, end) = self.mapped_range(&state, offset, size, false)?;
        state.contents.get(start..end).map(<[u8]>::to_vec)
    }

    /// Returns `false` unless the range is mapped for writing.
    pub fn write_mapped_range(&self, offset: u64, data: &[u8]) -> bool {
        let mut state = lock(&self.state);
        let Some((start, end)) = self.mapped_range(&state, offset, data.len() as u64, true) else {
            return false;
        };
        match state.contents.get_mut(start..end) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    pub fn unmap(&self) {
        if !self.valid {
            self.device
                .consume_error(NativeError::Validation(format!("Buffer \"{}\" is invalid", self.label)));
            return;
        }
        let previous = std::mem::replace(&mut lock(&self.state).map, MapState::Unmapped);
        if let MapState::Pending { callback, .. } = previous {
            callback(MapAsyncStatus::UnmappedBeforeCallback);
        }
    }

    pub fn destroy(&self) {
        self.device.objects().destroy(self);
    }

    pub(crate) fn validate_usable_in_submit(&self) -> Result<()> {
        ensure!(self.valid, "Buffer \"{}\" is invalid", self.label);
        ensure!(!self.is_destroyed(), "Buffer \"{}\" used in submit while destroyed", self.label);
        ensure!(
            matches!(lock(&self.state).map, MapState::Unmapped),
            "Buffer \"{}\" used in submit while mapped",
            self.label
        );
        Ok(())
    }

    /// Copies `data` into the buffer contents. Callers validate the range.
    pub(crate) fn write_contents(&self, offset: u64, data: &[u8]) {
        let mut state = lock(&self.state);
        let Ok(start) = usize::try_from(offset) else {
            return;
        };
        if let Some(dst) = state.contents.get_mut(start..start + data.len()) {
            dst.copy_from_slice(data);
        }
    }

    pub(crate) fn read_contents(&self, offset: u64, size: u64) -> Vec<u8> {
        let state = lock(&self.state);
        let range = usize::try_from(offset)
            .ok()
            .zip(usize::try_from(size).ok())
            .and_then(|(start, len)| state.contents.get(start..start.checked_add(len)?));
        range.map(<[u8]>::to_vec).unwrap_or_default()
    }
}

fn finish_map(buffer: &Weak<Buffer>, id: u64, status: CallbackStatus) {
    let Some(buffer) = buffer.upgrade() else {
        return;
    };
    let callback = {
        let mut state = lock(&buffer.state);
        match std::mem::replace(&mut state.map, MapState::Unmapped) {
            MapState::Pending {
                id: pending_id,
                mode,
                offset,
                size,
                callback,
            } if pending_id == id => {
                if status == CallbackStatus::Success {
                    state.map = MapState::Mapped { mode, offset, size };
                }
                callback
            }
            other => {
                // Unmapped or destroyed meanwhile; its callback already ran.
                state.map = other;
                return;
            }
        }
    };
    callback(match status {
        CallbackStatus::Success => MapAsyncStatus::Success,
        CallbackStatus::DeviceLost => MapAsyncStatus::DeviceLost,
        CallbackStatus::Shutdown => MapAsyncStatus::DestroyedBeforeCallback,
    });
}

fn validate_descriptor(device: &Device, desc: &BufferDescriptor<'_>) -> Result<()> {
    let usage = desc.usage;
    ensure!(
        BufferUsage::from_bits(usage.bits()).is_some(),
        "Buffer usage {:#x} contains unknown bits",
        usage.bits()
    );
    ensure!(!usage.is_empty(), "Buffer usage must not be empty");
    ensure!(
        !usage.contains(BufferUsage::MAP_READ | BufferUsage::MAP_WRITE),
        "Buffer usage cannot contain both MAP_READ and MAP_WRITE"
    );
    if usage.contains(BufferUsage::MAP_READ) {
        ensure!(
            (usage - BufferUsage::MAP_READ - BufferUsage::COPY_DST).is_empty(),
            "MAP_READ can only be combined with COPY_DST"
        );
    }
    if usage.contains(BufferUsage::MAP_WRITE) {
        ensure!(
            (usage - BufferUsage::MAP_WRITE - BufferUsage::COPY_SRC).is_empty(),
            "MAP_WRITE can only be combined with COPY_SRC"
        );
    }
    ensure!(
        !desc.mapped_at_creation || desc.size % 4 == 0,
        "Buffer size ({}) must be a multiple of 4 when mapped at creation",
        desc.size
    );
    ensure!(
        desc.size <= device.limits().max_buffer_size,
        "Buffer size ({}) exceeds the max buffer size limit ({})",
        desc.size,
        device.limits().max_buffer_size
    );
    Ok(())
}

impl ApiObject for Buffer {
    fn base(&self) -> &ApiObjectBase {
        &self.base
    }

    fn destroy_impl(&self) {
        let previous = {
            let mut state = lock(&self.state);
            state.contents = Vec::new();
            std::mem::replace(&mut state.map, MapState::Unmapped)
        };
        if let MapState::Pending { callback, .. } = previous {
            callback(MapAsyncStatus::DestroyedBeforeCallback);
        }
        trace!(label = %self.label, "buffer destroyed");
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("label", &self.label)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("valid", &self.valid)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
