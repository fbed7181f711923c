use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use gpuwire_types::BufferUsage;
use tracing::trace;

use crate::error::ensure;
use crate::sync::lock;
use crate::{Buffer, Device, NativeError, Result};

#[derive(Debug)]
struct BufferCopy {
    source: Arc<Buffer>,
    source_offset: u64,
    destination: Arc<Buffer>,
    destination_offset: u64,
    size: u64,
}

#[derive(Debug, Default)]
struct EncoderState {
    copies: Vec<BufferCopy>,
    error: Option<NativeError>,
    finished: bool,
}

/// Records copies for later submission. The first recording error is kept and
/// reported when the encoder is finished.
#[derive(Debug)]
pub struct CommandEncoder {
    device: Arc<Device>,
    label: String,
    state: Mutex<EncoderState>,
}

impl CommandEncoder {
    pub(crate) fn new(device: &Arc<Device>, label: Option<&str>) -> Self {
        Self {
            device: Arc::clone(device),
            label: label.unwrap_or_default().to_owned(),
            state: Mutex::new(EncoderState::default()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn copy_buffer_to_buffer(
        &self,
        source: &Arc<Buffer>,
        source_offset: u64,
        destination: &Arc<Buffer>,
        destination_offset: u64,
        size: u64,
    ) {
        let mut state = lock(&self.state);
        if state.finished {
            drop(state);
            self.device.consume_error(NativeError::Validation(format!(
                "Command encoder \"{}\" used after finish",
                self.label
            )));
            return;
        }
        if state.error.is_some() {
            return;
        }
        match validate_copy(source, source_offset, destination, destination_offset, size) {
            Ok(()) => state.copies.push(BufferCopy {
                source: Arc::clone(source),
                source_offset,
                destination: Arc::clone(destination),
                destination_offset,
                size,
            }),
            Err(err) => state.error = Some(err),
        }
    }

    pub fn finish(&self, label: Option<&str>) -> Arc<CommandBuffer> {
        let mut state = lock(&self.state);
        let result = if state.finished {
            Err(NativeError::Validation(format!(
                "Command encoder \"{}\" was already finished",
                self.label
            )))
        } else {
            state.finished = true;
            match state.error.take() {
                Some(err) => Err(err),
                None => Ok(std::mem::take(&mut state.copies)),
            }
        };
        drop(state);

        let label = label.unwrap_or_default().to_owned();
        match result {
            Ok(copies) => {
                trace!(encoder = %self.label, copies = copies.len(), "command buffer finished");
                Arc::new(CommandBuffer::new(label, copies, true))
            }
            Err(err) => {
                self.device.consume_error(err);
                Arc::new(CommandBuffer::new(label, Vec::new(), false))
            }
        }
    }
}

fn validate_copy(
    source: &Buffer,
    source_offset: u64,
    destination: &Buffer,
    destination_offset: u64,
    size: u64,
) -> Result<()> {
    ensure!(source.is_valid(), "Copy source \"{}\" is invalid", source.label());
    ensure!(
        destination.is_valid(),
        "Copy destination \"{}\" is invalid",
        destination.label()
    );
    ensure!(
        !std::ptr::eq(source, destination),
        "Copy source and destination are the same buffer"
    );
    ensure!(
        source.usage().contains(BufferUsage::COPY_SRC),
        "Copy source \"{}\" was not created with COPY_SRC usage",
        source.label()
    );
    ensure!(
        destination.usage().contains(BufferUsage::COPY_DST),
        "Copy destination \"{}\" was not created with COPY_DST usage",
        destination.label()
    );
    ensure!(size % 4 == 0, "Copy size ({size}) is not a multiple of 4");
    ensure!(
        source_offset % 4 == 0 && destination_offset % 4 == 0,
        "Copy offsets ({source_offset}, {destination_offset}) are not multiples of 4"
    );
    ensure!(
        source_offset
            .checked_add(size)
            .is_some_and(|end| end <= source.size()),
        "Copy range (offset {source_offset}, size {size}) overruns the source of size {}",
        source.size()
    );
    ensure!(
        destination_offset
            .checked_add(size)
            .is_some_and(|end| end <= destination.size()),
        "Copy range (offset {destination_offset}, size {size}) overruns the destination of size {}",
        destination.size()
    );
    Ok(())
}

/// Finished, immutable list of recorded commands. May be submitted once.
#[derive(Debug)]
pub struct CommandBuffer {
    label: String,
    copies: Vec<BufferCopy>,
    valid: bool,
    submitted: AtomicBool,
}

impl CommandBuffer {
    fn new(label: String, copies: Vec<BufferCopy>, valid: bool) -> Self {
        Self {
            label,
            copies,
            valid,
            submitted: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    pub(crate) fn validate_for_submit(&self) -> Result<()> {
        ensure!(self.valid, "Command buffer \"{}\" is invalid", self.label);
        ensure!(
            !self.is_submitted(),
            "Command buffer \"{}\" was already submitted",
            self.label
        );
        for copy in &self.copies {
            copy.source.validate_usable_in_submit()?;
            copy.destination.validate_usable_in_submit()?;
        }
        Ok(())
    }

    pub(crate) fn mark_submitted(&self) {
        self.submitted.store(true, Ordering::Release);
    }

    /// Runs the recorded copies against buffer contents.
    pub(crate) fn execute(&self) {
        for copy in &self.copies {
            let data = copy.source.read_contents(copy.source_offset, copy.size);
            copy.destination
                .write_contents(copy.destination_offset, &data);
        }
    }
}
