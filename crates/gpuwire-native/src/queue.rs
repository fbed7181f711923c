use std::sync::Arc;

use gpuwire_types::{BufferUsage, QueueWorkDoneCallback, QueueWorkDoneStatus};
use tracing::trace;

use crate::error::ensure;
use crate::{Buffer, CallbackStatus, CommandBuffer, Device, Result};

#[derive(Debug)]
pub struct Queue {
    device: Arc<Device>,
}

impl Queue {
    pub(crate) fn new(device: Arc<Device>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Executes `command_buffers` in order as one submission. If any of them
    /// fails validation nothing runs. Every buffer is consumed either way.
    pub fn submit(&self, command_buffers: &[Arc<CommandBuffer>]) {
        let result = self.validate_submit(command_buffers);
        for command_buffer in command_buffers {
            command_buffer.mark_submitted();
        }
        if let Err(err) = result {
            self.device.consume_error(err);
            return;
        }
        if self.device.is_lost() {
            return;
        }

        let command_buffers = command_buffers.to_vec();
        let serial = self.device.submit(move || {
            for command_buffer in &command_buffers {
                command_buffer.execute();
            }
        });
        trace!(%serial, "queue submit");
    }

    fn validate_submit(&self, command_buffers: &[Arc<CommandBuffer>]) -> Result<()> {
        for (i, command_buffer) in command_buffers.iter().enumerate() {
            ensure!(
                !command_buffers[..i]
                    .iter()
                    .any(|other| Arc::ptr_eq(other, command_buffer)),
                "Command buffer \"{}\" appears more than once in a submit",
                command_buffer.label()
            );
            command_buffer.validate_for_submit()?;
        }
        Ok(())
    }

    /// Stages `data` for `buffer`; it lands in the buffer at the next submission.
    pub fn write_buffer(&self, buffer: &Arc<Buffer>, offset: u64, data: &[u8]) {
        if let Err(err) = validate_write(buffer, offset, data.len() as u64) {
            self.device.consume_error(err);
            return;
        }
        if self.device.is_lost() || data.is_empty() {
            return;
        }
        self.device.stage_write(buffer, offset, data);
    }

    pub fn write_buffer_slice<T: bytemuck::Pod>(&self, buffer: &Arc<Buffer>, offset: u64, data: &[T]) {
        self.write_buffer(buffer, offset, bytemuck::cast_slice(data));
    }

    /// Calls `callback` once every submission made so far has completed.
    pub fn on_submitted_work_done(&self, callback: QueueWorkDoneCallback) {
        self.device.enqueue_callback(Box::new(move |status| {
            callback(match status {
                CallbackStatus::Success => QueueWorkDoneStatus::Success,
                CallbackStatus::DeviceLost => QueueWorkDoneStatus::DeviceLost,
                CallbackStatus::Shutdown => QueueWorkDoneStatus::Unknown,
            })
        }));
    }
}

fn validate_write(buffer: &Buffer, offset: u64, size: u64) -> Result<()> {
    ensure!(buffer.is_valid(), "Buffer \"{}\" is invalid", buffer.label());
    ensure!(
        !buffer.is_destroyed(),
        "Buffer \"{}\" written while destroyed",
        buffer.label()
    );
    ensure!(
        !buffer.is_mapped(),
        "Buffer \"{}\" written while mapped",
        buffer.label()
    );
    ensure!(
        buffer.usage().contains(BufferUsage::COPY_DST),
        "Buffer \"{}\" was not created with COPY_DST usage",
        buffer.label()
    );
    ensure!(offset % 4 == 0, "Write offset ({offset}) is not a multiple of 4");
    ensure!(size % 4 == 0, "Write size ({size}) is not a multiple of 4");
    ensure!(
        offset.checked_add(size).is_some_and(|end| end <= buffer.size()),
        "Write range (offset {offset}, size {size}) exceeds buffer size ({})",
        buffer.size()
    );
    Ok(())
}
