use ash::vk;

/// A primary command buffer in the recording state.
pub struct CommandBuffer {
    raw: vk::CommandBuffer,
    /// Allocated from the device's pool and freed once its submission is waited on.
    owned: bool,
}

impl CommandBuffer {
    /// Record into a command buffer owned and submitted by the caller, typically the
    /// frame's main command buffer. It must already be in the recording state.
    pub fn from_raw(raw: vk::CommandBuffer) -> Self {
        Self { raw, owned: false }
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    pub(super) fn begin(device: &ash::Device, pool: vk::CommandPool) -> ash::prelude::VkResult<Self> {
        unsafe {
            let mut raw = vk::CommandBuffer::null();
            (device.fp_v1_0().allocate_command_buffers)(
                device.handle(),
                &vk::CommandBufferAllocateInfo {
                    command_pool: pool,
                    level: vk::CommandBufferLevel::PRIMARY,
                    command_buffer_count: 1,
                    ..Default::default()
                },
                &mut raw,
            )
            .result()?;
            if let Err(err) = device.begin_command_buffer(
                raw,
                &vk::CommandBufferBeginInfo {
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                },
            ) {
                device.free_command_buffers(pool, &[raw]);
                return Err(err);
            }
            Ok(Self { raw, owned: true })
        }
    }

    pub(super) fn owned(&self) -> Option<vk::CommandBuffer> {
        self.owned.then_some(self.raw)
    }
}

/// Work submitted to the queue, signaling `fence` on completion.
pub struct Submission {
    pub(super) fence: vk::Fence,
    pub(super) command_buffer: Option<vk::CommandBuffer>,
}
