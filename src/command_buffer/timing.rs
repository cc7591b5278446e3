use std::time::Duration;

use anyhow::Result;
use ash::vk;

use crate::Device;

const BEGIN_QUERY: u32 = 0;
const END_QUERY: u32 = 1;

/// Timestamps written at the start and end of a command buffer.
#[derive(Debug)]
pub(crate) struct GpuTiming {
    pool: vk::QueryPool,
    last: Option<Duration>,
}

impl GpuTiming {
    pub fn new(device: &Device) -> Result<Self> {
        let pool = device.create_query_pool(2)?;
        #[cfg(feature = "log-objects")]
        trace!("Created new VkQueryPool {pool:p}");
        Ok(Self {
            pool,
            last: None,
        })
    }

    pub fn begin(&self, device: &Device, cmd: vk::CommandBuffer) {
        device.cmd_reset_query_pool(cmd, self.pool, BEGIN_QUERY, 2);
        device.cmd_write_timestamp(cmd, vk::PipelineStageFlags::TOP_OF_PIPE, self.pool, BEGIN_QUERY);
    }

    pub fn end(&self, device: &Device, cmd: vk::CommandBuffer) {
        device.cmd_write_timestamp(cmd, vk::PipelineStageFlags::BOTTOM_OF_PIPE, self.pool, END_QUERY);
    }

    /// Read back the timestamps of the last execution. Must only be called once the fence signaled.
    pub fn resolve(&mut self, device: &Device) -> Result<()> {
        let mut results = [0u64; 2];
        if !device.get_query_results(self.pool, BEGIN_QUERY, &mut results)? {
            return Ok(());
        }
        let info = device.info();
        let mask = if info.timestamp_valid_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << info.timestamp_valid_bits) - 1
        };
        let ticks = results[1].wrapping_sub(results[0]) & mask;
        let nanos = ticks as f64 * info.timestamp_period as f64;
        self.last = Some(Duration::from_nanos(nanos as u64));
        Ok(())
    }

    pub fn last(&self) -> Option<Duration> {
        self.last
    }

    pub fn destroy(&self, device: &Device) {
        device.destroy_query_pool(self.pool);
    }
}
