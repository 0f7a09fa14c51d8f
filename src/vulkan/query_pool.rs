use ash::vk;

use crate::Result;

/// A pool of `ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR` queries.
pub struct QueryPool {
    raw: vk::QueryPool,
    count: u32,
}

impl QueryPool {
    pub fn raw(&self) -> vk::QueryPool {
        self.raw
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub(super) fn new(device: &ash::Device, count: u32) -> Result<Self> {
        let raw = unsafe {
            device.create_query_pool(
                &vk::QueryPoolCreateInfo {
                    query_type: vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    query_count: count,
                    ..Default::default()
                },
                None,
            )?
        };
        Ok(Self { raw, count })
    }

    /// Returns `false` while any of the first `data.len()` queries is unavailable.
    pub(super) fn get_results_u64(&self, device: &ash::Device, data: &mut [u64]) -> Result<bool> {
        debug_assert!(data.len() as u32 <= self.count);
        let result = unsafe {
            device.get_query_pool_results(self.raw, 0, data, vk::QueryResultFlags::TYPE_64)
        };
        match result {
            Ok(()) => Ok(true),
            Err(vk::Result::NOT_READY) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub(super) fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_query_pool(self.raw, None);
        }
    }
}
