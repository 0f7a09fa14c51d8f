//! Deferred destruction of GPU resources.
//!
//! Every frame slot owns one [`DeletionQueue`]. Resources superseded while recording a
//! slot's frame are queued there, tagged with the frame (epoch) that retired them, and
//! only released when the same slot comes around again. The surrounding frame pacing
//! guarantees that at most `frames_in_flight` frames are in flight, so by then the GPU
//! has finished every command that referenced them.
use std::collections::VecDeque;

use crate::device::AccelDevice;

type Releaser<D> = Box<dyn FnOnce(&D)>;

struct Retired<D: ?Sized> {
    epoch: u64,
    releaser: Releaser<D>,
}

pub struct DeletionQueue<D: AccelDevice> {
    entries: VecDeque<Retired<D>>,
}

impl<D: AccelDevice> Default for DeletionQueue<D> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<D: AccelDevice + 'static> DeletionQueue<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Epochs of the queued entries, oldest first.
    pub fn epochs(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|entry| entry.epoch)
    }

    /// Queue `resource` to be handed to `releaser` on the next flush.
    pub fn enqueue<T: 'static>(
        &mut self,
        epoch: u64,
        resource: T,
        releaser: impl FnOnce(&D, T) + 'static,
    ) {
        self.entries.push_back(Retired {
            epoch,
            releaser: Box::new(move |device| releaser(device, resource)),
        });
    }

    pub fn retire_buffer(&mut self, epoch: u64, buffer: D::Buffer) {
        self.enqueue(epoch, buffer, |device, buffer| device.destroy_buffer(buffer));
    }

    pub fn retire_accel_struct(&mut self, epoch: u64, accel_struct: D::AccelStruct) {
        self.enqueue(epoch, accel_struct, |device, accel_struct| {
            device.destroy_accel_struct(accel_struct)
        });
    }

    /// Release every queued resource in the order it was queued.
    ///
    /// `epoch` is the frame now being recorded and `frames_in_flight` the pacing bound;
    /// entries retired less than `frames_in_flight` frames ago indicate a caller bug.
    pub fn flush(&mut self, device: &D, epoch: u64, frames_in_flight: u64) -> usize {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            if entry.epoch + frames_in_flight > epoch {
                tracing::warn!(
                    retired = entry.epoch,
                    epoch,
                    frames_in_flight,
                    "Releasing a resource that may still be in use by the GPU"
                );
            }
            (entry.releaser)(device);
        }
        count
    }

    /// Release everything unconditionally. Only valid once the device is idle.
    pub fn drain(&mut self, device: &D) {
        for entry in self.entries.drain(..) {
            (entry.releaser)(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::mock::{MockDevice, MockEvent};

    #[test]
    fn flush_releases_in_enqueue_order() {
        let device = MockDevice::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut queue = DeletionQueue::<MockDevice>::new();
        for i in 0..3 {
            let order = order.clone();
            queue.enqueue(0, i, move |_, value| order.borrow_mut().push(value));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.flush(&device, 2, 2), 3);
        assert!(queue.is_empty());
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn enqueue_does_not_release() {
        let device = MockDevice::new();
        let buffer = device.buffer(256);
        let id = buffer.id;
        let mut queue = DeletionQueue::<MockDevice>::new();
        queue.retire_buffer(4, buffer);
        assert!(!device.events().contains(&MockEvent::DestroyBuffer(id)));
        assert_eq!(queue.epochs().collect::<Vec<_>>(), vec![4]);
        queue.flush(&device, 6, 2);
        assert!(device.events().contains(&MockEvent::DestroyBuffer(id)));
    }
}
