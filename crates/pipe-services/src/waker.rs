use std::cell::RefCell;
use std::rc::Rc;

use goldfish_pipe::{ChannelKey, HostEvent, WakeFlags};

pub(crate) type EventQueue = Rc<RefCell<Vec<HostEvent>>>;

/// Handle a service pipe uses to report readiness or hang up without a guest request.
///
/// Events are queued until the device collects them, so calling into the waker from inside a
/// guest-initiated operation is fine.
#[derive(Debug, Clone)]
pub struct HostWaker {
    key: ChannelKey,
    queue: EventQueue,
}

impl HostWaker {
    pub(crate) fn new(key: ChannelKey, queue: EventQueue) -> Self {
        Self { key, queue }
    }

    pub fn key(&self) -> ChannelKey {
        self.key
    }

    pub fn wake(&self, flags: WakeFlags) {
        if flags.is_empty() {
            return;
        }
        self.queue.borrow_mut().push(HostEvent::Wake {
            key: self.key,
            flags,
        });
    }

    pub fn close(&self) {
        self.queue
            .borrow_mut()
            .push(HostEvent::Close { key: self.key });
    }

    /// Drops events for this channel that the device has not collected yet.
    pub fn abort_pending(&self) {
        let key = self.key;
        self.queue.borrow_mut().retain(|event| match event {
            HostEvent::Wake { key: k, .. } | HostEvent::Close { key: k } => *k != key,
        });
    }
}
