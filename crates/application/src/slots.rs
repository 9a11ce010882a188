use std::collections::HashMap;

use parking_lot::Mutex;

/// Latest-request-wins bookkeeping per page slot.
///
/// Every render request takes a token for its page. Only the holder of the newest token may
/// publish; older results for the same page are dropped when they arrive.
#[derive(Debug, Default)]
pub struct PageSlots {
    inner: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    next: u64,
    current: HashMap<u32, u64>,
}

impl PageSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, page: u32) -> u64 {
        let mut state = self.inner.lock();
        state.next += 1;
        let token = state.next;
        state.current.insert(page, token);
        token
    }

    pub fn is_current(&self, page: u32, token: u64) -> bool {
        self.inner.lock().current.get(&page) == Some(&token)
    }

    /// Consumes `token`; `true` when its result should be shown.
    pub fn finish(&self, page: u32, token: u64) -> bool {
        let mut state = self.inner.lock();
        if state.current.get(&page) == Some(&token) {
            state.current.remove(&page);
            true
        } else {
            false
        }
    }

    /// Invalidates whatever is in flight for every page.
    pub fn cancel_all(&self) {
        self.inner.lock().current.clear();
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().current.len()
    }
}
