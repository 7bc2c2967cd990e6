//! Callback slots and their dispatch queue
//!
//! Each hook is an optional slot. An empty slot swallows the event with a
//! warning so unconfigured channels stay observable in logs.
//!
//! Hooks of one channel never run concurrently, and firing never waits: the
//! first caller drains the channel's [`HookQueue`] while later callers, on
//! any thread or from inside a hook, only enqueue.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Fired once when the channel opens
pub type OpenHook = Arc<dyn Fn() + Send + Sync>;
/// Fired for every application message, in arrival order
pub type MessageHook = Arc<dyn Fn(String) + Send + Sync>;
/// Fired once when the channel closes
pub type CloseHook = Arc<dyn Fn() + Send + Sync>;

/// Names a hook slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// `on_open`
    Open,
    /// `on_message`
    Message,
    /// `on_close`
    Close,
}

#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub(crate) on_open: Option<OpenHook>,
    pub(crate) on_message: Option<MessageHook>,
    pub(crate) on_close: Option<CloseHook>,
}

impl Hooks {
    pub(crate) fn is_set(&self, kind: HookKind) -> bool {
        match kind {
            HookKind::Open => self.on_open.is_some(),
            HookKind::Message => self.on_message.is_some(),
            HookKind::Close => self.on_close.is_some(),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_open", &self.on_open.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

/// One pending hook invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HookEvent {
    Open,
    Message(String),
    Close,
}

#[derive(Debug, Default)]
struct QueueState {
    dispatching: bool,
    pending: VecDeque<HookEvent>,
}

/// Per-channel serializer for hook invocations
#[derive(Debug, Default)]
pub(crate) struct HookQueue {
    state: Mutex<QueueState>,
}

impl HookQueue {
    /// Enqueue `event`. If no dispatcher is active, become it and hand every
    /// queued event to `deliver` in order until the queue is empty.
    pub(crate) fn push(&self, event: HookEvent, mut deliver: impl FnMut(HookEvent)) {
        {
            let mut state = self.state.lock();
            state.pending.push_back(event);
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }

        let _release = ReleaseOnUnwind(self);
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        state.dispatching = false;
                        return;
                    }
                }
            };
            deliver(next);
        }
    }
}

/// Hands dispatch back if a hook panics
struct ReleaseOnUnwind<'a>(&'a HookQueue);

impl Drop for ReleaseOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.state.lock().dispatching = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_events_queue_behind_current() {
        let queue = Arc::new(HookQueue::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_queue = queue.clone();
        let inner_seen = seen.clone();
        queue.push(HookEvent::Message("first".into()), move |event| {
            inner_seen.lock().push(event.clone());
            if event == HookEvent::Message("first".into()) {
                // Re-entrant fire returns at once; the active dispatcher delivers it
                inner_queue.push(HookEvent::Close, |_| unreachable!());
                assert_eq!(inner_seen.lock().len(), 1);
            }
        });

        assert_eq!(
            *seen.lock(),
            vec![HookEvent::Message("first".into()), HookEvent::Close]
        );
    }

    #[test]
    fn test_idle_queue_delivers_immediately() {
        let queue = HookQueue::default();
        let mut seen = Vec::new();
        queue.push(HookEvent::Open, |event| seen.push(event));
        queue.push(HookEvent::Close, |event| seen.push(event));
        assert_eq!(seen, vec![HookEvent::Open, HookEvent::Close]);
    }
}
