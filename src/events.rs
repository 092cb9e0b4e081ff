//! Unsolicited device events feed a state cache and fan out to
//! observers.
//!
//! Event payloads (the part after the event sentinel) come in three
//! shapes:
//!
//! - `buttons:<mask>`: full button state broadcast,
//! - `button:<index>:<0|1>`: one button released/pressed,
//! - `lock:<name>:<0|1>`: a lock target disengaged/engaged.
//!
//! Anything else is logged and discarded; a garbled event never
//! reaches the cache and never brings down the read loop.

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tracing::{trace, warn};

/// One button transition, as delivered to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    /// Button index; bit position in the device's button mask.
    pub button: u8,

    /// Pressed or released.
    pub pressed: bool,
}

/// Snapshot of the cached device state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    /// Button bitmask, bit 0 = first button.
    pub buttons: u8,

    /// Lock-target name to engaged.
    pub locks: HashMap<String, bool>,
}

impl DeviceState {
    /// Whether the button at `index` is currently pressed.
    pub fn button(&self, index: u8) -> bool {
        self.buttons & (1 << index) != 0
    }

    /// Whether the named lock target is engaged.
    pub fn locked(&self, target: &str) -> bool {
        self.locks.get(target).copied().unwrap_or(false)
    }
}

/// Identifies a registered observer so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(ButtonEvent) + Send + Sync>;

/// Applies event payloads to the [`DeviceState`] cache and invokes
/// observers, in registration order, outside any lock the read path
/// depends on.
#[derive(Default)]
pub struct EventDispatcher {
    state: Mutex<DeviceState>,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    /// A dispatcher with empty cache and no observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Observers are invoked in registration
    /// order; a panicking observer is isolated from the others.
    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(ButtonEvent) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.observers
            .lock()
            .expect("Observer mutex poisoned")
            .push((id, Arc::new(observer)));

        id
    }

    /// Remove a registered observer. No-op when already removed.
    pub fn unsubscribe(&self, id: ObserverId) {
        self.observers
            .lock()
            .expect("Observer mutex poisoned")
            .retain(|(registered, _)| *registered != id);
    }

    /// A snapshot of the cached state. Never blocks on event traffic.
    pub fn snapshot(&self) -> DeviceState {
        self.state.lock().expect("State mutex poisoned").clone()
    }

    /// Forget all cached state.
    /// Invoked at session teardown so no pre-disconnect state is
    /// reported as current after a reconnect.
    pub fn reset(&self) {
        *self.state.lock().expect("State mutex poisoned") = DeviceState::default();
    }

    /// Apply one event payload: update the cache in a single step,
    /// then fan the resulting button transitions out to observers.
    pub fn on_event(&self, payload: &str) {
        let deltas = match self.apply(payload) {
            Some(deltas) => deltas,
            None => {
                warn!(%payload, "Discarding event line we cannot parse");
                return;
            }
        };

        if deltas.is_empty() {
            return;
        }

        // Snapshot the observer list so callbacks run without the
        // lock held; a callback registering another observer must not
        // deadlock.
        let observers: Vec<Observer> = {
            let observers = self.observers.lock().expect("Observer mutex poisoned");
            observers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        for event in deltas {
            trace!(button = event.button, pressed = event.pressed, "Button event");

            for observer in &observers {
                if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
                    warn!("An event observer panicked; continuing with the rest");
                }
            }
        }
    }

    /// Update the cache, returning the button transitions the payload
    /// caused. `None` when the payload does not parse.
    fn apply(&self, payload: &str) -> Option<Vec<ButtonEvent>> {
        let mut state = self.state.lock().expect("State mutex poisoned");

        if let Some(mask) = payload.strip_prefix("buttons:") {
            let mask: u8 = mask.parse().ok()?;
            let previous = state.buttons;
            state.buttons = mask;

            let changed = previous ^ mask;
            return Some(
                (0..8)
                    .filter(|bit| changed & (1 << bit) != 0)
                    .map(|bit| ButtonEvent {
                        button: bit,
                        pressed: mask & (1 << bit) != 0,
                    })
                    .collect(),
            );
        }

        if let Some(rest) = payload.strip_prefix("button:") {
            let (index, flag) = rest.split_once(':')?;
            let index: u8 = index.parse().ok()?;
            if index > 7 {
                return None;
            }
            let pressed = parse_flag(flag)?;

            if pressed {
                state.buttons |= 1 << index;
            } else {
                state.buttons &= !(1 << index);
            }

            return Some(vec![ButtonEvent {
                button: index,
                pressed,
            }]);
        }

        if let Some(rest) = payload.strip_prefix("lock:") {
            let (target, flag) = rest.split_once(':')?;
            let engaged = parse_flag(flag)?;

            state.locks.insert(target.to_string(), engaged);

            // Lock changes update the cache only.
            return Some(Vec::new());
        }

        None
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}
