//! Hot-reloadable tunables
//!
//! A `ConfigVar` holds one named value. Consumers that cache the value
//! subscribe with `add_listener` and are told about every change, so hot
//! paths never re-read the variable.

use gvfiber_core::constants::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_STACK_SIZE};
use gvfiber_core::env::{env_get, env_get_size};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// A named configuration value with change listeners
pub struct ConfigVar<T> {
    name: &'static str,
    description: &'static str,
    value: RwLock<T>,
    listeners: Mutex<BTreeMap<u64, Listener<T>>>,
    next_key: AtomicU64,
}

impl<T> ConfigVar<T>
where
    T: Clone + PartialEq + fmt::Debug + Send + Sync,
{
    pub fn new(name: &'static str, default: T, description: &'static str) -> Self {
        Self {
            name,
            description,
            value: RwLock::new(default),
            listeners: Mutex::new(BTreeMap::new()),
            next_key: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Current value
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Replace the value and notify listeners with `(old, new)`.
    ///
    /// Setting an equal value is a no-op. Listeners run on the caller's
    /// thread after the value lock has been released.
    pub fn set(&self, value: T) {
        let old = {
            let mut current = self.value.write();
            if *current == value {
                return;
            }
            std::mem::replace(&mut *current, value.clone())
        };
        tracing::info!(name = self.name, ?old, new = ?value, "config value changed");

        let listeners: Vec<Listener<T>> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(&old, &value);
        }
    }

    /// Subscribe to changes; returns a key for `del_listener`.
    pub fn add_listener<F>(&self, f: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(key, Arc::new(f));
        key
    }

    pub fn del_listener(&self, key: u64) -> bool {
        self.listeners.lock().remove(&key).is_some()
    }

    pub fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }
}

impl<T: fmt::Debug> fmt::Debug for ConfigVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigVar")
            .field("name", &self.name)
            .field("value", &*self.value.read())
            .finish()
    }
}

/// `fiber.stack_size`: default stack for fibers created with size 0.
///
/// Seeded from `GVF_FIBER_STACK_SIZE` (accepts `k`/`m` suffixes).
pub fn fiber_stack_size() -> &'static ConfigVar<usize> {
    static VAR: OnceLock<ConfigVar<usize>> = OnceLock::new();
    VAR.get_or_init(|| {
        ConfigVar::new(
            "fiber.stack_size",
            env_get_size("GVF_FIBER_STACK_SIZE", DEFAULT_STACK_SIZE),
            "fiber stack size",
        )
    })
}

/// `tcp.connect.timeout`: milliseconds a hooked `connect` may wait; 0 disables.
///
/// Seeded from `GVF_TCP_CONNECT_TIMEOUT_MS`.
pub fn tcp_connect_timeout() -> &'static ConfigVar<u64> {
    static VAR: OnceLock<ConfigVar<u64>> = OnceLock::new();
    VAR.get_or_init(|| {
        ConfigVar::new(
            "tcp.connect.timeout",
            env_get("GVF_TCP_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS),
            "tcp connect timeout",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listeners_see_old_and_new() {
        let var = ConfigVar::new("test.value", 1u32, "test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let key = var.add_listener(move |old, new| s.lock().push((*old, *new)));

        var.set(2);
        var.set(2); // unchanged, no notification
        var.set(5);
        assert_eq!(*seen.lock(), vec![(1, 2), (2, 5)]);
        assert_eq!(var.get(), 5);

        assert!(var.del_listener(key));
        assert!(!var.del_listener(key));
        var.set(6);
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_clear_listeners() {
        let var = ConfigVar::new("test.clear", String::from("a"), "test");
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = hits.clone();
            var.add_listener(move |_, _| {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        var.set("b".into());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        var.clear_listeners();
        var.set("c".into());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_builtin_names() {
        assert_eq!(fiber_stack_size().name(), "fiber.stack_size");
        assert_eq!(tcp_connect_timeout().name(), "tcp.connect.timeout");
        assert!(fiber_stack_size().get() > 0);
    }
}
