//! Ambient, typed side-channel values passed into endpoint handlers.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// A zero-sized tag naming one context slot and its value type.
///
/// ```
/// use encore_rpc::{Context, ContextKey};
///
/// struct Locale;
///
/// impl ContextKey for Locale {
///     type Value = String;
///
///     fn default_value() -> String {
///         "en".to_string()
///     }
/// }
///
/// let context = Context::new();
/// assert_eq!(context.get::<Locale>(), "en");
/// context.set::<Locale>("fr".to_string());
/// assert_eq!(context.get::<Locale>(), "fr");
/// ```
pub trait ContextKey: 'static {
    type Value: Clone + Send + Sync + 'static;

    fn default_value() -> Self::Value;
}

type Slots = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// Key-value store addressed by [`ContextKey`] types.
///
/// Cloning a `Context` shares it; [`Context::branch`] takes an independent
/// copy whose mutations never reach the original.
#[derive(Clone, Default)]
pub struct Context {
    slots: Arc<Mutex<Slots>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<K: ContextKey>(&self) -> K::Value {
        self.slots()
            .get(&TypeId::of::<K>())
            .and_then(|slot| slot.downcast_ref::<K::Value>())
            .cloned()
            .unwrap_or_else(K::default_value)
    }

    pub fn set<K: ContextKey>(&self, value: K::Value) {
        self.slots().insert(TypeId::of::<K>(), Arc::new(value));
    }

    /// Reset a slot to its key's default value.
    pub fn remove<K: ContextKey>(&self) {
        self.slots().remove(&TypeId::of::<K>());
    }

    /// Snapshot the current values into a new, independently mutable context.
    pub fn branch(&self) -> Context {
        let snapshot = self.slots().clone();
        Context {
            slots: Arc::new(Mutex::new(snapshot)),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("slots", &self.slots().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CallerId;

    impl ContextKey for CallerId {
        type Value = Option<String>;

        fn default_value() -> Self::Value {
            None
        }
    }

    struct RetryBudget;

    impl ContextKey for RetryBudget {
        type Value = u32;

        fn default_value() -> u32 {
            3
        }
    }

    #[test]
    fn unset_keys_yield_defaults() {
        let context = Context::new();
        assert_eq!(context.get::<CallerId>(), None);
        assert_eq!(context.get::<RetryBudget>(), 3);
    }

    #[test]
    fn keys_are_independent() {
        let context = Context::new();
        context.set::<CallerId>(Some("lyrics".into()));
        context.set::<RetryBudget>(0);

        assert_eq!(context.get::<CallerId>().as_deref(), Some("lyrics"));
        assert_eq!(context.get::<RetryBudget>(), 0);

        context.remove::<RetryBudget>();
        assert_eq!(context.get::<RetryBudget>(), 3);
    }

    #[test]
    fn branch_does_not_leak_back() {
        let parent = Context::new();
        parent.set::<RetryBudget>(5);

        let child = parent.branch();
        assert_eq!(child.get::<RetryBudget>(), 5);

        child.set::<RetryBudget>(1);
        child.set::<CallerId>(Some("child".into()));
        assert_eq!(parent.get::<RetryBudget>(), 5);
        assert_eq!(parent.get::<CallerId>(), None);

        parent.set::<RetryBudget>(9);
        assert_eq!(child.get::<RetryBudget>(), 1);
    }

    #[test]
    fn clones_share_state() {
        let context = Context::new();
        let shared = context.clone();
        shared.set::<RetryBudget>(7);
        assert_eq!(context.get::<RetryBudget>(), 7);
    }
}
