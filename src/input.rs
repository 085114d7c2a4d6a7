use std::any::TypeId;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use crate::carrier::{Carrier, SharedCarrier};
use crate::error::WiringError;
use crate::node::Node;

/// What an input is currently reading from.
///
/// An assigned input keeps the producing node alive: a consumer never sees
/// its producer disappear while the connection stands. The mirrored carrier
/// is a shared copy of the producer output's current carrier, refreshed
/// whenever the producer replaces its pointer.
pub(crate) enum Binding {
    Unset,
    Assigned {
        node: Arc<Node>,
        output: usize,
        carrier: SharedCarrier,
    },
    Pointer {
        carrier: SharedCarrier,
    },
}

/// A named, typed consumer slot on a node.
///
/// The payload type is fixed at registration. Compatibility is checked once,
/// when a connection is made; every later carrier replacement arriving from
/// the producer side must already match.
pub(crate) struct Input {
    name: String,
    ty: TypeId,
    type_name: &'static str,
    optional: bool,
    binding: RwLock<Binding>,
    // observers of backward Update emission
    callbacks: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
}

impl Input {
    pub(crate) fn new(
        name: String,
        ty: TypeId,
        type_name: &'static str,
        optional: bool,
    ) -> Self {
        Self {
            name,
            ty,
            type_name,
            optional,
            binding: RwLock::new(Binding::Unset),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn optional(&self) -> bool {
        self.optional
    }

    pub(crate) fn binding(&self) -> RwLockReadGuard<'_, Binding> {
        self.binding.read().expect("input binding lock poisoned")
    }

    pub(crate) fn is_set(&self) -> bool {
        !matches!(*self.binding(), Binding::Unset)
    }

    /// The carrier this input currently reads, if any.
    pub(crate) fn carrier(&self) -> Option<SharedCarrier> {
        match &*self.binding() {
            Binding::Unset => None,
            Binding::Assigned { carrier, .. } | Binding::Pointer { carrier } => {
                Some(carrier.clone())
            }
        }
    }

    /// The producer this input is assigned to, if it is output-bound.
    pub(crate) fn assigned(&self) -> Option<(Arc<Node>, usize)> {
        match &*self.binding() {
            Binding::Assigned { node, output, .. } => Some((node.clone(), *output)),
            _ => None,
        }
    }

    /// The connection-time type check. Runs before any state is touched, so
    /// a failed assignment leaves the input exactly as it was.
    pub(crate) fn check_type(&self, carrier: &Carrier, node: &str) -> Result<(), WiringError> {
        if carrier.payload_type() == self.ty {
            Ok(())
        } else {
            Err(WiringError::Assignment {
                node: node.to_owned(),
                slot: self.name.clone(),
                expected: self.type_name,
                found: carrier.type_name(),
            })
        }
    }

    pub(crate) fn bind_output(&self, node: Arc<Node>, output: usize, carrier: SharedCarrier) {
        *self.binding.write().expect("input binding lock poisoned") = Binding::Assigned {
            node,
            output,
            carrier,
        };
    }

    pub(crate) fn bind_pointer(&self, carrier: SharedCarrier) {
        *self.binding.write().expect("input binding lock poisoned") =
            Binding::Pointer { carrier };
    }

    /// Drops the binding and returns the previous one, so the caller can
    /// detach from the producer it pointed at.
    pub(crate) fn take_binding(&self) -> Binding {
        std::mem::replace(
            &mut *self.binding.write().expect("input binding lock poisoned"),
            Binding::Unset,
        )
    }

    /// Refreshes the mirrored carrier after the producer replaced its
    /// pointer. The producer side already enforces its declared payload
    /// type, so a mismatch here is an engine bug, not a user error.
    pub(crate) fn mirror(&self, replacement: SharedCarrier) {
        if replacement.payload_type() != self.ty {
            tracing::error!(
                input = %self.name,
                expected = self.type_name,
                found = replacement.type_name(),
                "mirrored carrier does not match the input type"
            );
            debug_assert!(false, "mirrored carrier does not match the input type");
            return;
        }
        match &mut *self.binding.write().expect("input binding lock poisoned") {
            Binding::Assigned { carrier, .. } | Binding::Pointer { carrier } => {
                *carrier = replacement;
            }
            Binding::Unset => {
                tracing::trace!(input = %self.name, "ignoring pointer change on unset input");
            }
        }
    }

    pub(crate) fn on_update(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        self.callbacks
            .lock()
            .expect("input callback lock poisoned")
            .push(callback);
    }

    /// Fires the backward-signal observers. Called whenever an Update is
    /// emitted along this input.
    pub(crate) fn notify_update(&self) {
        let callbacks = self
            .callbacks
            .lock()
            .expect("input callback lock poisoned")
            .clone();
        for callback in callbacks {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::wrap;

    fn int_input() -> Input {
        Input::new(
            "a".to_owned(),
            TypeId::of::<i64>(),
            std::any::type_name::<i64>(),
            false,
        )
    }

    #[test]
    fn starts_unset() {
        let input = int_input();
        assert!(!input.is_set());
        assert!(input.carrier().is_none());
        assert!(input.assigned().is_none());
    }

    #[test]
    fn pointer_binding_round_trip() {
        let input = int_input();
        let carrier = wrap(7i64);
        input.check_type(&carrier, "test").unwrap();
        input.bind_pointer(carrier.clone());

        assert!(input.is_set());
        assert!(Arc::ptr_eq(&input.carrier().unwrap(), &carrier));
        assert!(input.assigned().is_none());
    }

    #[test]
    fn type_check_rejects_and_leaves_unset() {
        let input = int_input();
        let wrong = wrap(String::from("nope"));

        let err = input.check_type(&wrong, "test").unwrap_err();
        assert!(matches!(err, WiringError::Assignment { .. }));
        assert!(!input.is_set());
    }

    #[test]
    fn mirror_replaces_the_carrier() {
        let input = int_input();
        input.bind_pointer(wrap(1i64));

        let replacement = wrap(2i64);
        input.mirror(replacement.clone());
        assert!(Arc::ptr_eq(&input.carrier().unwrap(), &replacement));
    }

    #[test]
    fn update_observers_fire() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let input = int_input();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        input.on_update(Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        input.notify_update();
        input.notify_update();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
