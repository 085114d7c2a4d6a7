use std::any::TypeId;
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::carrier::SharedCarrier;
use crate::error::WiringError;
use crate::node::{Node, PortId};

/// A forward signal observable on an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSignal {
    /// The output's value went stale; consumers should re-pull.
    Modified,
    /// The output's carrier pointer was replaced.
    PointerSet,
}

/// A consumer slot attached to an output.
///
/// Attachments track the consumer node weakly: a consumer that has been
/// dropped is silently skipped (and pruned) the next time the output emits a
/// forward signal. The shared-ownership direction runs the other way: the
/// consumer's input binding keeps this output's node alive.
pub(crate) struct Attachment {
    pub(crate) node: Weak<Node>,
    pub(crate) port: PortId,
}

/// A named, typed producer slot on a node.
///
/// Holds at most one current carrier; the slot may be empty before the first
/// compute. The `factory` closure produces the initial payload when a
/// consumer connects (or when an output-locking strategy needs the carrier
/// to exist before compute).
pub(crate) struct Output {
    name: String,
    ty: TypeId,
    type_name: &'static str,
    factory: Box<dyn Fn() -> SharedCarrier + Send + Sync>,
    carrier: RwLock<Option<SharedCarrier>>,
    attachments: Mutex<Vec<Attachment>>,
    callbacks: Mutex<Vec<Arc<dyn Fn(&OutputSignal) + Send + Sync>>>,
    // upstream nodes this output's value transitively depends on; holding
    // them here keeps the whole cone alive for anyone holding this output
    dependencies: Mutex<Vec<Arc<Node>>>,
}

impl Output {
    pub(crate) fn new(
        name: String,
        ty: TypeId,
        type_name: &'static str,
        factory: Box<dyn Fn() -> SharedCarrier + Send + Sync>,
    ) -> Self {
        Self {
            name,
            ty,
            type_name,
            factory,
            carrier: RwLock::new(None),
            attachments: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
            dependencies: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn payload_type(&self) -> TypeId {
        self.ty
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The current carrier, if any.
    pub(crate) fn carrier(&self) -> Option<SharedCarrier> {
        self.carrier
            .read()
            .expect("output carrier lock poisoned")
            .clone()
    }

    /// The current carrier, creating it from the factory if absent.
    pub(crate) fn ensure(&self) -> SharedCarrier {
        let mut slot = self.carrier.write().expect("output carrier lock poisoned");
        match &*slot {
            Some(carrier) => carrier.clone(),
            None => {
                let carrier = (self.factory)();
                debug_assert_eq!(
                    carrier.payload_type(),
                    self.ty,
                    "output factory produced the wrong payload type"
                );
                *slot = Some(carrier.clone());
                carrier
            }
        }
    }

    /// Replaces the current carrier and tells every attached input to mirror
    /// the new pointer. The caller has already checked the payload type
    /// against the slot's declared type.
    pub(crate) fn replace(&self, carrier: SharedCarrier) {
        debug_assert_eq!(
            carrier.payload_type(),
            self.ty,
            "output carrier type checked by caller"
        );
        *self.carrier.write().expect("output carrier lock poisoned") = Some(carrier.clone());
        self.emit_pointer_set(&carrier);
    }

    /// Type check for a replacement carrier, with wiring-error context.
    pub(crate) fn check_type(
        &self,
        carrier: &SharedCarrier,
        node: &str,
    ) -> Result<(), WiringError> {
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

    /// Clears the carrier. The value itself survives as long as any input
    /// or value handle still shares it.
    pub(crate) fn reset(&self) {
        *self.carrier.write().expect("output carrier lock poisoned") = None;
    }

    pub(crate) fn attach(&self, attachment: Attachment) {
        self.attachments
            .lock()
            .expect("output attachment lock poisoned")
            .push(attachment);
    }

    /// Removes the attachment for the given consumer port.
    pub(crate) fn detach(&self, consumer: &Weak<Node>, port: PortId) {
        self.attachments
            .lock()
            .expect("output attachment lock poisoned")
            .retain(|a| !(a.port == port && Weak::ptr_eq(&a.node, consumer)));
    }

    pub(crate) fn on_signal(&self, callback: Arc<dyn Fn(&OutputSignal) + Send + Sync>) {
        self.callbacks
            .lock()
            .expect("output callback lock poisoned")
            .push(callback);
    }

    /// Records an upstream node this output transitively depends on.
    pub(crate) fn add_dependency(&self, node: Arc<Node>) {
        self.dependencies
            .lock()
            .expect("output dependency lock poisoned")
            .push(node);
    }

    /// Emits Modified forward: every live attached consumer learns that
    /// this output went stale. Dead consumers are pruned on the way.
    pub(crate) fn emit_modified(&self) {
        self.notify_callbacks(&OutputSignal::Modified);
        for (node, port) in self.live_attachments() {
            node.on_port_modified(port);
        }
    }

    /// Emits PointerSet forward: every live attached consumer mirrors the
    /// replacement carrier.
    fn emit_pointer_set(&self, carrier: &SharedCarrier) {
        self.notify_callbacks(&OutputSignal::PointerSet);
        for (node, port) in self.live_attachments() {
            node.mirror_port(port, carrier.clone());
        }
    }

    fn notify_callbacks(&self, signal: &OutputSignal) {
        let callbacks = self
            .callbacks
            .lock()
            .expect("output callback lock poisoned")
            .clone();
        for callback in callbacks {
            callback(signal);
        }
    }

    /// Snapshots the live consumers, pruning the dead ones. The attachment
    /// lock is released before any consumer code runs.
    fn live_attachments(&self) -> Vec<(Arc<Node>, PortId)> {
        let mut attachments = self
            .attachments
            .lock()
            .expect("output attachment lock poisoned");
        attachments.retain(|a| a.node.strong_count() > 0);
        attachments
            .iter()
            .filter_map(|a| a.node.upgrade().map(|node| (node, a.port)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::wrap;

    fn int_output() -> Output {
        Output::new(
            "x".to_owned(),
            TypeId::of::<i64>(),
            std::any::type_name::<i64>(),
            Box::new(|| wrap(0i64)),
        )
    }

    #[test]
    fn starts_empty_and_ensures_lazily() {
        let output = int_output();
        assert!(output.carrier().is_none());

        let carrier = output.ensure();
        assert_eq!(carrier.cloned::<i64>(), 0);
        assert!(Arc::ptr_eq(&output.ensure(), &carrier));
    }

    #[test]
    fn replace_swaps_the_pointer() {
        let output = int_output();
        let first = output.ensure();

        let second = wrap(9i64);
        output.replace(second.clone());
        assert!(Arc::ptr_eq(&output.carrier().unwrap(), &second));
        // the old carrier is untouched, anyone sharing it still reads 0
        assert_eq!(first.cloned::<i64>(), 0);
    }

    #[test]
    fn reset_clears_but_sharers_survive() {
        let output = int_output();
        let shared = output.ensure();
        output.reset();
        assert!(output.carrier().is_none());
        assert_eq!(shared.cloned::<i64>(), 0);
    }

    #[test]
    fn callbacks_observe_signals() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let output = int_output();
        let pointer_sets = Arc::new(AtomicUsize::new(0));
        let seen = pointer_sets.clone();
        output.on_signal(Arc::new(move |signal| {
            if *signal == OutputSignal::PointerSet {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));

        output.replace(wrap(1i64));
        output.emit_modified();
        assert_eq!(pointer_sets.load(Ordering::SeqCst), 1);
    }
}
