use std::any::TypeId;
use std::sync::{Arc, RwLock};

use crate::input::Input;

/// A named, growable fan-in slot: an ordered collection of inner inputs
/// sharing one element type.
///
/// Entries are appended one at a time and only ever removed all at once by
/// `clear`, so an entry's index is stable for its whole lifetime. The node
/// keeps its per-entry dirty flags aligned with this order.
pub(crate) struct MultiInput {
    name: String,
    ty: TypeId,
    type_name: &'static str,
    entries: RwLock<Vec<Arc<Input>>>,
}

impl MultiInput {
    pub(crate) fn new(name: String, ty: TypeId, type_name: &'static str) -> Self {
        Self {
            name,
            ty,
            type_name,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().expect("multi-input lock poisoned").len()
    }

    /// Snapshot of the current entries, in insertion order.
    pub(crate) fn entries(&self) -> Vec<Arc<Input>> {
        self.entries
            .read()
            .expect("multi-input lock poisoned")
            .clone()
    }

    pub(crate) fn entry(&self, index: usize) -> Option<Arc<Input>> {
        self.entries
            .read()
            .expect("multi-input lock poisoned")
            .get(index)
            .cloned()
    }

    /// Builds a fresh, unnamed inner input of the element type. The caller
    /// runs the normal accept on it and only then appends it, so a failed
    /// accept never shows up in the list.
    pub(crate) fn fresh_entry(&self, index: usize) -> Input {
        Input::new(
            format!("{}[{index}]", self.name),
            self.ty,
            self.type_name,
            false,
        )
    }

    /// Appends an accepted entry; returns its index.
    pub(crate) fn push(&self, entry: Arc<Input>) -> usize {
        let mut entries = self.entries.write().expect("multi-input lock poisoned");
        entries.push(entry);
        entries.len() - 1
    }

    /// Empties the collection, handing the removed entries to the caller so
    /// it can detach the ones that were bound to producer outputs.
    pub(crate) fn take_entries(&self) -> Vec<Arc<Input>> {
        std::mem::take(&mut *self.entries.write().expect("multi-input lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::wrap;

    fn int_multi() -> MultiInput {
        MultiInput::new(
            "xs".to_owned(),
            TypeId::of::<i64>(),
            std::any::type_name::<i64>(),
        )
    }

    #[test]
    fn entries_keep_insertion_order() {
        let multi = int_multi();
        for value in [1i64, 2, 3] {
            let entry = multi.fresh_entry(multi.len());
            entry.bind_pointer(wrap(value));
            multi.push(Arc::new(entry));
        }

        let read: Vec<i64> = multi
            .entries()
            .iter()
            .map(|e| e.carrier().unwrap().cloned::<i64>())
            .collect();
        assert_eq!(read, vec![1, 2, 3]);
    }

    #[test]
    fn take_entries_empties_the_collection() {
        let multi = int_multi();
        let entry = multi.fresh_entry(0);
        entry.bind_pointer(wrap(5i64));
        multi.push(Arc::new(entry));

        let removed = multi.take_entries();
        assert_eq!(removed.len(), 1);
        assert_eq!(multi.len(), 0);
    }

    #[test]
    fn fresh_entries_are_indexed_by_position() {
        let multi = int_multi();
        let entry = multi.fresh_entry(4);
        assert_eq!(entry.name(), "xs[4]");
    }
}
