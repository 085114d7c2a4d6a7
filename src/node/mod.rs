pub(crate) mod locking;
pub(crate) mod update;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::carrier::SharedCarrier;
use crate::error::WiringError;
use crate::input::{Binding, Input};
use crate::multi::MultiInput;
use crate::output::{Attachment, Output};
use crate::pool;
use crate::process::OutputRef;
use crate::stage::{Stage, StageSpec};

use self::locking::Strategy;
use self::update::DirtyState;

/// Identifies a consumer-side slot on a node, as seen from a producer
/// output's attachment list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortId {
    Input(usize),
    MultiEntry(usize, usize),
}

/// Events arriving at a single input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputEvent {
    /// The upstream value went stale.
    Modified,
    /// A producer output was connected.
    Set,
    /// A carrier pointer was bound directly.
    SetToPointer,
    /// The input was disconnected.
    Unset,
}

/// By-index or by-name slot selector; built by [`PortKey`] implementations.
///
/// [`PortKey`]: crate::PortKey
#[derive(Debug, Clone, Copy)]
#[doc(hidden)]
pub enum Key<'a> {
    Index(usize),
    Name(&'a str),
}

/// Resolved dependency hints: which outputs each input feeds.
///
/// `None` means no hint was declared for that slot, so it feeds every
/// output, which is the safe default.
pub(crate) struct Hints {
    inputs: Vec<Option<Vec<usize>>>,
    multis: Vec<Option<Vec<usize>>>,
}

impl Hints {
    pub(crate) fn input_feeds(&self, input: usize, output: usize) -> bool {
        self.inputs[input]
            .as_ref()
            .is_none_or(|outputs| outputs.contains(&output))
    }

    pub(crate) fn multi_feeds(&self, multi: usize, output: usize) -> bool {
        self.multis[multi]
            .as_ref()
            .is_none_or(|outputs| outputs.contains(&output))
    }

    fn outputs_of_input(&self, input: usize, output_count: usize) -> Vec<usize> {
        match &self.inputs[input] {
            Some(outputs) => outputs.clone(),
            None => (0..output_count).collect(),
        }
    }

    fn outputs_of_multi(&self, multi: usize, output_count: usize) -> Vec<usize> {
        match &self.multis[multi] {
            Some(outputs) => outputs.clone(),
            None => (0..output_count).collect(),
        }
    }
}

/// A node in the dataflow graph: slots, dirty state, and the user stage.
///
/// Nodes are always owned through [`Process`](crate::Process) handles (and,
/// transitively, through the bindings of downstream inputs). All interior
/// state is lock-guarded; the structural parts (slot vectors, name maps,
/// hints) are fixed at construction and wiring is expected to happen while
/// the graph is quiescent.
pub(crate) struct Node {
    label: String,
    self_weak: Weak<Node>,
    stage: Box<dyn Stage>,
    strategy: Strategy,
    pub(crate) inputs: Vec<Input>,
    pub(crate) multis: Vec<MultiInput>,
    pub(crate) outputs: Vec<Output>,
    input_names: HashMap<String, usize>,
    multi_names: HashMap<String, usize>,
    output_names: HashMap<String, usize>,
    hints: Hints,
    // guards every dirty flag on this node
    dirty: Mutex<DirtyState>,
    // serializes pulls through this node; held across compute
    update: Mutex<()>,
}

impl Node {
    pub(crate) fn build(
        instance_name: Option<String>,
        stage_type: &'static str,
        stage: Box<dyn Stage>,
        spec: StageSpec,
    ) -> Result<Arc<Node>, WiringError> {
        let short_type = stage_type.rsplit("::").next().unwrap_or(stage_type);
        let label = match &instance_name {
            Some(name) => format!("{short_type}({name})"),
            None => short_type.to_owned(),
        };

        let mut input_names = HashMap::new();
        let mut multi_names = HashMap::new();
        let mut output_names = HashMap::new();

        let duplicate = |name: &str| WiringError::DuplicateSlot {
            node: label.clone(),
            name: name.to_owned(),
        };

        let mut inputs = Vec::with_capacity(spec.inputs.len());
        for (i, decl) in spec.inputs.into_iter().enumerate() {
            if input_names.insert(decl.name.clone(), i).is_some() {
                return Err(duplicate(&decl.name));
            }
            inputs.push(Input::new(decl.name, decl.ty, decl.type_name, decl.optional));
        }

        let mut multis = Vec::with_capacity(spec.multis.len());
        for (m, decl) in spec.multis.into_iter().enumerate() {
            if multi_names.insert(decl.name.clone(), m).is_some() {
                return Err(duplicate(&decl.name));
            }
            multis.push(MultiInput::new(decl.name, decl.ty, decl.type_name));
        }

        let mut outputs = Vec::with_capacity(spec.outputs.len());
        for (o, decl) in spec.outputs.into_iter().enumerate() {
            if output_names.insert(decl.name.clone(), o).is_some() {
                return Err(duplicate(&decl.name));
            }
            outputs.push(Output::new(decl.name, decl.ty, decl.type_name, decl.factory));
        }

        let mut hints = Hints {
            inputs: vec![None; inputs.len()],
            multis: vec![None; multis.len()],
        };
        for hint in spec.hints {
            let output =
                *output_names
                    .get(&hint.output)
                    .ok_or_else(|| WiringError::NoSuchOutput {
                        node: label.clone(),
                        name: hint.output.clone(),
                    })?;
            let slot = if hint.multi {
                let m = *multi_names
                    .get(&hint.input)
                    .ok_or_else(|| WiringError::NoSuchInput {
                        node: label.clone(),
                        name: hint.input.clone(),
                    })?;
                &mut hints.multis[m]
            } else {
                let i = *input_names
                    .get(&hint.input)
                    .ok_or_else(|| WiringError::NoSuchInput {
                        node: label.clone(),
                        name: hint.input.clone(),
                    })?;
                &mut hints.inputs[i]
            };
            slot.get_or_insert_default().push(output);
        }

        let dirty = DirtyState::initial(&inputs, multis.len(), outputs.len());
        let strategy = stage.locking();

        // the worker budget is seeded from configuration the first time any
        // node is constructed
        let _ = pool::budget();

        let node = Arc::new_cyclic(|self_weak| Node {
            label,
            self_weak: self_weak.clone(),
            stage,
            strategy,
            inputs,
            multis,
            outputs,
            input_names,
            multi_names,
            output_names,
            hints,
            dirty: Mutex::new(dirty),
            update: Mutex::new(()),
        });

        tracing::debug!(node = %node.label, "built node");
        Ok(node)
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn stage(&self) -> &dyn Stage {
        self.stage.as_ref()
    }

    pub(crate) fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub(crate) fn lock_dirty(&self) -> std::sync::MutexGuard<'_, DirtyState> {
        self.dirty.lock().expect("dirty-state lock poisoned")
    }

    pub(crate) fn lock_update(&self) -> std::sync::MutexGuard<'_, ()> {
        self.update.lock().expect("update lock poisoned")
    }

    // ---- slot lookup ----------------------------------------------------

    pub(crate) fn resolve_input(&self, key: Key<'_>) -> Result<usize, WiringError> {
        match key {
            Key::Index(index) if index < self.inputs.len() => Ok(index),
            Key::Index(index) => Err(WiringError::NotEnoughInputs {
                node: self.label.clone(),
                index,
                count: self.inputs.len(),
            }),
            Key::Name(name) => {
                self.input_names
                    .get(name)
                    .copied()
                    .ok_or_else(|| WiringError::NoSuchInput {
                        node: self.label.clone(),
                        name: name.to_owned(),
                    })
            }
        }
    }

    pub(crate) fn resolve_multi(&self, key: Key<'_>) -> Result<usize, WiringError> {
        match key {
            Key::Index(index) if index < self.multis.len() => Ok(index),
            Key::Index(index) => Err(WiringError::NotEnoughInputs {
                node: self.label.clone(),
                index,
                count: self.multis.len(),
            }),
            Key::Name(name) => {
                self.multi_names
                    .get(name)
                    .copied()
                    .ok_or_else(|| WiringError::NoSuchInput {
                        node: self.label.clone(),
                        name: name.to_owned(),
                    })
            }
        }
    }

    pub(crate) fn resolve_output(&self, key: Key<'_>) -> Result<usize, WiringError> {
        match key {
            Key::Index(index) if index < self.outputs.len() => Ok(index),
            Key::Index(index) => Err(WiringError::NotEnoughOutputs {
                node: self.label.clone(),
                index,
                count: self.outputs.len(),
            }),
            Key::Name(name) => {
                self.output_names
                    .get(name)
                    .copied()
                    .ok_or_else(|| WiringError::NoSuchOutput {
                        node: self.label.clone(),
                        name: name.to_owned(),
                    })
            }
        }
    }

    // ---- wiring ---------------------------------------------------------

    /// Connects input `i` to a producer output: type check, shared binding,
    /// weak attachment, mirror of the producer's current carrier, then the
    /// Set event.
    pub(crate) fn connect_input(&self, i: usize, src: &OutputRef) -> Result<(), WiringError> {
        let input = &self.inputs[i];
        let src_output = &src.node.outputs[src.index];
        let carrier = src_output.ensure();
        input.check_type(&carrier, &self.label)?;

        self.detach_binding(input.take_binding(), PortId::Input(i));
        input.bind_output(src.node.clone(), src.index, carrier);
        src_output.attach(Attachment {
            node: self.self_weak.clone(),
            port: PortId::Input(i),
        });

        tracing::trace!(
            node = %self.label,
            input = %input.name(),
            source = %src.node.label(),
            output = %src_output.name(),
            "connected input"
        );
        self.on_input_event(i, InputEvent::Set);
        Ok(())
    }

    /// Binds input `i` directly to a carrier.
    pub(crate) fn bind_input_pointer(
        &self,
        i: usize,
        carrier: SharedCarrier,
    ) -> Result<(), WiringError> {
        let input = &self.inputs[i];
        input.check_type(&carrier, &self.label)?;

        self.detach_binding(input.take_binding(), PortId::Input(i));
        input.bind_pointer(carrier);

        tracing::trace!(node = %self.label, input = %input.name(), "bound input to pointer");
        self.on_input_event(i, InputEvent::SetToPointer);
        Ok(())
    }

    pub(crate) fn unset_input(&self, i: usize) {
        let old = self.inputs[i].take_binding();
        if matches!(old, Binding::Unset) {
            return;
        }
        self.detach_binding(old, PortId::Input(i));
        tracing::trace!(node = %self.label, input = %self.inputs[i].name(), "unset input");
        self.on_input_event(i, InputEvent::Unset);
    }

    /// Adds a producer output to multi-input `m`. The fresh entry is fully
    /// checked and bound before it is appended, so a failed accept never
    /// shows up in the list.
    pub(crate) fn add_multi_output(&self, m: usize, src: &OutputRef) -> Result<(), WiringError> {
        let multi = &self.multis[m];
        let src_output = &src.node.outputs[src.index];
        let carrier = src_output.ensure();

        let entry = multi.fresh_entry(multi.len());
        entry.check_type(&carrier, &self.label)?;
        entry.bind_output(src.node.clone(), src.index, carrier);

        let j = multi.push(Arc::new(entry));
        src_output.attach(Attachment {
            node: self.self_weak.clone(),
            port: PortId::MultiEntry(m, j),
        });

        tracing::trace!(
            node = %self.label,
            multi = %multi.name(),
            entry = j,
            source = %src.node.label(),
            "added multi-input entry"
        );
        self.on_multi_added(m);
        Ok(())
    }

    /// Adds a raw carrier to multi-input `m`. No producer side exists, so
    /// no signalling is wired for the entry.
    pub(crate) fn add_multi_pointer(
        &self,
        m: usize,
        carrier: SharedCarrier,
    ) -> Result<(), WiringError> {
        let multi = &self.multis[m];
        let entry = multi.fresh_entry(multi.len());
        entry.check_type(&carrier, &self.label)?;
        entry.bind_pointer(carrier);

        let j = multi.push(Arc::new(entry));
        tracing::trace!(node = %self.label, multi = %multi.name(), entry = j, "added pointer entry");
        self.on_multi_added(m);
        Ok(())
    }

    pub(crate) fn clear_multi(&self, m: usize) {
        for (j, entry) in self.multis[m].take_entries().into_iter().enumerate() {
            self.detach_binding(entry.take_binding(), PortId::MultiEntry(m, j));
        }
        tracing::trace!(node = %self.label, multi = %self.multis[m].name(), "cleared multi-input");
        self.on_multi_cleared(m);
    }

    fn detach_binding(&self, old: Binding, port: PortId) {
        if let Binding::Assigned { node, output, .. } = old {
            node.outputs[output].detach(&self.self_weak, port);
        }
    }

    // ---- event handling -------------------------------------------------

    /// Routes a forward Modified from a producer to the right slot.
    pub(crate) fn on_port_modified(&self, port: PortId) {
        match port {
            PortId::Input(i) => self.on_input_event(i, InputEvent::Modified),
            PortId::MultiEntry(m, j) => self.on_multi_entry_modified(m, j),
        }
    }

    /// Routes a forward PointerSet from a producer: the slot mirrors the
    /// replacement carrier.
    pub(crate) fn mirror_port(&self, port: PortId, carrier: SharedCarrier) {
        match port {
            PortId::Input(i) => self.inputs[i].mirror(carrier),
            PortId::MultiEntry(m, j) => match self.multis[m].entry(j) {
                Some(entry) => entry.mirror(carrier),
                None => {
                    tracing::trace!(node = %self.label, "pointer change for a cleared entry");
                }
            },
        }
    }

    pub(crate) fn on_input_event(&self, i: usize, event: InputEvent) {
        tracing::trace!(node = %self.label, input = %self.inputs[i].name(), ?event, "input event");
        let forward = {
            let mut dirty = self.lock_dirty();
            let was_dirty = dirty.inputs[i];
            match event {
                InputEvent::Modified | InputEvent::Set => dirty.inputs[i] = true,
                // nothing upstream remains that could clear the flag later
                InputEvent::SetToPointer | InputEvent::Unset => dirty.inputs[i] = false,
            }
            let dependents = self.hints.outputs_of_input(i, self.outputs.len());
            dirty.mark_outputs(dependents.iter().copied());
            // Modified is idempotent: an input that was already stale has
            // already told its consumers
            if event == InputEvent::Modified && was_dirty {
                Vec::new()
            } else {
                dependents
            }
        };
        self.forward_modified(&forward);
    }

    pub(crate) fn on_multi_added(&self, m: usize) {
        let forward = {
            let mut dirty = self.lock_dirty();
            dirty.multis[m].push(true);
            let dependents = self.hints.outputs_of_multi(m, self.outputs.len());
            dirty.mark_outputs(dependents.iter().copied());
            dependents
        };
        self.forward_modified(&forward);
    }

    pub(crate) fn on_multi_cleared(&self, m: usize) {
        let forward = {
            let mut dirty = self.lock_dirty();
            dirty.multis[m].clear();
            let dependents = self.hints.outputs_of_multi(m, self.outputs.len());
            dirty.mark_outputs(dependents.iter().copied());
            dependents
        };
        self.forward_modified(&forward);
    }

    pub(crate) fn on_multi_entry_modified(&self, m: usize, j: usize) {
        tracing::trace!(node = %self.label, multi = %self.multis[m].name(), entry = j, "entry modified");
        let forward = {
            let mut dirty = self.lock_dirty();
            let was_dirty = match dirty.multis[m].get_mut(j) {
                Some(flag) => std::mem::replace(flag, true),
                None => {
                    tracing::error!(
                        node = %self.label,
                        multi = %self.multis[m].name(),
                        entry = j,
                        "modified signal for an entry with no dirty flag"
                    );
                    debug_assert!(false, "entry dirty flag out of step with entries");
                    return;
                }
            };
            let dependents = self.hints.outputs_of_multi(m, self.outputs.len());
            dirty.mark_outputs(dependents.iter().copied());
            if was_dirty { Vec::new() } else { dependents }
        };
        self.forward_modified(&forward);
    }

    /// Marks output `o` stale by hand; for stage state that changed outside
    /// the input graph.
    pub(crate) fn set_dirty(&self, o: usize) {
        tracing::trace!(node = %self.label, output = %self.outputs[o].name(), "set dirty");
        {
            let mut dirty = self.lock_dirty();
            dirty.mark_outputs([o]);
        }
        self.forward_modified(&[o]);
    }

    /// Emits Modified forward on the given outputs. The dirty-state mutex
    /// is never held here; the consumers' handlers take their own.
    fn forward_modified(&self, outputs: &[usize]) {
        for &o in outputs {
            self.outputs[o].emit_modified();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("label", &self.label)
            .field("inputs", &self.inputs.len())
            .field("multis", &self.multis.len())
            .field("outputs", &self.outputs.len())
            .finish_non_exhaustive()
    }
}
