use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use crate::carrier::{SharedCarrier, wrap};
use crate::error::{PullError, WiringError};
use crate::node::{Key, Node};
use crate::output::OutputSignal;
use crate::stage::{Stage, StageSpec};

/// Selects a slot by position or by name.
///
/// Implemented for `usize` (index) and string types (name), so every wiring
/// and access method takes either: `node.set_input(0, source)` and
/// `node.set_input("a", source)` both work.
pub trait PortKey {
    #[doc(hidden)]
    fn as_key(&self) -> Key<'_>;
}

impl PortKey for usize {
    fn as_key(&self) -> Key<'_> {
        Key::Index(*self)
    }
}

impl PortKey for &str {
    fn as_key(&self) -> Key<'_> {
        Key::Name(self)
    }
}

impl PortKey for String {
    fn as_key(&self) -> Key<'_> {
        Key::Name(self.as_str())
    }
}

impl PortKey for &String {
    fn as_key(&self) -> Key<'_> {
        Key::Name(self.as_str())
    }
}

/// Something an input can read from: a producer output or a bare carrier.
///
/// [`InputRef::source`] turns an existing input into a `Source`, which is
/// how "connect to whatever that other input reads" is spelled.
#[derive(Debug)]
pub enum Source {
    Output(OutputRef),
    Pointer(SharedCarrier),
}

impl From<OutputRef> for Source {
    fn from(output: OutputRef) -> Self {
        Source::Output(output)
    }
}

impl From<&OutputRef> for Source {
    fn from(output: &OutputRef) -> Self {
        Source::Output(output.clone())
    }
}

impl From<SharedCarrier> for Source {
    fn from(carrier: SharedCarrier) -> Self {
        Source::Pointer(carrier)
    }
}

impl From<&SharedCarrier> for Source {
    fn from(carrier: &SharedCarrier) -> Self {
        Source::Pointer(carrier.clone())
    }
}

/// A portable reference to one output slot of a node.
///
/// Cloning is cheap; the reference shares ownership of the node, so an
/// `OutputRef` (like a [`Value`](crate::Value)) keeps its producer alive.
#[derive(Clone)]
pub struct OutputRef {
    pub(crate) node: Arc<Node>,
    pub(crate) index: usize,
}

impl OutputRef {
    pub fn name(&self) -> &str {
        self.node.outputs[self.index].name()
    }

    /// The output's current carrier, if it has one.
    pub fn carrier(&self) -> Option<SharedCarrier> {
        self.node.outputs[self.index].carrier()
    }

    /// Replaces the output's value with a fresh carrier around `value`.
    ///
    /// Attached inputs mirror the new pointer immediately. Replacing a
    /// value does not by itself mark anything stale; pair it with
    /// [`Process::set_dirty`] when consumers should recompute.
    pub fn set<T: Send + Sync + 'static>(&self, value: T) -> Result<(), WiringError> {
        self.set_carrier(wrap(value))
    }

    /// Like [`set`](Self::set), with an existing carrier.
    pub fn set_carrier(&self, carrier: SharedCarrier) -> Result<(), WiringError> {
        let output = &self.node.outputs[self.index];
        output.check_type(&carrier, self.node.label())?;
        output.replace(carrier);
        Ok(())
    }

    /// Drops the output's carrier. Inputs and values sharing it keep the
    /// data alive.
    pub fn reset(&self) {
        self.node.outputs[self.index].reset();
    }

    /// Observes forward signals (Modified, PointerSet) on this output.
    pub fn on_signal(&self, callback: impl Fn(&OutputSignal) + Send + Sync + 'static) {
        self.node.outputs[self.index].on_signal(Arc::new(callback));
    }

    /// Records `upstream` as a node this output's value transitively
    /// depends on, keeping it alive as long as the output's node lives.
    /// For stages that re-expose data computed by nodes they manage
    /// internally, where no input binding holds the chain together.
    pub fn add_dependency<S: Stage>(&self, upstream: &Process<S>) {
        self.node.outputs[self.index].add_dependency(upstream.node.clone());
    }
}

impl PartialEq for OutputRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node) && self.index == other.index
    }
}

impl fmt::Debug for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputRef")
            .field("node", &self.node.label())
            .field("output", &self.name())
            .finish()
    }
}

/// A portable reference to one input slot of a node.
#[derive(Clone)]
pub struct InputRef {
    pub(crate) node: Arc<Node>,
    pub(crate) index: usize,
}

impl InputRef {
    pub fn name(&self) -> &str {
        self.node.inputs[self.index].name()
    }

    pub fn is_set(&self) -> bool {
        self.node.inputs[self.index].is_set()
    }

    pub fn has_assigned_output(&self) -> bool {
        self.node.inputs[self.index].assigned().is_some()
    }

    /// The producer output this input is assigned to, if any.
    pub fn assigned_output(&self) -> Option<OutputRef> {
        self.node.inputs[self.index]
            .assigned()
            .map(|(node, index)| OutputRef { node, index })
    }

    /// The carrier this input currently reads, if any.
    pub fn carrier(&self) -> Option<SharedCarrier> {
        self.node.inputs[self.index].carrier()
    }

    /// What this input reads, as a connectable [`Source`]: its assigned
    /// output if it has one, else its bound carrier.
    pub fn source(&self) -> Result<Source, WiringError> {
        if let Some(output) = self.assigned_output() {
            return Ok(Source::Output(output));
        }
        match self.carrier() {
            Some(carrier) => Ok(Source::Pointer(carrier)),
            None => Err(WiringError::EmptySource {
                node: self.node.label().to_owned(),
                name: self.name().to_owned(),
            }),
        }
    }

    /// Observes backward Update emission along this input.
    pub fn on_update(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.node.inputs[self.index].on_update(Arc::new(callback));
    }
}

impl PartialEq for InputRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node) && self.index == other.index
    }
}

impl fmt::Debug for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputRef")
            .field("node", &self.node.label())
            .field("input", &self.name())
            .finish()
    }
}

/// A shared-ownership handle to a node.
///
/// This is the canonical way application code owns nodes: construct the
/// stage through [`Process::new`], wire it up, and read results through
/// [`Value`](crate::Value) handles. Cloning shares the node. The handle
/// derefs to the stage, so stage methods (tuning parameters, say) are
/// directly reachable.
pub struct Process<S: Stage> {
    node: Arc<Node>,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Stage> Process<S> {
    /// Builds a node around `stage`.
    pub fn new(stage: S) -> Result<Self, WiringError> {
        Self::build(None, stage)
    }

    /// Builds a node with an instance name, used in logs and error
    /// messages to tell multiple nodes of one stage type apart.
    pub fn named(name: impl Into<String>, stage: S) -> Result<Self, WiringError> {
        Self::build(Some(name.into()), stage)
    }

    fn build(name: Option<String>, stage: S) -> Result<Self, WiringError> {
        let mut spec = StageSpec::default();
        stage.register(&mut spec);
        let node = Node::build(name, std::any::type_name::<S>(), Box::new(stage), spec)?;
        Ok(Self {
            node,
            _marker: PhantomData,
        })
    }

    /// The node's label: the stage type name, plus the instance name if
    /// one was given.
    pub fn name(&self) -> &str {
        self.node.label()
    }

    pub fn input(&self, key: impl PortKey) -> Result<InputRef, WiringError> {
        Ok(InputRef {
            index: self.node.resolve_input(key.as_key())?,
            node: self.node.clone(),
        })
    }

    pub fn output(&self, key: impl PortKey) -> Result<OutputRef, WiringError> {
        Ok(OutputRef {
            index: self.node.resolve_output(key.as_key())?,
            node: self.node.clone(),
        })
    }

    /// Assigns an input to a source: another node's output, a bare carrier
    /// (see [`wrap`]), or whatever another input reads
    /// ([`InputRef::source`]).
    pub fn set_input(
        &self,
        key: impl PortKey,
        source: impl Into<Source>,
    ) -> Result<(), WiringError> {
        let i = self.node.resolve_input(key.as_key())?;
        match source.into() {
            Source::Output(output) => self.node.connect_input(i, &output),
            Source::Pointer(carrier) => self.node.bind_input_pointer(i, carrier),
        }
    }

    /// Disconnects an input.
    pub fn unset_input(&self, key: impl PortKey) -> Result<(), WiringError> {
        let i = self.node.resolve_input(key.as_key())?;
        self.node.unset_input(i);
        Ok(())
    }

    /// Appends a source to a multi-input.
    pub fn add_input(
        &self,
        key: impl PortKey,
        source: impl Into<Source>,
    ) -> Result<(), WiringError> {
        let m = self.node.resolve_multi(key.as_key())?;
        match source.into() {
            Source::Output(output) => self.node.add_multi_output(m, &output),
            Source::Pointer(carrier) => self.node.add_multi_pointer(m, carrier),
        }
    }

    /// Empties a multi-input.
    pub fn clear_inputs(&self, key: impl PortKey) -> Result<(), WiringError> {
        let m = self.node.resolve_multi(key.as_key())?;
        self.node.clear_multi(m);
        Ok(())
    }

    /// Marks an output stale by hand. Call after changing stage state that
    /// the output depends on but that no input feeds.
    pub fn set_dirty(&self, key: impl PortKey) -> Result<(), WiringError> {
        let o = self.node.resolve_output(key.as_key())?;
        self.node.set_dirty(o);
        Ok(())
    }

    /// Brings every stale input of this node up to date, without computing
    /// anything. Sink stages call this before reading their inputs.
    pub fn update_inputs(&self) -> Result<(), PullError> {
        self.node.update_inputs()
    }
}

impl<S: Stage> Clone for Process<S> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<S: Stage> Deref for Process<S> {
    type Target = S;

    fn deref(&self) -> &S {
        let stage: &dyn std::any::Any = self.node.stage();
        stage
            .downcast_ref::<S>()
            .expect("a Process<S> always wraps a node built from an S")
    }
}

impl<S: Stage> fmt::Debug for Process<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("node", &self.node.label())
            .finish_non_exhaustive()
    }
}
