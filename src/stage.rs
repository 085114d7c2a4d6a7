use std::any::{Any, TypeId, type_name};

use crate::carrier::{SharedCarrier, wrap};
use crate::node::locking::{Io, Strategy};

/// A computational stage: the user-supplied heart of a node.
///
/// A stage declares its slots once, in [`register`](Stage::register), and is
/// then driven entirely by the engine: whenever a consumer pulls one of the
/// node's outputs and something upstream went stale,
/// [`compute`](Stage::compute) runs with every input up to date.
///
/// Stages hold their own tunable state behind interior mutability; after
/// changing state that outputs depend on, call
/// [`Process::set_dirty`](crate::Process::set_dirty) so consumers recompute.
///
/// # Example
///
/// ```rust
/// use millrace::{Stage, StageSpec, Io};
///
/// struct Offset(i64);
///
/// impl Stage for Offset {
///     fn register(&self, spec: &mut StageSpec) {
///         spec.input::<i64>("value");
///         spec.output::<i64>("shifted");
///     }
///
///     fn compute(&self, io: &mut Io) -> anyhow::Result<()> {
///         let value: i64 = io.get("value")?;
///         io.set("shifted", value + self.0)
///     }
/// }
/// ```
pub trait Stage: Any + Send + Sync {
    /// Declares the stage's inputs, multi-inputs, outputs, and dependency
    /// hints. Called exactly once, when the node is built.
    fn register(&self, spec: &mut StageSpec);

    /// Recomputes the outputs from the inputs.
    ///
    /// The engine guarantees that every dirty input feeding the pulled
    /// output has been brought up to date, and that the carrier locks
    /// chosen by [`locking`](Stage::locking) are held for the duration of
    /// the call. Errors propagate to whoever initiated the pull; the
    /// engine never retries on its own.
    fn compute(&self, io: &mut Io<'_>) -> anyhow::Result<()>;

    /// Which carriers to lock across `compute`. Full locking is the safe
    /// default; stages that manage their own synchronisation can relax it.
    fn locking(&self) -> Strategy {
        Strategy::Full
    }
}

pub(crate) struct InputDecl {
    pub(crate) name: String,
    pub(crate) ty: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) optional: bool,
}

pub(crate) struct MultiDecl {
    pub(crate) name: String,
    pub(crate) ty: TypeId,
    pub(crate) type_name: &'static str,
}

pub(crate) struct OutputDecl {
    pub(crate) name: String,
    pub(crate) ty: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) factory: Box<dyn Fn() -> SharedCarrier + Send + Sync>,
}

pub(crate) struct HintDecl {
    pub(crate) input: String,
    pub(crate) output: String,
    pub(crate) multi: bool,
}

/// Collects a stage's slot declarations while the node is being built.
#[derive(Default)]
pub struct StageSpec {
    pub(crate) inputs: Vec<InputDecl>,
    pub(crate) multis: Vec<MultiDecl>,
    pub(crate) outputs: Vec<OutputDecl>,
    pub(crate) hints: Vec<HintDecl>,
}

impl StageSpec {
    /// Declares a required input of type `T`.
    pub fn input<T: Send + Sync + 'static>(&mut self, name: impl Into<String>) -> &mut Self {
        self.inputs.push(InputDecl {
            name: name.into(),
            ty: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            optional: false,
        });
        self
    }

    /// Declares an optional input of type `T`.
    ///
    /// An absent optional input never blocks a compute; it also starts out
    /// non-dirty, so its absence alone never forces one.
    pub fn optional_input<T: Send + Sync + 'static>(
        &mut self,
        name: impl Into<String>,
    ) -> &mut Self {
        self.inputs.push(InputDecl {
            name: name.into(),
            ty: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            optional: true,
        });
        self
    }

    /// Declares a growable multi-input with element type `T`.
    pub fn multi_input<T: Send + Sync + 'static>(&mut self, name: impl Into<String>) -> &mut Self {
        self.multis.push(MultiDecl {
            name: name.into(),
            ty: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        });
        self
    }

    /// Declares an output of type `T`, initialised with `T::default()` when
    /// the carrier is first needed.
    pub fn output<T: Default + Send + Sync + 'static>(
        &mut self,
        name: impl Into<String>,
    ) -> &mut Self {
        self.output_with(name, T::default)
    }

    /// Declares an output of type `T` with an explicit initial payload.
    pub fn output_with<T: Send + Sync + 'static>(
        &mut self,
        name: impl Into<String>,
        init: impl Fn() -> T + Send + Sync + 'static,
    ) -> &mut Self {
        self.outputs.push(OutputDecl {
            name: name.into(),
            ty: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            factory: Box::new(move || wrap(init())),
        });
        self
    }

    /// Narrows the dependency map: `output` depends on `input`.
    ///
    /// Without any hint for a given input, every output is assumed to
    /// depend on it. Once one hint names an input, only the listed outputs
    /// are recomputed when that input changes.
    pub fn depends_on(&mut self, input: impl Into<String>, output: impl Into<String>) -> &mut Self {
        self.hints.push(HintDecl {
            input: input.into(),
            output: output.into(),
            multi: false,
        });
        self
    }

    /// Like [`depends_on`](Self::depends_on), for a multi-input.
    pub fn depends_on_multi(
        &mut self,
        multi: impl Into<String>,
        output: impl Into<String>,
    ) -> &mut Self {
        self.hints.push(HintDecl {
            input: multi.into(),
            output: output.into(),
            multi: true,
        });
        self
    }
}
