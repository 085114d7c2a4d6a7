use std::marker::PhantomData;
use std::sync::Arc;

use crate::carrier::{SharedCarrier, wrap};
use crate::error::{PullError, WiringError};
use crate::node::Node;
use crate::node::locking::Io;
use crate::process::{InputRef, OutputRef, Source};
use crate::stage::{Stage, StageSpec};

/// The hidden stage behind a [`Value`]: one input, no outputs, nothing to
/// compute. Its whole purpose is to drive the pull.
struct ValueTap<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Stage for ValueTap<T> {
    fn register(&self, spec: &mut StageSpec) {
        spec.input::<T>("value");
    }

    fn compute(&self, _io: &mut Io<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A lazily-updated view of a value flowing through the graph.
///
/// Reading a `Value` pulls its upstream cone up to date first, so the read
/// always observes the freshest data, and costs nothing beyond a few flag
/// checks when nothing changed. Holding a `Value` keeps everything it reads
/// from alive.
///
/// ```rust
/// use millrace::{Value, wrap};
///
/// let v = Value::new(2i64);
/// assert_eq!(v.get().unwrap(), 2);
///
/// let w = Value::<i64>::from_carrier(wrap(3i64)).unwrap();
/// assert_eq!(w.with(|n| n * 10).unwrap(), 30);
/// ```
pub struct Value<T: Send + Sync + 'static> {
    updater: Arc<Node>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Value<T> {
    fn updater() -> Arc<Node> {
        let tap = ValueTap::<T> {
            _marker: PhantomData,
        };
        let mut spec = StageSpec::default();
        tap.register(&mut spec);
        Node::build(
            None,
            std::any::type_name::<ValueTap<T>>(),
            Box::new(tap),
            spec,
        )
        .expect("a value updater has one fixed slot")
    }

    fn wrap_updater(updater: Arc<Node>) -> Self {
        Self {
            updater,
            _marker: PhantomData,
        }
    }

    /// A value over a literal; no producer, never recomputed.
    pub fn new(value: T) -> Self {
        let updater = Self::updater();
        updater
            .bind_input_pointer(0, wrap(value))
            .expect("a literal always matches the tap's input type");
        Self::wrap_updater(updater)
    }

    /// A value reading a producer output. Fails if the output's payload
    /// type is not `T`.
    pub fn from_output(output: &OutputRef) -> Result<Self, WiringError> {
        let updater = Self::updater();
        updater.connect_input(0, output)?;
        Ok(Self::wrap_updater(updater))
    }

    /// A value over an existing carrier. Fails if the payload type is not
    /// `T`.
    pub fn from_carrier(carrier: SharedCarrier) -> Result<Self, WiringError> {
        let updater = Self::updater();
        updater.bind_input_pointer(0, carrier)?;
        Ok(Self::wrap_updater(updater))
    }

    /// A value reading whatever `input` reads: its assigned output if it
    /// has one, else its bound carrier.
    pub fn from_input(input: &InputRef) -> Result<Self, WiringError> {
        match input.source()? {
            Source::Output(output) => Self::from_output(&output),
            Source::Pointer(carrier) => Self::from_carrier(carrier),
        }
    }

    /// Pulls the upstream cone up to date and clones the value out.
    pub fn get(&self) -> Result<T, PullError>
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Pulls, then runs `f` on the value under the carrier's read lock.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, PullError> {
        Ok(self.carrier()?.with(f))
    }

    /// Pulls, then hands out the current carrier.
    pub fn carrier(&self) -> Result<SharedCarrier, PullError> {
        self.updater.update_inputs()?;
        Ok(self
            .updater
            .inputs[0]
            .carrier()
            .expect("a value handle is always bound"))
    }
}

impl<T: Send + Sync + 'static> Clone for Value<T> {
    /// Shares the upstream assignment; both handles read the same data.
    fn clone(&self) -> Self {
        Self {
            updater: self.updater.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for Value<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("type", &std::any::type_name::<T>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WiringError;

    #[test]
    fn literal_values_read_back() {
        let value = Value::new(41i64);
        assert_eq!(value.get().unwrap(), 41);
        assert_eq!(value.with(|n| n + 1).unwrap(), 42);
    }

    #[test]
    fn carrier_type_is_checked() {
        let err = Value::<i64>::from_carrier(wrap(String::from("nope"))).unwrap_err();
        assert!(matches!(err, WiringError::Assignment { .. }));
    }

    #[test]
    fn clones_share_the_assignment() {
        let value = Value::new(String::from("shared"));
        let other = value.clone();
        assert_eq!(value.get().unwrap(), other.get().unwrap());
    }
}
