use std::any::{TypeId, type_name};
use std::sync::{RwLockReadGuard, RwLockWriteGuard};

use anyhow::anyhow;

use crate::carrier::{Payload, SharedCarrier};
use crate::error::WiringError;
use crate::process::PortKey;

use super::Node;

/// Which carriers to lock for the duration of a stage's compute.
///
/// Locks are taken in a fixed order (single inputs left to right, then
/// outputs left to right) and released when compute returns. Whatever the
/// strategy, [`Io`] accessors that touch an unlocked carrier take a short
/// lock of their own for just that access, so relaxing the strategy trades
/// consistency across the whole compute, not memory safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// No locks held across compute.
    None,
    /// Read locks on every assigned input carrier.
    InputOnly,
    /// Write locks on every output carrier, creating absent ones first.
    OutputOnly,
    /// Both. Safe, potentially conservative; the default.
    #[default]
    Full,
}

impl Strategy {
    pub(crate) fn locks_inputs(self) -> bool {
        matches!(self, Strategy::InputOnly | Strategy::Full)
    }

    pub(crate) fn locks_outputs(self) -> bool {
        matches!(self, Strategy::OutputOnly | Strategy::Full)
    }
}

/// The stage's window onto its node during compute.
///
/// Every slot's carrier was pinned (a shared copy taken) before any lock was
/// acquired, so a concurrent pointer replacement on a producer output never
/// frees a carrier out from under a running compute; the replacement simply
/// becomes visible on the next pull.
pub struct Io<'a> {
    node: &'a Node,
    input_pins: &'a [Option<SharedCarrier>],
    multi_pins: &'a [Vec<Option<SharedCarrier>>],
    output_pins: &'a [Option<SharedCarrier>],
    input_guards: Vec<Option<RwLockReadGuard<'a, Payload>>>,
    output_guards: Vec<Option<RwLockWriteGuard<'a, Payload>>>,
}

impl<'a> Io<'a> {
    pub(crate) fn new(
        node: &'a Node,
        input_pins: &'a [Option<SharedCarrier>],
        multi_pins: &'a [Vec<Option<SharedCarrier>>],
        output_pins: &'a [Option<SharedCarrier>],
    ) -> Self {
        Self {
            node,
            input_pins,
            multi_pins,
            output_pins,
            input_guards: (0..input_pins.len()).map(|_| None).collect(),
            output_guards: (0..output_pins.len()).map(|_| None).collect(),
        }
    }

    pub(crate) fn acquire(&mut self, strategy: Strategy) {
        let input_pins = self.input_pins;
        let output_pins = self.output_pins;
        if strategy.locks_inputs() {
            for (i, pin) in input_pins.iter().enumerate() {
                if let Some(carrier) = pin {
                    self.input_guards[i] = Some(carrier.read());
                }
            }
        }
        if strategy.locks_outputs() {
            for (o, pin) in output_pins.iter().enumerate() {
                if let Some(carrier) = pin {
                    self.output_guards[o] = Some(carrier.write());
                }
            }
        }
    }

    /// Reads an input, cloning the payload out.
    ///
    /// Fails if the input is unset; optional inputs are better read through
    /// [`try_get`](Self::try_get).
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: impl PortKey) -> anyhow::Result<T> {
        let i = self.node.resolve_input(key.as_key())?;
        match self.read_input(i)? {
            Some(value) => Ok(value),
            None => Err(anyhow!(
                "input '{}' on node '{}' is not set",
                self.node.inputs[i].name(),
                self.node.label()
            )),
        }
    }

    /// Reads an input that may be absent. `Ok(None)` means unset.
    pub fn try_get<T: Clone + Send + Sync + 'static>(
        &self,
        key: impl PortKey,
    ) -> anyhow::Result<Option<T>> {
        let i = self.node.resolve_input(key.as_key())?;
        self.read_input(i)
    }

    /// Whether the input currently has a value.
    pub fn is_set(&self, key: impl PortKey) -> anyhow::Result<bool> {
        let i = self.node.resolve_input(key.as_key())?;
        Ok(self.input_pins[i].is_some())
    }

    /// Reads every entry of a multi-input, in insertion order.
    pub fn gather<T: Clone + Send + Sync + 'static>(
        &self,
        key: impl PortKey,
    ) -> anyhow::Result<Vec<T>> {
        let m = self.node.resolve_multi(key.as_key())?;
        let slot = self.node.multis[m].name();
        let mut values = Vec::with_capacity(self.multi_pins[m].len());
        for pin in &self.multi_pins[m] {
            if let Some(carrier) = pin {
                let guard = carrier.read();
                values.push(payload_to::<T>(self.node.label(), slot, &guard)?);
            }
        }
        Ok(values)
    }

    /// The current number of entries on a multi-input.
    pub fn multi_len(&self, key: impl PortKey) -> anyhow::Result<usize> {
        let m = self.node.resolve_multi(key.as_key())?;
        Ok(self.multi_pins[m].len())
    }

    /// Writes an output's value in place.
    ///
    /// The carrier pointer does not change, so attached consumers keep
    /// reading the same carrier and simply observe the new payload.
    pub fn set<T: Send + Sync + 'static>(
        &mut self,
        key: impl PortKey,
        value: T,
    ) -> anyhow::Result<()> {
        let o = self.resolve_typed_output::<T>(key)?;
        if let Some(guard) = &mut self.output_guards[o] {
            **guard = Box::new(value);
            return Ok(());
        }
        match &self.output_pins[o] {
            Some(pin) => pin.store(value),
            None => self.node.outputs[o].ensure().store(value),
        }
        Ok(())
    }

    /// Mutates an output's value in place.
    pub fn update<T: Send + Sync + 'static, R>(
        &mut self,
        key: impl PortKey,
        f: impl FnOnce(&mut T) -> R,
    ) -> anyhow::Result<R> {
        let o = self.resolve_typed_output::<T>(key)?;
        let slot = self.node.outputs[o].name();
        if let Some(guard) = &mut self.output_guards[o] {
            return match guard.downcast_mut::<T>() {
                Some(value) => Ok(f(value)),
                None => Err(wrong_payload::<T>(self.node.label(), slot)),
            };
        }
        let carrier = match &self.output_pins[o] {
            Some(pin) => pin.clone(),
            None => self.node.outputs[o].ensure(),
        };
        let mut guard = carrier.write();
        match guard.downcast_mut::<T>() {
            Some(value) => Ok(f(value)),
            None => Err(wrong_payload::<T>(self.node.label(), slot)),
        }
    }

    /// Replaces an output's carrier outright and notifies attached
    /// consumers so they mirror the new pointer.
    ///
    /// If the strategy write-locked this output, that lock stays on the
    /// *replaced* carrier: later in-place writes through [`set`](Self::set)
    /// in the same compute would land on the old carrier. Replace last, or
    /// use an unlocked strategy, when mixing the two styles.
    pub fn set_carrier(
        &mut self,
        key: impl PortKey,
        carrier: SharedCarrier,
    ) -> anyhow::Result<()> {
        let o = self.node.resolve_output(key.as_key())?;
        self.node.outputs[o].check_type(&carrier, self.node.label())?;
        self.node.outputs[o].replace(carrier);
        Ok(())
    }

    fn read_input<T: Clone + Send + Sync + 'static>(
        &self,
        i: usize,
    ) -> anyhow::Result<Option<T>> {
        let slot = self.node.inputs[i].name();
        if let Some(guard) = &self.input_guards[i] {
            return payload_to::<T>(self.node.label(), slot, guard).map(Some);
        }
        match &self.input_pins[i] {
            Some(carrier) => {
                let guard = carrier.read();
                payload_to::<T>(self.node.label(), slot, &guard).map(Some)
            }
            None => Ok(None),
        }
    }

    fn resolve_typed_output<T: Send + Sync + 'static>(
        &self,
        key: impl PortKey,
    ) -> anyhow::Result<usize> {
        let o = self.node.resolve_output(key.as_key())?;
        let output = &self.node.outputs[o];
        if output.payload_type() != TypeId::of::<T>() {
            return Err(WiringError::Assignment {
                node: self.node.label().to_owned(),
                slot: output.name().to_owned(),
                expected: output.type_name(),
                found: type_name::<T>(),
            }
            .into());
        }
        Ok(o)
    }
}

fn payload_to<T: Clone + 'static>(
    node: &str,
    slot: &str,
    payload: &Payload,
) -> anyhow::Result<T> {
    match payload.downcast_ref::<T>() {
        Some(value) => Ok(value.clone()),
        None => Err(wrong_payload::<T>(node, slot)),
    }
}

fn wrong_payload<T>(node: &str, slot: &str) -> anyhow::Error {
    anyhow!(
        "slot '{slot}' on node '{node}' does not hold a value of type '{}'",
        type_name::<T>()
    )
}
