//! The dirty-propagation half of the update protocol.
//!
//! A pull takes the node's update mutex, asks every stale input feeding the
//! pulled output to bring itself up to date (recursively, fanning out to
//! worker threads when the process-wide budget grants permits), and then
//! reruns the stage's compute if any output is still marked stale.
//!
//! Two races shape the ordering here. Output flags are cleared *before*
//! compute runs, so a Modified arriving mid-compute survives and forces the
//! next pull to recompute; the worst case is one redundant recompute, never
//! a lost update. And the dirty-state mutex is always released before any
//! cross-node signal goes out, because the receiving node may immediately
//! come back at us with another one.

use std::sync::Arc;
use std::sync::mpsc;

use crate::carrier::SharedCarrier;
use crate::error::PullError;
use crate::input::Input;
use crate::pool;

use super::Node;
use super::locking::Io;

/// Every dirty flag of one node; guarded by the node's dirty-state mutex.
pub(crate) struct DirtyState {
    pub(crate) inputs: Vec<bool>,
    pub(crate) multis: Vec<Vec<bool>>,
    pub(crate) outputs: Vec<bool>,
}

impl DirtyState {
    /// Everything starts dirty: outputs must be computed at least once, and
    /// input values are unknown. Optional inputs start clean so that their
    /// absence alone never forces a recompute.
    pub(crate) fn initial(inputs: &[Input], multi_count: usize, output_count: usize) -> Self {
        Self {
            inputs: inputs.iter().map(|input| !input.optional()).collect(),
            multis: vec![Vec::new(); multi_count],
            outputs: vec![true; output_count],
        }
    }

    /// Marks the given outputs dirty.
    pub(crate) fn mark_outputs(&mut self, outputs: impl IntoIterator<Item = usize>) {
        for o in outputs {
            self.outputs[o] = true;
        }
    }

    pub(crate) fn any_output_dirty(&self) -> bool {
        self.outputs.iter().any(|&flag| flag)
    }
}

impl Node {
    /// The pull procedure: brings output `o` up to date.
    ///
    /// Serialized per node by the update mutex; a concurrent pull into an
    /// already-updating node blocks here and then returns promptly once it
    /// sees clean state.
    pub(crate) fn pull(&self, o: usize) -> Result<(), PullError> {
        let _update = self.lock_update();
        tracing::trace!(node = %self.label(), output = %self.outputs[o].name(), "pull");

        let has_stale_input = {
            let mut dirty = self.lock_dirty();
            let stale_inputs: Vec<usize> = (0..self.inputs.len())
                .filter(|&i| dirty.inputs[i] && self.hints.input_feeds(i, o))
                .collect();
            let stale_multis: Vec<usize> = (0..self.multis.len())
                .filter(|&m| {
                    self.hints.multi_feeds(m, o) && dirty.multis[m].iter().any(|&flag| flag)
                })
                .collect();

            // the stale inputs are about to change, so whatever they feed
            // must be recomputed
            for &i in &stale_inputs {
                dirty.mark_outputs(self.hints.outputs_of_input(i, self.outputs.len()));
            }
            for &m in &stale_multis {
                dirty.mark_outputs(self.hints.outputs_of_multi(m, self.outputs.len()));
            }

            !stale_inputs.is_empty() || !stale_multis.is_empty()
        };

        if has_stale_input {
            self.send_update_signals(Some(o))?;
        }

        let should_compute = {
            let mut dirty = self.lock_dirty();
            if dirty.any_output_dirty() && self.required_inputs_present() {
                // cleared before compute: a Modified landing while compute
                // runs must survive it
                dirty.outputs.iter_mut().for_each(|flag| *flag = false);
                true
            } else {
                false
            }
        };

        if should_compute {
            self.lock_and_compute()?;
        } else {
            tracing::trace!(node = %self.label(), "outputs still up to date");
        }
        Ok(())
    }

    /// Brings every stale input up to date, regardless of which output it
    /// feeds. This is what sink stages call before reading their inputs,
    /// and what drives [`Value`](crate::Value) dereferencing.
    pub(crate) fn update_inputs(&self) -> Result<(), PullError> {
        let _update = self.lock_update();
        self.send_update_signals(None)
    }

    /// Clears the dirty flag of each stale input (feeding `only_for`, if
    /// given) and emits an Update backward along it. With more than one
    /// upstream branch to visit, all but one may run on worker threads.
    fn send_update_signals(&self, only_for: Option<usize>) -> Result<(), PullError> {
        let mut targets: Vec<(Arc<Node>, usize)> = Vec::new();
        let mut pulled_inputs: Vec<usize> = Vec::new();
        let mut pulled_entries: Vec<Arc<Input>> = Vec::new();

        {
            let mut dirty = self.lock_dirty();
            for (i, input) in self.inputs.iter().enumerate() {
                if !dirty.inputs[i] {
                    continue;
                }
                if let Some(o) = only_for
                    && !self.hints.input_feeds(i, o)
                {
                    continue;
                }
                dirty.inputs[i] = false;
                pulled_inputs.push(i);
                if let Some((producer, output)) = input.assigned() {
                    targets.push((producer, output));
                }
            }
            for (m, multi) in self.multis.iter().enumerate() {
                if let Some(o) = only_for
                    && !self.hints.multi_feeds(m, o)
                {
                    continue;
                }
                let entries = multi.entries();
                for (j, flag) in dirty.multis[m].iter_mut().enumerate() {
                    if !*flag {
                        continue;
                    }
                    *flag = false;
                    if let Some(entry) = entries.get(j) {
                        pulled_entries.push(entry.clone());
                        if let Some((producer, output)) = entry.assigned() {
                            targets.push((producer, output));
                        }
                    }
                }
            }
        }

        // backward-signal observers fire outside the dirty lock
        for &i in &pulled_inputs {
            self.inputs[i].notify_update();
        }
        for entry in &pulled_entries {
            entry.notify_update();
        }

        if targets.is_empty() {
            return Ok(());
        }
        tracing::trace!(node = %self.label(), upstream = targets.len(), "sending update signals");
        if targets.len() == 1 {
            let (producer, output) = targets.remove(0);
            return producer.pull(output);
        }
        self.pull_upstream(targets)
    }

    /// Fans the update requests out: branches that get a budget permit run
    /// on worker threads, the rest (always at least the last one) run right
    /// here. Joins everything before returning; the first error wins.
    fn pull_upstream(&self, mut targets: Vec<(Arc<Node>, usize)>) -> Result<(), PullError> {
        let budget = pool::budget();
        let last = targets.pop().expect("at least two upstream targets");
        let (sender, receiver) = mpsc::channel();

        let first_error: Option<PullError> = rayon::scope(move |scope| {
            let mut inline = Vec::new();
            let mut spawned = 0usize;
            let mut first_error: Option<PullError> = None;

            for (producer, output) in targets {
                match budget.try_acquire() {
                    Some(permit) => {
                        let sender = sender.clone();
                        spawned += 1;
                        scope.spawn(move |_| {
                            let result = producer.pull(output);
                            drop(permit);
                            let _ = sender.send(result);
                        });
                    }
                    None => inline.push((producer, output)),
                }
            }
            inline.push(last);

            for (producer, output) in inline {
                if let Err(error) = producer.pull(output)
                    && first_error.is_none()
                {
                    first_error = Some(error);
                }
            }
            for _ in 0..spawned {
                if let Ok(Err(error)) = receiver.recv()
                    && first_error.is_none()
                {
                    first_error = Some(error);
                }
            }
            first_error
        });

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// A required input is present once its binding holds a carrier, either
    /// bound directly or mirrored from an assigned output.
    pub(crate) fn required_inputs_present(&self) -> bool {
        self.inputs
            .iter()
            .all(|input| input.optional() || input.carrier().is_some())
    }

    /// Pins the carriers, takes the locks the strategy asks for (inputs
    /// left to right, then outputs left to right), and runs the stage.
    fn lock_and_compute(&self) -> Result<(), PullError> {
        let strategy = self.strategy();

        let input_pins: Vec<Option<SharedCarrier>> =
            self.inputs.iter().map(|input| input.carrier()).collect();
        let multi_pins: Vec<Vec<Option<SharedCarrier>>> = self
            .multis
            .iter()
            .map(|multi| {
                multi
                    .entries()
                    .iter()
                    .map(|entry| entry.carrier())
                    .collect()
            })
            .collect();
        // write-locking an output pins its carrier first, so a concurrent
        // pointer replacement cannot free the locked carrier under us
        let output_pins: Vec<Option<SharedCarrier>> = self
            .outputs
            .iter()
            .map(|output| {
                if strategy.locks_outputs() {
                    Some(output.ensure())
                } else {
                    output.carrier()
                }
            })
            .collect();

        let mut io = Io::new(self, &input_pins, &multi_pins, &output_pins);
        io.acquire(strategy);

        tracing::debug!(node = %self.label(), "computing");
        self.stage().compute(&mut io).map_err(|error| {
            tracing::warn!(node = %self.label(), %error, "compute failed");
            PullError::Compute(self.label().to_owned(), error)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::TypeId;

    fn plain_input(name: &str, optional: bool) -> Input {
        Input::new(
            name.to_owned(),
            TypeId::of::<i64>(),
            std::any::type_name::<i64>(),
            optional,
        )
    }

    #[test]
    fn initial_state_is_dirty_except_optionals() {
        let inputs = [plain_input("a", false), plain_input("b", true)];
        let state = DirtyState::initial(&inputs, 1, 2);

        assert_eq!(state.inputs, vec![true, false]);
        assert!(state.multis[0].is_empty());
        assert_eq!(state.outputs, vec![true, true]);
    }

    #[test]
    fn mark_outputs_is_idempotent() {
        let inputs = [plain_input("a", false)];
        let mut state = DirtyState::initial(&inputs, 0, 3);
        state.outputs = vec![false, true, false];

        state.mark_outputs([0, 2]);
        assert_eq!(state.outputs, vec![true, true, true]);
        assert!(state.any_output_dirty());

        state.mark_outputs([0, 1, 2]);
        assert_eq!(state.outputs, vec![true, true, true]);
    }
}
