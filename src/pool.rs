//! Process-wide worker budget for parallel upstream pulls.
//!
//! When a node fans out update requests to several stale inputs at once, it
//! may run all but one of them on worker threads, provided the budget grants
//! permits. The budget is shared by the whole process and is seeded exactly
//! once, when the first node is constructed. With the default of zero extra
//! workers every pull runs fully sequentially on the calling thread.

use std::sync::{LazyLock, Mutex};

/// Process-wide engine options.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Additional worker threads available to the update fan-out.
    ///
    /// Zero means fully sequential operation. The value is read once, when
    /// the first node is built; later changes have no effect.
    pub num_threads: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { num_threads: 0 }
    }
}

static OPTIONS: Mutex<Option<Options>> = Mutex::new(None);

/// Sets the process-wide options.
///
/// Must be called before the first node is constructed; afterwards the
/// budget is already seeded and the call is ignored (with a warning).
pub fn configure(options: Options) {
    if *BUDGET_SEEDED.lock().expect("options lock poisoned") {
        tracing::warn!("configure() called after the worker budget was seeded; ignored");
        return;
    }
    *OPTIONS.lock().expect("options lock poisoned") = Some(options);
}

static BUDGET_SEEDED: Mutex<bool> = Mutex::new(false);

static BUDGET: LazyLock<WorkerBudget> = LazyLock::new(|| {
    *BUDGET_SEEDED.lock().expect("options lock poisoned") = true;
    let configured = OPTIONS.lock().expect("options lock poisoned").take();
    let workers = match configured {
        Some(options) => options.num_threads,
        None => std::env::var("MILLRACE_NUM_THREADS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0),
    };
    tracing::debug!(workers, "seeding worker budget");
    WorkerBudget::new(workers)
});

/// The shared budget, seeding it on first use.
pub(crate) fn budget() -> &'static WorkerBudget {
    &BUDGET
}

/// A counting permit pool.
///
/// Permits are handed out to update fan-outs that want to pull an upstream
/// branch on a worker thread and flow back when the branch finishes. A node
/// that gets no permit pulls the branch itself.
pub(crate) struct WorkerBudget {
    available: Mutex<usize>,
}

impl WorkerBudget {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            available: Mutex::new(workers),
        }
    }

    /// Takes one permit, if any is free.
    pub(crate) fn try_acquire(&self) -> Option<BudgetPermit<'_>> {
        let mut available = self.available.lock().expect("budget lock poisoned");
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(BudgetPermit { budget: self })
    }

    fn release(&self) {
        *self.available.lock().expect("budget lock poisoned") += 1;
    }
}

/// RAII permit; returns to the budget on drop.
pub(crate) struct BudgetPermit<'a> {
    budget: &'a WorkerBudget,
}

impl Drop for BudgetPermit<'_> {
    fn drop(&mut self) {
        self.budget.release();
    }
}
