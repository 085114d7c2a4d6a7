//! End-to-end pulls through small graphs: chains, optional inputs, fan-in,
//! fan-out, concurrent modification, and wiring failures.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use millrace::{Io, Process, Stage, StageSpec, Value, WiringError, wrap};

fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_test_writer()
            .try_init();
    });
}

/// A source holding a tunable number.
struct Constant {
    value: Mutex<i64>,
    runs: AtomicUsize,
}

impl Constant {
    fn new(value: i64) -> Self {
        Self {
            value: Mutex::new(value),
            runs: AtomicUsize::new(0),
        }
    }

    fn set(&self, value: i64) {
        *self.value.lock().unwrap() = value;
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Stage for Constant {
    fn register(&self, spec: &mut StageSpec) {
        spec.output::<i64>("x");
    }

    fn compute(&self, io: &mut Io) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        io.set("x", *self.value.lock().unwrap())
    }
}

#[derive(Default)]
struct Double {
    runs: AtomicUsize,
}

impl Double {
    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Stage for Double {
    fn register(&self, spec: &mut StageSpec) {
        spec.input::<i64>("a");
        spec.output::<i64>("y");
    }

    fn compute(&self, io: &mut Io) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let a: i64 = io.get("a")?;
        io.set("y", a * 2)
    }
}

#[derive(Default)]
struct AddFive {
    runs: AtomicUsize,
}

impl AddFive {
    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Stage for AddFive {
    fn register(&self, spec: &mut StageSpec) {
        spec.input::<i64>("b");
        spec.output::<i64>("z");
    }

    fn compute(&self, io: &mut Io) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let b: i64 = io.get("b")?;
        io.set("z", b + 5)
    }
}

#[test]
fn chain_of_three_ints() {
    init_logging();

    let a = Process::named("a", Constant::new(1)).unwrap();
    let b = Process::named("b", Double::default()).unwrap();
    let c = Process::named("c", AddFive::default()).unwrap();
    b.set_input("a", a.output("x").unwrap()).unwrap();
    c.set_input("b", b.output("y").unwrap()).unwrap();

    let v = Value::<i64>::from_output(&c.output("z").unwrap()).unwrap();

    assert_eq!(v.get().unwrap(), 7); // 1*2 + 5
    assert_eq!((a.runs(), b.runs(), c.runs()), (1, 1, 1));

    // nothing changed, nothing recomputes
    assert_eq!(v.get().unwrap(), 7);
    assert_eq!((a.runs(), b.runs(), c.runs()), (1, 1, 1));

    a.set(3);
    a.set_dirty("x").unwrap();
    assert_eq!(v.get().unwrap(), 11); // 3*2 + 5

    a.set(4);
    a.set_dirty("x").unwrap();
    assert_eq!(v.get().unwrap(), 13); // 4*2 + 5

    // across the two modifications, B and C each ran twice more
    assert_eq!((a.runs(), b.runs(), c.runs()), (3, 3, 3));
}

/// Required `r`, optional `o`, output `s = r + o.unwrap_or(0)`.
#[derive(Default)]
struct OptionalSum {
    runs: AtomicUsize,
}

impl Stage for OptionalSum {
    fn register(&self, spec: &mut StageSpec) {
        spec.input::<i64>("r");
        spec.optional_input::<i64>("o");
        spec.output::<i64>("s");
    }

    fn compute(&self, io: &mut Io) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let r: i64 = io.get("r")?;
        let o: i64 = io.try_get("o")?.unwrap_or(0);
        io.set("s", r + o)
    }
}

#[test]
fn optional_input_comes_and_goes() {
    init_logging();

    let d = Process::new(OptionalSum::default()).unwrap();
    d.set_input("r", wrap(10i64)).unwrap();

    let v = Value::<i64>::from_output(&d.output("s").unwrap()).unwrap();
    assert_eq!(v.get().unwrap(), 10);

    d.set_input("o", wrap(5i64)).unwrap();
    assert_eq!(v.get().unwrap(), 15);

    d.unset_input("o").unwrap();
    assert_eq!(v.get().unwrap(), 10);
    assert!(!d.input("o").unwrap().is_set());
}

#[test]
fn missing_required_input_blocks_compute() {
    init_logging();

    let d = Process::new(OptionalSum::default()).unwrap();
    let v = Value::<i64>::from_output(&d.output("s").unwrap()).unwrap();

    // without `r`, compute never runs; the read observes the initial payload
    assert_eq!(v.get().unwrap(), 0);
    assert_eq!(d.runs.load(Ordering::SeqCst), 0);

    d.set_input("r", wrap(3i64)).unwrap();
    assert_eq!(v.get().unwrap(), 3);
    assert_eq!(d.runs.load(Ordering::SeqCst), 1);
}

/// Sums every entry of its multi-input.
#[derive(Default)]
struct FanSum {
    runs: AtomicUsize,
}

impl Stage for FanSum {
    fn register(&self, spec: &mut StageSpec) {
        spec.multi_input::<i64>("xs");
        spec.output::<i64>("sum");
    }

    fn compute(&self, io: &mut Io) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let total: i64 = io.gather::<i64>("xs")?.into_iter().sum();
        io.set("sum", total)
    }
}

#[test]
fn multi_input_sum() {
    init_logging();

    let sources: Vec<_> = (1..=3)
        .map(|n| Process::new(Constant::new(n)).unwrap())
        .collect();
    let e = Process::new(FanSum::default()).unwrap();
    for source in &sources {
        e.add_input("xs", source.output("x").unwrap()).unwrap();
    }

    let v = Value::<i64>::from_output(&e.output("sum").unwrap()).unwrap();
    assert_eq!(v.get().unwrap(), 6);

    e.clear_inputs("xs").unwrap();
    assert_eq!(v.get().unwrap(), 0);

    e.add_input("xs", wrap(7i64)).unwrap();
    e.add_input("xs", wrap(8i64)).unwrap();
    assert_eq!(v.get().unwrap(), 15);
}

#[test]
fn multi_input_entry_modification_propagates() {
    init_logging();

    let source = Process::new(Constant::new(1)).unwrap();
    let e = Process::new(FanSum::default()).unwrap();
    e.add_input("xs", source.output("x").unwrap()).unwrap();
    e.add_input("xs", wrap(10i64)).unwrap();

    let v = Value::<i64>::from_output(&e.output("sum").unwrap()).unwrap();
    assert_eq!(v.get().unwrap(), 11);

    source.set(5);
    source.set_dirty("x").unwrap();
    assert_eq!(v.get().unwrap(), 15);
}

#[test]
fn fan_out_computes_the_source_once() {
    init_logging();

    let s = Process::new(Constant::new(5)).unwrap();
    let t1 = Process::new(Double::default()).unwrap();
    let t2 = Process::new(Double::default()).unwrap();
    t1.set_input("a", s.output("x").unwrap()).unwrap();
    t2.set_input("a", s.output("x").unwrap()).unwrap();

    let v1 = Value::<i64>::from_output(&t1.output("y").unwrap()).unwrap();
    let v2 = Value::<i64>::from_output(&t2.output("y").unwrap()).unwrap();

    assert_eq!(v1.get().unwrap(), 10);
    assert_eq!(v2.get().unwrap(), 10);
    assert_eq!(s.runs(), 1);
}

/// A source whose compute takes long enough to race against.
struct Slow {
    value: Mutex<i64>,
    runs: AtomicUsize,
    computing: Arc<AtomicBool>,
}

impl Stage for Slow {
    fn register(&self, spec: &mut StageSpec) {
        spec.output::<i64>("x");
    }

    fn compute(&self, io: &mut Io) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.computing.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(200));
        io.set("x", *self.value.lock().unwrap())
    }
}

#[test]
fn modification_during_compute_forces_a_recompute() {
    init_logging();

    let computing = Arc::new(AtomicBool::new(false));
    let p = Process::new(Slow {
        value: Mutex::new(1),
        runs: AtomicUsize::new(0),
        computing: computing.clone(),
    })
    .unwrap();
    let v = Value::<i64>::from_output(&p.output("x").unwrap()).unwrap();

    let reader = {
        let v = v.clone();
        std::thread::spawn(move || v.get().unwrap())
    };

    // wait until compute is running, then dirty the output under it
    while !computing.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(5));
    }
    p.set_dirty("x").unwrap();

    reader.join().unwrap();

    // the concurrent set_dirty survived the in-flight compute
    assert_eq!(v.get().unwrap(), 1);
    assert!(p.runs.load(Ordering::SeqCst) >= 2);
}

struct TextSource;

impl Stage for TextSource {
    fn register(&self, spec: &mut StageSpec) {
        spec.output::<String>("text");
    }

    fn compute(&self, io: &mut Io) -> anyhow::Result<()> {
        io.set("text", String::from("hello"))
    }
}

#[test]
fn type_mismatch_is_rejected_and_harmless() {
    init_logging();

    let s = Process::new(TextSource).unwrap();
    let d = Process::new(Double::default()).unwrap();

    let err = d.set_input("a", s.output("text").unwrap()).unwrap_err();
    assert!(matches!(err, WiringError::Assignment { .. }));
    assert!(!d.input("a").unwrap().is_set());

    // the graph is otherwise unharmed; a compatible connection still works
    let ok = Process::new(Constant::new(2)).unwrap();
    d.set_input("a", ok.output("x").unwrap()).unwrap();
    let v = Value::<i64>::from_output(&d.output("y").unwrap()).unwrap();
    assert_eq!(v.get().unwrap(), 4);
}

#[test]
fn connections_mirror_the_producer_carrier() {
    init_logging();

    let s = Process::new(Constant::new(1)).unwrap();
    let t = Process::new(Double::default()).unwrap();
    let output = s.output("x").unwrap();
    t.set_input("a", &output).unwrap();

    let input = t.input("a").unwrap();
    assert!(input.has_assigned_output());
    assert_eq!(input.assigned_output().unwrap(), output);
    assert!(Arc::ptr_eq(
        &input.carrier().unwrap(),
        &output.carrier().unwrap()
    ));

    // replacing the output's pointer re-mirrors before any pull
    output.set(9i64).unwrap();
    assert!(Arc::ptr_eq(
        &input.carrier().unwrap(),
        &output.carrier().unwrap()
    ));
    assert_eq!(input.carrier().unwrap().cloned::<i64>(), 9);
}

#[test]
fn values_can_share_an_input_assignment() {
    init_logging();

    let s = Process::new(Constant::new(6)).unwrap();
    let t = Process::new(Double::default()).unwrap();
    t.set_input("a", s.output("x").unwrap()).unwrap();

    // a value built from the input reads the same upstream output
    let v = Value::<i64>::from_input(&t.input("a").unwrap()).unwrap();
    assert_eq!(v.get().unwrap(), 6);

    // and another node can connect to whatever that input reads
    let u = Process::new(Double::default()).unwrap();
    u.set_input("a", t.input("a").unwrap().source().unwrap())
        .unwrap();
    let w = Value::<i64>::from_output(&u.output("y").unwrap()).unwrap();
    assert_eq!(w.get().unwrap(), 12);
}

/// Two independent inputs, one output per input, wired with dependency
/// hints so each output only pulls its own side.
#[derive(Default)]
struct Pair {
    runs: AtomicUsize,
}

impl Stage for Pair {
    fn register(&self, spec: &mut StageSpec) {
        spec.input::<i64>("a");
        spec.input::<i64>("b");
        spec.output::<i64>("left");
        spec.output::<i64>("right");
        spec.depends_on("a", "left");
        spec.depends_on("b", "right");
    }

    fn compute(&self, io: &mut Io) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let a: i64 = io.get("a")?;
        let b: i64 = io.get("b")?;
        io.set("left", a)?;
        io.set("right", b)
    }
}

#[test]
fn dependency_hints_limit_upstream_pulls() {
    init_logging();

    let a = Process::new(Constant::new(1)).unwrap();
    let b = Process::new(Constant::new(2)).unwrap();
    let pair = Process::new(Pair::default()).unwrap();
    pair.set_input("a", a.output("x").unwrap()).unwrap();
    pair.set_input("b", b.output("x").unwrap()).unwrap();

    let left = Value::<i64>::from_output(&pair.output("left").unwrap()).unwrap();
    let right = Value::<i64>::from_output(&pair.output("right").unwrap()).unwrap();
    assert_eq!(left.get().unwrap(), 1);
    assert_eq!(right.get().unwrap(), 2);

    // modify only b's source; pulling `left` must not pull `b`
    b.set(20);
    b.set_dirty("x").unwrap();
    let b_runs = b.runs();
    assert_eq!(left.get().unwrap(), 1);
    assert_eq!(b.runs(), b_runs);

    // pulling `right` picks the change up
    assert_eq!(right.get().unwrap(), 20);
    assert!(b.runs() > b_runs);
}

#[test]
fn wiring_errors_carry_context() {
    init_logging();

    let d = Process::new(Double::default()).unwrap();

    assert!(matches!(
        d.output("nope").unwrap_err(),
        WiringError::NoSuchOutput { .. }
    ));
    assert!(matches!(
        d.input("nope").unwrap_err(),
        WiringError::NoSuchInput { .. }
    ));
    assert!(matches!(
        d.input(7usize).unwrap_err(),
        WiringError::NotEnoughInputs { index: 7, .. }
    ));
    assert!(matches!(
        d.output(1usize).unwrap_err(),
        WiringError::NotEnoughOutputs { index: 1, .. }
    ));
    // `Double` has no multi-inputs to add to
    assert!(matches!(
        d.add_input(0usize, wrap(1i64)).unwrap_err(),
        WiringError::NotEnoughInputs { .. }
    ));
}

#[test]
fn update_observers_fire_on_pull() {
    init_logging();

    let s = Process::new(Constant::new(1)).unwrap();
    let t = Process::new(Double::default()).unwrap();
    t.set_input("a", s.output("x").unwrap()).unwrap();

    let updates = Arc::new(AtomicUsize::new(0));
    let seen = updates.clone();
    t.input("a").unwrap().on_update(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let v = Value::<i64>::from_output(&t.output("y").unwrap()).unwrap();
    v.get().unwrap();
    assert_eq!(updates.load(Ordering::SeqCst), 1);

    // clean pulls emit no Update along the input
    v.get().unwrap();
    assert_eq!(updates.load(Ordering::SeqCst), 1);
}

/// A sink with no outputs; records what it saw each time it is flushed.
struct Sink {
    seen: Mutex<Vec<i64>>,
}

impl Stage for Sink {
    fn register(&self, spec: &mut StageSpec) {
        spec.input::<i64>("in");
    }

    fn compute(&self, _io: &mut Io) -> anyhow::Result<()> {
        Ok(())
    }
}

fn flush(sink: &Process<Sink>) -> anyhow::Result<()> {
    sink.update_inputs()?;
    let value = sink
        .input("in")?
        .carrier()
        .map(|c| c.cloned::<i64>())
        .unwrap_or_default();
    sink.seen.lock().unwrap().push(value);
    Ok(())
}

#[test]
fn sinks_update_their_inputs_by_hand() {
    init_logging();

    let s = Process::new(Constant::new(3)).unwrap();
    let sink = Process::new(Sink {
        seen: Mutex::new(Vec::new()),
    })
    .unwrap();
    sink.set_input("in", s.output("x").unwrap()).unwrap();

    flush(&sink).unwrap();
    s.set(8);
    s.set_dirty("x").unwrap();
    flush(&sink).unwrap();

    assert_eq!(*sink.seen.lock().unwrap(), vec![3, 8]);
}
