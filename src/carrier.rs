use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A type-erased, thread-safe payload box.
pub(crate) type Payload = Box<dyn Any + Send + Sync>;

/// A reference-counted value envelope.
///
/// Every value travelling through the graph lives inside a carrier. The
/// payload sits behind a per-instance reader/writer lock, which is the lock
/// the locking strategies acquire for the duration of a stage's `compute`.
/// Inputs and outputs share carriers; a carrier is dropped once the last
/// slot or [`Value`](crate::Value) referencing it lets go.
///
/// The payload type of a carrier never changes after construction. Slots
/// check it once when a connection is made; that check is the only runtime
/// type guard in the update protocol.
pub struct Carrier {
    cell: RwLock<Payload>,
    ty: TypeId,
    type_name: &'static str,
}

/// Shared handle to a [`Carrier`].
pub type SharedCarrier = Arc<Carrier>;

impl Carrier {
    /// Creates a carrier around `value`.
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self {
            cell: RwLock::new(Box::new(value)),
            ty: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    /// The `TypeId` of the payload.
    pub fn payload_type(&self) -> TypeId {
        self.ty
    }

    /// The payload type name, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether the payload is a `T`.
    pub fn holds<T: 'static>(&self) -> bool {
        self.ty == TypeId::of::<T>()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Payload> {
        self.cell.read().expect("carrier lock poisoned")
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Payload> {
        self.cell.write().expect("carrier lock poisoned")
    }

    /// Runs `f` on the payload under a read lock.
    ///
    /// # Panics
    ///
    /// Panics if the payload is not a `T`. Connections are type-checked when
    /// they are made, so reaching this with the wrong type is a logic error.
    pub fn with<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.read();
        f(downcast(&guard))
    }

    /// Clones the payload out from under a read lock.
    pub fn cloned<T: Clone + 'static>(&self) -> T {
        self.with(|value: &T| value.clone())
    }

    /// Replaces the payload under a write lock. The replacement must have
    /// the carrier's payload type.
    pub(crate) fn store<T: Send + Sync + 'static>(&self, value: T) {
        debug_assert_eq!(self.ty, TypeId::of::<T>(), "carrier payload type changed");
        *self.write() = Box::new(value);
    }
}

impl fmt::Debug for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Carrier")
            .field("type", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Downcast a locked payload to its concrete type.
pub(crate) fn downcast<T: 'static>(payload: &Payload) -> &T {
    payload
        .downcast_ref::<T>()
        .expect("type mismatch in carrier access")
}

/// Wraps a plain value into a shared carrier.
///
/// This is how literals enter the graph: bind the result to an input or a
/// [`Value`](crate::Value).
pub fn wrap<T: Send + Sync + 'static>(value: T) -> SharedCarrier {
    Arc::new(Carrier::new(value))
}

/// Clones the payload out of a carrier.
///
/// # Panics
///
/// Panics if the payload is not a `T`; see [`Carrier::with`].
pub fn unwrap<T: Clone + Send + Sync + 'static>(carrier: &Carrier) -> T {
    carrier.cloned()
}
