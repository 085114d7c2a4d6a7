#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod carrier;
mod error;
mod input;
mod multi;
mod node;
mod output;
mod pool;
mod process;
mod stage;
mod value;

pub use crate::carrier::{Carrier, SharedCarrier, unwrap, wrap};
pub use crate::error::{PullError, StageError, WiringError};
#[doc(hidden)]
pub use crate::node::Key;
pub use crate::node::locking::{Io, Strategy};
pub use crate::output::OutputSignal;
pub use crate::pool::{Options, configure};
pub use crate::process::{InputRef, OutputRef, PortKey, Process, Source};
pub use crate::stage::{Stage, StageSpec};
pub use crate::value::Value;
