//! Window-side engine for daemon-backed notebooks.
//!
//! A notebook window does not own its kernel. The `runtimed` daemon runs the
//! kernel and the execution queue, and every window attached to the same
//! notebook room sees the same state through broadcasts and an Automerge
//! replica of the document. This crate keeps one window's view of that state
//! consistent:
//!
//! - [`execution_queue`] issues queue RPCs and mirrors the daemon's queue
//! - [`kernel_session`] tracks kernel status from broadcasts and local intents
//! - [`manifest_resolver`] turns output hashes into Jupyter outputs
//! - [`dispatcher`] applies broadcasts in order
//! - [`reconcile`] merges document snapshots without clobbering local runs
//! - [`trust_gate`] blocks kernel launch until dependencies are approved
//!
//! [`NotebookSession`] wires them to a daemon connection and reconnects when
//! the daemon goes away.

pub mod config;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod execution_queue;
pub mod kernel_session;
pub mod manifest_resolver;
pub mod reconcile;
pub mod session;
pub mod trust_gate;

pub use config::{RetryPolicy, SessionConfig};
pub use dispatcher::{EnvProgress, ListenerSlot, SessionEvent};
pub use error::{ResolveError, SessionError};
pub use execution_queue::{CellQueueStatus, QueueEntry};
pub use kernel_session::{KernelInfo, KernelStatus, LaunchOutcome};
pub use reconcile::{CellOutput, CellState};
pub use session::{NotebookSession, SessionBuilder};
pub use trust_gate::{PendingLaunch, TrustCheck, TrustGate};
