//! Process discovery and tracer lifecycle
//!
//! [`ProcessFinder`] polls a proc root for processes matching the
//! [`SelectionCriteria`] and hands each new match to the
//! [`LifecycleManager`], which runs one tracer per process.

pub mod criteria;
pub mod finder;
pub mod manager;
pub mod scanner;

pub use criteria::{PortRanges, SelectionCriteria};
pub use finder::{DiscoveredProcess, ProcessFinder};
pub use manager::{LifecycleManager, ManagerConfig, ManagerStats, TracerFactory, WorkerExit};
pub use scanner::{ProcScanner, ProcessInfo};
