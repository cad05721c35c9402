//! Network isolation for nexus-chaos.
//!
//! This crate owns the fault control interface: applying and removing
//! directional network faults between a node under test and its peers.
//!
//! # Modules
//!
//! - [`fault_injection`]: the [`FaultControl`] trait, isolation methods and
//!   the script and iptables backends
//! - [`isolation`]: [`NodeIsolator`] and the scoped [`Isolation`] guard
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use nexus_chaos_network::{Isolation, IsolationMethod, NodeIsolator, ReconnectMode, ScriptFaultControl};
//!
//! let isolator = NodeIsolator::new(Arc::new(ScriptFaultControl::new("../lib/io_connect_node.sh", "./")));
//! let mut isolation = Isolation::new(isolator, "node-2", vec!["10.1.0.1".into()], IsolationMethod::Reject);
//!
//! isolation.disconnect().await?;
//! // ... observe the volume ...
//! isolation.reconnect(ReconnectMode::Checked).await?;
//! ```

pub mod fault_injection;
pub mod isolation;

pub use fault_injection::FaultAction;
pub use fault_injection::FaultControl;
pub use fault_injection::FaultError;
pub use fault_injection::IptablesFaultControl;
pub use fault_injection::IsolationMethod;
pub use fault_injection::ScriptFaultControl;
pub use isolation::Isolation;
pub use isolation::IsolationEdge;
pub use isolation::NodeIsolator;
pub use isolation::ReconnectMode;
pub use isolation::ReconnectReport;
