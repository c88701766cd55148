//! Talking to individual store members.
//!
//! - [`record`]: node-table and INFO parsing
//! - [`transport`]: direct protocol calls
//! - [`command`]: typed administrative commands
//! - [`directory`]: member resolution tying the above together

pub mod command;
pub mod directory;
pub mod record;
pub mod transport;

pub use command::{check_passed, AdminCommand, AdminPayload};
pub use directory::{Member, NodeDirectory};
pub use record::{NodeAddress, NodeRecord, NodeRole, SlotOwnership, SlotToken, SLOT_COUNT};
pub use transport::{ExecTransport, NodeTarget, NodeTransport, Reply, RespTransport, RoutingTransport};
