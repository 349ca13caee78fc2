mod broadcast;
mod identity;
pub mod protocol;
mod registry;
mod server;
mod state;
mod store;

pub use broadcast::{broadcast_roster, broadcast_to, BroadcastOutcome};
pub use identity::{Identity, Role};
pub use protocol::{ClientMessage, Inbound, LineFramer, ServerMessage};
pub use registry::{ChannelHandle, ConnectionEntry, ConnectionId, ConnectionRegistry, Registration};
pub use server::AttendanceServer;
pub use state::PresenceState;
pub use store::{AttendanceLog, PersistentStore, Snapshot};
