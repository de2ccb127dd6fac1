//! VReplication control plane.
//!
//! The orchestrator never drives the CDC engine directly. It inserts,
//! updates and deletes rows in the `_vt.vreplication` table on a primary
//! through SQL-shaped statements sent over the tablet-management RPC, and
//! the engine on the tablet reacts to the row changes.

pub mod position;
pub mod query;
pub mod source;
pub mod state;

pub use position::Position;
pub use query::{create_stream, delete_stream, select_streams, update_stream_state};
pub use source::BinlogSource;
pub use state::StreamState;
