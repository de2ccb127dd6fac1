//! Builders for the statements executed against `_vt.vreplication`.

use super::{BinlogSource, Position, StreamState};

/// Insert a new stream row. The engine assigns the stream id, returned
/// as the statement's insert id.
pub fn create_stream(
    workflow: &str,
    source: &BinlogSource,
    position: &Position,
    state: StreamState,
    db_name: &str,
) -> String {
    // BinlogSource serializes to JSON; quotes inside are doubled for SQL.
    let source = serde_json::to_string(source).unwrap_or_default();
    format!(
        "insert into _vt.vreplication (workflow, source, pos, state, db_name) values ('{}', '{}', '{}', '{}', '{}')",
        escape(workflow),
        escape(&source),
        escape(&position.0),
        state,
        escape(db_name),
    )
}

/// Transition a stream to a new state.
pub fn update_stream_state(uid: u32, state: StreamState) -> String {
    format!(
        "update _vt.vreplication set state = '{}' where id = {}",
        state, uid
    )
}

/// Remove a stream row; the engine tears the stream down.
pub fn delete_stream(uid: u32) -> String {
    format!("delete from _vt.vreplication where id = {}", uid)
}

/// All stream rows on the tablet.
pub fn select_streams() -> &'static str {
    "select id, workflow, source, pos, state, db_name from _vt.vreplication"
}

/// Database name backing a keyspace on its tablets.
pub fn db_name(keyspace: &str) -> String {
    format!("vt_{}", keyspace)
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}
