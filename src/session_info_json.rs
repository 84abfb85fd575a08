//! Purpose: Session-info JSON serializer for `altermesh session` commands.
//! Exports: `session_info_json`.
//! Role: Keep the session metadata envelope shape in one place.
//! Invariants: Stable key names; tokens are always reported in host order.

use altermesh::api::SessionInfo;
use serde_json::{Map, Value, json};

pub(crate) fn session_info_json(info: &SessionInfo) -> Value {
    let mut map = Map::new();
    map.insert("path".to_string(), json!(info.path.display().to_string()));
    map.insert(
        "tokens".to_string(),
        json!([info.tokens.first(), info.tokens.second()]),
    );
    map.insert("side".to_string(), json!(info.side.as_str()));
    map.insert("owner".to_string(), json!(info.owner));
    map.insert("file_size".to_string(), json!(info.file_size));
    map.insert("capacity".to_string(), json!(info.capacity));
    map.insert("state".to_string(), json!(info.state.to_string()));
    map.insert("message_len".to_string(), json!(info.message_len));
    map.insert("seq".to_string(), json!(info.seq));
    Value::Object(map)
}
