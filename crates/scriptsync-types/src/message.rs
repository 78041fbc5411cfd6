//! Wire message types.
//!
//! Every message pushed to a listener, and every file dropped into the relay
//! spool, is a single JSON object of the shape `{"action": .., "data": ..}`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

/// Action sent to every listener right after it connects.
pub const ACTION_HELLO: &str = "hello";

/// Action carrying the full text of a changed script.
pub const ACTION_ONCHANGE: &str = "onchange";

/// A broadcast message.
///
/// The envelope stays open-ended (`data` is arbitrary JSON) so that relayed
/// messages with actions this build does not know about are still forwarded
/// unchanged. An absent `data` is `None`; an explicit `"data": null` is
/// `Some(Value::Null)` and is written back out as such.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub action: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub data: Option<Value>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Message {
    /// Build a message with an arbitrary action and payload.
    pub fn new(action: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            action: action.into(),
            data,
        }
    }

    /// The greeting sent on connect: `{"action":"hello"}`.
    pub fn hello() -> Self {
        Self::new(ACTION_HELLO, None)
    }

    /// A script change notification.
    pub fn on_change(change: &ScriptChange) -> Self {
        Self::new(
            ACTION_ONCHANGE,
            Some(json!({
                "script": change.script,
                "uri": change.uri,
            })),
        )
    }

    /// Whether this is an `onchange` message.
    pub fn is_on_change(&self) -> bool {
        self.action == ACTION_ONCHANGE
    }

    /// Extract the script change payload, if this is a well-formed `onchange`.
    pub fn script_change(&self) -> Option<ScriptChange> {
        if !self.is_on_change() {
            return None;
        }
        self.data
            .as_ref()
            .and_then(|data| serde_json::from_value(data.clone()).ok())
    }
}

/// Payload of an `onchange` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptChange {
    /// Full text of the script at the time the change was observed.
    pub script: String,
    /// URI of the changed resource, e.g. `file:///tmp/x.user.js`.
    pub uri: String,
}

impl ScriptChange {
    pub fn new(script: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            uri: uri.into(),
        }
    }
}
