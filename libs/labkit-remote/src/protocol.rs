//! Wire messages. Every request and response travels in a [`Frame`] carrying the
//! request id, so a late answer to an abandoned call is never taken for another one.

use labkit::{ModuleBase, ModuleState};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope of one message. A response repeats the id of its request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame<T> {
    pub id: u64,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Frame<T> {
    #[must_use]
    pub const fn new(id: u64, body: T) -> Self {
        Self { id, body }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Resolve a shared module, activating it on the server if needed.
    GetModule { name: String },
    Invoke {
        module: String,
        method: String,
        #[serde(default)]
        args: Value,
    },
    State { module: String },
    ListShared,
    ListActive,
}

impl Request {
    #[must_use]
    pub const fn op(&self) -> &'static str {
        match self {
            Request::GetModule { .. } => "get_module",
            Request::Invoke { .. } => "invoke",
            Request::State { .. } => "state",
            Request::ListShared => "list_shared",
            Request::ListActive => "list_active",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Module {
        name: String,
        base: ModuleBase,
        interfaces: Vec<String>,
    },
    Value {
        value: Value,
    },
    State {
        state: Option<ModuleState>,
    },
    Names {
        names: Vec<String>,
    },
    Error {
        message: String,
    },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_are_tagged_by_op() {
        let raw = serde_json::to_value(Request::GetModule {
            name: "counter".to_owned(),
        })
        .unwrap();
        assert_eq!(raw, json!({"op": "get_module", "name": "counter"}));

        let parsed: Request =
            serde_json::from_value(json!({"op": "invoke", "module": "counter", "method": "read"}))
                .unwrap();
        assert_eq!(
            parsed,
            Request::Invoke {
                module: "counter".to_owned(),
                method: "read".to_owned(),
                args: Value::Null,
            }
        );
    }

    #[test]
    fn frames_put_the_id_next_to_the_body() {
        let raw = serde_json::to_value(Frame::new(7, Request::ListShared)).unwrap();
        assert_eq!(raw, json!({"id": 7, "op": "list_shared"}));

        let parsed: Frame<Response> =
            serde_json::from_value(json!({"id": 9, "status": "names", "names": ["counter"]}))
                .unwrap();
        assert_eq!(parsed.id, 9);
        assert_eq!(
            parsed.body,
            Response::Names {
                names: vec!["counter".to_owned()]
            }
        );
    }

    #[test]
    fn module_response_carries_interfaces() {
        let raw = json!({
            "status": "module",
            "name": "counter",
            "base": "hardware",
            "interfaces": ["counter"]
        });
        let parsed: Response = serde_json::from_value(raw).unwrap();
        assert_eq!(
            parsed,
            Response::Module {
                name: "counter".to_owned(),
                base: ModuleBase::Hardware,
                interfaces: vec!["counter".to_owned()],
            }
        );
    }
}
