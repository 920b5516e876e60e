use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, YeelightError};

/// Line terminator of the control protocol.
pub const LINE_TERMINATOR: u8 = b'\n';

/// An outbound request. The id is assigned by the correlator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

impl Command {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Command {
            id,
            method: method.into(),
            params,
        }
    }

    /// Encodes the command as one protocol line, terminator included.
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(LINE_TERMINATOR);
        Ok(line)
    }
}

/// Answer to a [`Command`], matched by id.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Result { id: u64, values: Vec<Value> },
    Error { id: u64, code: i64, message: String },
}

impl Response {
    pub fn id(&self) -> u64 {
        match self {
            Response::Result { id, .. } | Response::Error { id, .. } => *id,
        }
    }
}

/// Unsolicited push from the device, e.g. `{"method":"props","params":{"power":"on"}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// A decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(Response),
    Notification(Notification),
}

impl Inbound {
    /// Decodes one line (without terminator).
    ///
    /// A `method` key wins over `id`, so a line carrying both is a notification.
    pub fn decode(line: &str) -> Result<Inbound> {
        let value: Value = serde_json::from_str(line)?;
        let Value::Object(object) = value else {
            return Err(YeelightError::Parse(format!("not a JSON object: {line}")));
        };

        if let Some(method) = object.get("method") {
            let method = method
                .as_str()
                .ok_or_else(|| YeelightError::Parse("method is not a string".to_string()))?;
            let params = object
                .get("params")
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new()));
            return Ok(Inbound::Notification(Notification {
                method: method.to_string(),
                params,
            }));
        }

        if let Some(id) = object.get("id") {
            let id = id
                .as_u64()
                .ok_or_else(|| YeelightError::Parse(format!("invalid id: {id}")))?;
            return Ok(Inbound::Response(Self::decode_response(id, &object)));
        }

        Err(YeelightError::Parse(format!(
            "neither a response nor a notification: {line}"
        )))
    }

    fn decode_response(id: u64, object: &Map<String, Value>) -> Response {
        if let Some(error) = object.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Response::Error { id, code, message };
        }

        let values = match object.get("result") {
            Some(Value::Array(values)) => values.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other.clone()],
        };
        Response::Result { id, values }
    }
}
