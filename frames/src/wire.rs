//! Protobuf layout of a [`Frame`]. The JSON payload travels as a
//! `google.protobuf.Value` so nested objects survive without a schema.

use prost::Message;
use prost_types::value::Kind;
use prost_types::{ListValue, NullValue, Struct};
use serde_json::{Map, Number, Value};

use crate::{CodecError, Frame, Status};

#[derive(Clone, PartialEq, Message)]
pub(crate) struct WireFrame {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, optional, tag = "2")]
    parent_id: Option<String>,
    #[prost(int64, tag = "3")]
    ts: i64,
    #[prost(string, optional, tag = "4")]
    from: Option<String>,
    #[prost(string, tag = "5")]
    event: String,
    #[prost(enumeration = "WireStatus", tag = "6")]
    status: i32,
    #[prost(message, optional, tag = "7")]
    data: Option<prost_types::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub(crate) enum WireStatus {
    Request = 0,
    Done = 1,
    Error = 2,
    Cancel = 3,
    Item = 4,
}

impl From<Status> for WireStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Request => Self::Request,
            Status::Item => Self::Item,
            Status::Done => Self::Done,
            Status::Error => Self::Error,
            Status::Cancel => Self::Cancel,
        }
    }
}

impl From<WireStatus> for Status {
    fn from(status: WireStatus) -> Self {
        match status {
            WireStatus::Request => Self::Request,
            WireStatus::Item => Self::Item,
            WireStatus::Done => Self::Done,
            WireStatus::Error => Self::Error,
            WireStatus::Cancel => Self::Cancel,
        }
    }
}

pub(crate) fn encode(frame: &Frame) -> Vec<u8> {
    WireFrame {
        id: frame.id.clone(),
        parent_id: frame.parent_id.clone(),
        ts: frame.ts,
        from: frame.from.clone(),
        event: frame.event.clone(),
        status: frame.status.as_i32(),
        data: Some(to_proto(&frame.data)),
    }
    .encode_to_vec()
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    let wire = WireFrame::decode(bytes)?;
    Ok(Frame {
        status: Status::from_i32(wire.status)?,
        id: wire.id,
        parent_id: wire.parent_id,
        ts: wire.ts,
        from: wire.from,
        event: wire.event,
        // A frame without payload decodes to an empty object.
        data: wire.data.as_ref().map_or_else(|| Value::Object(Map::new()), from_proto),
    })
}

fn to_proto(value: &Value) -> prost_types::Value {
    let kind = match value {
        Value::Null => Kind::NullValue(NullValue::NullValue.into()),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        Value::String(s) => Kind::StringValue(s.clone()),
        Value::Array(items) => Kind::ListValue(ListValue { values: items.iter().map(to_proto).collect() }),
        Value::Object(map) => Kind::StructValue(Struct {
            fields: map.iter().map(|(key, item)| (key.clone(), to_proto(item))).collect(),
        }),
    };
    prost_types::Value { kind: Some(kind) }
}

fn from_proto(value: &prost_types::Value) -> Value {
    match &value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(*b),
        Some(Kind::NumberValue(n)) => number(*n),
        Some(Kind::StringValue(s)) => Value::String(s.clone()),
        Some(Kind::ListValue(list)) => Value::Array(list.values.iter().map(from_proto).collect()),
        Some(Kind::StructValue(object)) => {
            Value::Object(object.fields.iter().map(|(key, item)| (key.clone(), from_proto(item))).collect())
        }
    }
}

/// protobuf numbers are doubles; give integral values back as JSON integers
/// so ids and counts compare equal after a round trip.
#[allow(clippy::cast_possible_truncation)]
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        return Value::Number(Number::from(n as i64));
    }
    Number::from_f64(n).map_or(Value::Null, Value::Number)
}
