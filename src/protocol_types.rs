//! Control-plane message types for the Foxglove WebSocket protocol.
//! Spec for the protocol can be found here: <https://github.com/foxglove/ws-protocol/blob/main/docs/spec.md>
//!
//! Every JSON message carries an `op` discriminator, modeled here as serde
//! tagged enums so an unrecognized `op` surfaces as a decode error instead of
//! a silently ignored map.

use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;

pub type ChannelId = u32;
pub type SubscriptionId = u32;
pub type ServiceId = u32;
pub type ClientChannelId = u32;

/// Capability strings advertised in `serverInfo`. Clients are expected to only
/// use features whose capability is present.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    ClientPublish,
    Services,
    Parameters,
    ParametersSubscribe,
    Time,
}

/// Severity of a `status` message. Encoded as a bare integer on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusLevel {
    Info = 0,
    Warning = 1,
    Error = 2,
}

impl Serialize for StatusLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// A server-published channel as it appears in `advertise` messages.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: ChannelId,
    pub topic: String,
    pub encoding: String,
    pub schema_name: String,
    pub schema: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_encoding: Option<String>,
}

/// Request or response message definition of a service.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMessageDefinition {
    pub encoding: String,
    pub schema_name: String,
    pub schema_encoding: String,
    pub schema: String,
}

/// A request/response endpoint as it appears in `advertiseServices`.
///
/// At least one of `request`/`request_schema` and one of
/// `response`/`response_schema` must be present; `add_service` enforces this.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<ServiceMessageDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ServiceMessageDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<String>,
}

/// Value of a parameter: a scalar or a homogeneous list of scalars.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<ParameterValue>),
}

/// A named parameter in the embedder's store. The broker never interprets
/// `value` or `type`; both pass through to the listener untouched. A missing
/// `value` serializes as `null`, matching the reference server.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub value: Option<ParameterValue>,
    #[serde(rename = "type", default)]
    pub parameter_type: Option<String>,
}

/// A channel advertised by a client for reverse-direction publishing. The id
/// is client-chosen and only meaningful within the advertising connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientChannel {
    pub id: ClientChannelId,
    pub topic: String,
    pub encoding: String,
    pub schema_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_encoding: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSubscription {
    pub id: SubscriptionId,
    pub channel_id: ChannelId,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub(crate) enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe { subscriptions: Vec<ClientSubscription> },
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        subscription_ids: Vec<SubscriptionId>,
    },
    #[serde(rename_all = "camelCase")]
    Advertise { channels: Vec<ClientChannel> },
    #[serde(rename_all = "camelCase")]
    Unadvertise { channel_ids: Vec<ClientChannelId> },
    #[serde(rename_all = "camelCase")]
    GetParameters {
        parameter_names: Vec<String>,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SetParameters {
        parameters: Vec<Parameter>,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SubscribeParameterUpdates { parameter_names: Vec<String> },
    #[serde(rename_all = "camelCase")]
    UnsubscribeParameterUpdates { parameter_names: Vec<String> },
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub(crate) enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    ServerInfo {
        name: String,
        capabilities: Vec<Capability>,
        #[serde(skip_serializing_if = "Option::is_none")]
        supported_encodings: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<HashMap<String, String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        level: StatusLevel,
        message: String,
        id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RemoveStatus { status_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Advertise { channels: Vec<Channel> },
    #[serde(rename_all = "camelCase")]
    Unadvertise { channel_ids: Vec<ChannelId> },
    #[serde(rename_all = "camelCase")]
    AdvertiseServices { services: Vec<Service> },
    #[serde(rename_all = "camelCase")]
    UnadvertiseServices { service_ids: Vec<ServiceId> },
    #[serde(rename_all = "camelCase")]
    ParameterValues {
        parameters: Vec<Parameter>,
        id: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_subscribe() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"op":"subscribe","subscriptions":[{"id":42,"channelId":7}]}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Subscribe { subscriptions } => {
                assert_eq!(subscriptions.len(), 1);
                assert_eq!(subscriptions[0].id, 42);
                assert_eq!(subscriptions[0].channel_id, 7);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn decodes_set_parameters_without_id() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"op":"setParameters","parameters":[{"name":"x","value":7}]}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::SetParameters { parameters, id } => {
                assert_eq!(id, None);
                assert_eq!(parameters[0].name, "x");
                assert_eq!(parameters[0].value, Some(ParameterValue::Integer(7)));
                assert_eq!(parameters[0].parameter_type, None);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_op() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"op":"frobnicate"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_non_object_top_level() {
        assert!(serde_json::from_str::<ClientMessage>("[1,2,3]").is_err());
        assert!(serde_json::from_str::<ClientMessage>("\"subscribe\"").is_err());
    }

    #[test]
    fn status_serializes_null_id() {
        let msg = ServerMessage::Status {
            level: StatusLevel::Warning,
            message: "nope".to_owned(),
            id: None,
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"op":"status","level":1,"message":"nope","id":null}"#
        );
    }

    #[test]
    fn parameter_values_keep_null_fields() {
        let msg = ServerMessage::ParameterValues {
            parameters: vec![Parameter {
                name: "x".to_owned(),
                value: Some(ParameterValue::Integer(7)),
                parameter_type: None,
            }],
            id: None,
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"op":"parameterValues","parameters":[{"name":"x","value":7,"type":null}],"id":null}"#
        );
    }

    #[test]
    fn server_info_skips_absent_optionals() {
        let msg = ServerMessage::ServerInfo {
            name: "test".to_owned(),
            capabilities: vec![Capability::ClientPublish, Capability::Services],
            supported_encodings: None,
            metadata: None,
            session_id: None,
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"op":"serverInfo","name":"test","capabilities":["clientPublish","services"]}"#
        );
    }

    #[test]
    fn parameter_value_shapes() {
        let v: ParameterValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, ParameterValue::Bool(true));
        let v: ParameterValue = serde_json::from_str("1.5").unwrap();
        assert_eq!(v, ParameterValue::Float(1.5));
        let v: ParameterValue = serde_json::from_str(r#"[1,2,3]"#).unwrap();
        assert_eq!(
            v,
            ParameterValue::Array(vec![
                ParameterValue::Integer(1),
                ParameterValue::Integer(2),
                ParameterValue::Integer(3),
            ])
        );
    }
}
