//! 📜 The batch stream wire protocol, declared by hand with `prost` derives.
//!
//! 🎬 *[a client opens a stream. says "Start". the server says "Started". a beautiful
//! friendship begins. it will end in "Shutdown", like all friendships do.]*
//!
//! Client -> server: `Start`, then any number of `Data`, then `Stop`.
//! Server -> client: `Started`, `Backoff`, `Acks`, `Results`, `OutOfMemory`,
//! `ShuttingDown`, `Shutdown`.
//!
//! Object properties travel as opaque JSON bytes. What the server does with them is
//! the server's business.

use crate::config;
use crate::records::{PendingObject, PendingReference, Record, Vectors};

/// 🛣️ gRPC method path of the bidirectional batch stream.
pub const BATCH_STREAM_PATH: &str = "/vbx.v1.Ingest/BatchStream";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConsistencyLevel {
    Unspecified = 0,
    One = 1,
    Quorum = 2,
    All = 3,
}

impl From<config::ConsistencyLevel> for ConsistencyLevel {
    fn from(level: config::ConsistencyLevel) -> Self {
        match level {
            config::ConsistencyLevel::One => ConsistencyLevel::One,
            config::ConsistencyLevel::Quorum => ConsistencyLevel::Quorum,
            config::ConsistencyLevel::All => ConsistencyLevel::All,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchStreamRequest {
    #[prost(oneof = "batch_stream_request::Message", tags = "1, 2, 3")]
    pub message: Option<batch_stream_request::Message>,
}

pub mod batch_stream_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        Start(super::Start),
        #[prost(message, tag = "2")]
        Data(super::Data),
        #[prost(message, tag = "3")]
        Stop(super::Stop),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Start {
    #[prost(enumeration = "ConsistencyLevel", optional, tag = "1")]
    pub consistency_level: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    #[prost(message, repeated, tag = "1")]
    pub objects: Vec<BatchObject>,
    #[prost(message, repeated, tag = "2")]
    pub references: Vec<BatchReference>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Stop {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchObject {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, tag = "2")]
    pub collection: String,
    #[prost(string, optional, tag = "3")]
    pub tenant: Option<String>,
    /// 📦 JSON-encoded property map.
    #[prost(bytes = "vec", tag = "4")]
    pub properties: Vec<u8>,
    #[prost(float, repeated, tag = "5")]
    pub vector: Vec<f32>,
    #[prost(message, repeated, tag = "6")]
    pub named_vectors: Vec<NamedVector>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NamedVector {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(float, repeated, tag = "2")]
    pub vector: Vec<f32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchReference {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub from_collection: String,
    #[prost(string, tag = "3")]
    pub from_uuid: String,
    #[prost(string, optional, tag = "4")]
    pub to_collection: Option<String>,
    #[prost(string, tag = "5")]
    pub to_uuid: String,
    #[prost(string, optional, tag = "6")]
    pub tenant: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchStreamReply {
    #[prost(oneof = "batch_stream_reply::Message", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub message: Option<batch_stream_reply::Message>,
}

pub mod batch_stream_reply {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        Started(super::Started),
        #[prost(message, tag = "2")]
        Backoff(super::Backoff),
        #[prost(message, tag = "3")]
        Acks(super::Acks),
        #[prost(message, tag = "4")]
        Results(super::Results),
        #[prost(message, tag = "5")]
        OutOfMemory(super::OutOfMemory),
        #[prost(message, tag = "6")]
        ShuttingDown(super::ShuttingDown),
        #[prost(message, tag = "7")]
        Shutdown(super::Shutdown),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Started {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Backoff {
    #[prost(int32, tag = "1")]
    pub batch_size: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Acks {
    #[prost(string, repeated, tag = "1")]
    pub uuids: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub beacons: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Results {
    #[prost(message, repeated, tag = "1")]
    pub errors: Vec<ResultError>,
    #[prost(message, repeated, tag = "2")]
    pub successes: Vec<ResultSuccess>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResultError {
    #[prost(string, tag = "1")]
    pub error: String,
    #[prost(string, optional, tag = "2")]
    pub uuid: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub beacon: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResultSuccess {
    #[prost(string, optional, tag = "1")]
    pub uuid: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub beacon: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutOfMemory {
    #[prost(string, repeated, tag = "1")]
    pub uuids: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub beacons: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShuttingDown {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Shutdown {}

impl BatchStreamRequest {
    pub fn start(level: config::ConsistencyLevel) -> Self {
        Self {
            message: Some(batch_stream_request::Message::Start(Start {
                consistency_level: Some(ConsistencyLevel::from(level) as i32),
            })),
        }
    }

    pub fn data(data: Data) -> Self {
        Self {
            message: Some(batch_stream_request::Message::Data(data)),
        }
    }

    pub fn stop() -> Self {
        Self {
            message: Some(batch_stream_request::Message::Stop(Stop {})),
        }
    }
}

impl BatchStreamReply {
    pub fn new(message: batch_stream_reply::Message) -> Self {
        Self {
            message: Some(message),
        }
    }
}

impl From<&PendingObject> for BatchObject {
    fn from(object: &PendingObject) -> Self {
        let (vector, named_vectors) = match &object.vectors {
            None => (Vec::new(), Vec::new()),
            Some(Vectors::Single(vector)) => (vector.clone(), Vec::new()),
            Some(Vectors::Named(named)) => (
                Vec::new(),
                named
                    .iter()
                    .map(|(name, vector)| NamedVector {
                        name: name.clone(),
                        vector: vector.clone(),
                    })
                    .collect(),
            ),
        };
        Self {
            uuid: object.uuid.to_string(),
            collection: object.collection.clone(),
            tenant: object.tenant.clone(),
            // -- Display on a JSON value can't fail, unlike serde_json::to_vec's signature suggests
            properties: serde_json::Value::Object(object.properties.clone())
                .to_string()
                .into_bytes(),
            vector,
            named_vectors,
        }
    }
}

impl From<&PendingReference> for BatchReference {
    fn from(reference: &PendingReference) -> Self {
        Self {
            name: reference.from_property.clone(),
            from_collection: reference.from_collection.clone(),
            from_uuid: reference.from_uuid.to_string(),
            to_collection: reference.to_collection.clone(),
            to_uuid: reference.to_uuid.to_string(),
            tenant: reference.tenant.clone(),
        }
    }
}

impl BatchReference {
    /// 🏷️ Same key as [`PendingReference::beacon`], rebuilt from the wire form.
    pub fn beacon(&self) -> String {
        match &self.to_collection {
            Some(to_collection) => format!(
                "{}/{}/{}/{}/{}",
                self.from_collection, self.from_uuid, self.name, to_collection, self.to_uuid
            ),
            None => format!(
                "{}/{}/{}/{}",
                self.from_collection, self.from_uuid, self.name, self.to_uuid
            ),
        }
    }
}

/// 🧩 One framed unit: an object or a reference, already in wire form.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Object(BatchObject),
    Reference(BatchReference),
}

impl From<&Record> for Entry {
    fn from(record: &Record) -> Self {
        match record {
            Record::Object(object) => Entry::Object(object.into()),
            Record::Reference(reference) => Entry::Reference(reference.into()),
        }
    }
}

/// 🎯 What a result or ack points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Uuid(String),
    Beacon(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetError {
    pub target: Target,
    pub message: String,
}

/// 📣 Server messages, decoded into something a `match` can love.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlSignal {
    Started,
    Backoff { batch_size: usize },
    Acks { uuids: Vec<String>, beacons: Vec<String> },
    Results { successes: Vec<Target>, errors: Vec<TargetError> },
    OutOfMemory { uuids: Vec<String>, beacons: Vec<String> },
    ShuttingDown,
    Shutdown,
}

impl ControlSignal {
    /// 🔄 `None` for a reply with no message set. Older servers send keepalives like that.
    pub fn from_reply(reply: BatchStreamReply) -> Option<Self> {
        use batch_stream_reply::Message;
        let signal = match reply.message? {
            Message::Started(_) => ControlSignal::Started,
            Message::Backoff(backoff) => ControlSignal::Backoff {
                batch_size: usize::try_from(backoff.batch_size).unwrap_or(0),
            },
            Message::Acks(acks) => ControlSignal::Acks {
                uuids: acks.uuids,
                beacons: acks.beacons,
            },
            Message::Results(results) => ControlSignal::Results {
                successes: results
                    .successes
                    .into_iter()
                    .filter_map(|success| target_of(success.uuid, success.beacon))
                    .collect(),
                errors: results
                    .errors
                    .into_iter()
                    .filter_map(|error| {
                        target_of(error.uuid, error.beacon).map(|target| TargetError {
                            target,
                            message: error.error,
                        })
                    })
                    .collect(),
            },
            Message::OutOfMemory(oom) => ControlSignal::OutOfMemory {
                uuids: oom.uuids,
                beacons: oom.beacons,
            },
            Message::ShuttingDown(_) => ControlSignal::ShuttingDown,
            Message::Shutdown(_) => ControlSignal::Shutdown,
        };
        Some(signal)
    }
}

fn target_of(uuid: Option<String>, beacon: Option<String>) -> Option<Target> {
    uuid.map(Target::Uuid).or(beacon.map(Target::Beacon))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{NewObject, NewReference, fan_out};
    use prost::Message;
    use uuid::Uuid;

    #[test]
    fn the_one_where_an_object_keeps_its_properties_as_json() {
        let pending = NewObject::new("Article")
            .with_property("title", "hello")
            .with_named_vector("body", vec![0.5, 0.25])
            .with_tenant("acme")
            .into_pending(3);
        let wire = BatchObject::from(&pending);
        assert_eq!(wire.uuid, pending.uuid.to_string());
        assert_eq!(wire.tenant.as_deref(), Some("acme"));
        let properties: serde_json::Value =
            serde_json::from_slice(&wire.properties).expect("properties are JSON");
        assert_eq!(properties["title"], "hello");
        assert_eq!(wire.named_vectors.len(), 1);
        assert!(wire.vector.is_empty());
    }

    #[test]
    fn the_one_where_wire_beacons_match_pending_beacons() {
        let reference = fan_out(
            NewReference::new("Article", Uuid::new_v4(), "author", Uuid::new_v4())
                .with_to_collection("Person"),
            || 0,
        )
        .remove(0);
        assert_eq!(BatchReference::from(&reference).beacon(), reference.beacon());
    }

    #[test]
    fn the_one_where_a_reply_survives_the_trip_through_bytes() {
        let reply = BatchStreamReply::new(batch_stream_reply::Message::Results(Results {
            errors: vec![ResultError {
                error: "rate limit".into(),
                uuid: Some("u-2".into()),
                beacon: None,
            }],
            successes: vec![
                ResultSuccess {
                    uuid: Some("u-1".into()),
                    beacon: None,
                },
                ResultSuccess {
                    uuid: None,
                    beacon: Some("A/1/p/2".into()),
                },
                ResultSuccess {
                    uuid: None,
                    beacon: None,
                },
            ],
        }));
        let decoded = BatchStreamReply::decode(reply.encode_to_vec().as_slice())
            .expect("reply decodes");
        let signal = ControlSignal::from_reply(decoded).expect("message is set");
        assert_eq!(
            signal,
            ControlSignal::Results {
                successes: vec![
                    Target::Uuid("u-1".into()),
                    Target::Beacon("A/1/p/2".into())
                ],
                errors: vec![TargetError {
                    target: Target::Uuid("u-2".into()),
                    message: "rate limit".into()
                }],
            },
            "entries pointing at nothing are dropped"
        );
    }

    #[test]
    fn the_one_where_a_negative_backoff_means_stop() {
        let reply = BatchStreamReply::new(batch_stream_reply::Message::Backoff(Backoff {
            batch_size: -1,
        }));
        assert_eq!(
            ControlSignal::from_reply(reply),
            Some(ControlSignal::Backoff { batch_size: 0 })
        );
        assert_eq!(ControlSignal::from_reply(BatchStreamReply::default()), None);
    }

    #[test]
    fn the_one_where_start_carries_the_consistency_level() {
        let start = BatchStreamRequest::start(config::ConsistencyLevel::All);
        match start.message {
            Some(batch_stream_request::Message::Start(start)) => {
                assert_eq!(start.consistency_level, Some(ConsistencyLevel::All as i32));
            }
            other => panic!("expected Start, got {other:?}"),
        }
    }
}
