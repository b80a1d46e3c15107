//! Metadata helpers for routed calls.
//!
//! Keys starting with [`ROUTING_HOP_PREFIX`] only travel between the caller
//! and the kas instances. They are stripped before a call reaches an agent.

use std::collections::HashMap;

use tonic::metadata::{
    Ascii, AsciiMetadataValue, Binary, BinaryMetadataValue, KeyAndValueRef, MetadataKey,
    MetadataMap, MetadataValue,
};
use tonic::{Code, Status};
use tracing::warn;

use kas_proto::{MetadataValues, RpcStatus};

pub const ROUTING_HOP_PREFIX: &str = "kas-hop-";
pub const ROUTING_AGENT_ID_METADATA_KEY: &str = "kas-hop-routing-agent-id";

/// Headers that describe the current HTTP/2 exchange rather than the call
/// and must not be copied onto the next hop.
const CONNECTION_SPECIFIC_KEYS: &[&str] = &[
    "grpc-timeout",
    "grpc-encoding",
    "grpc-accept-encoding",
    "content-type",
    "te",
    "user-agent",
];

/// Extract the target agent id from incoming metadata.
#[allow(clippy::result_large_err)]
pub fn agent_id_from_meta(metadata: &MetadataMap) -> Result<i64, Status> {
    let values: Vec<_> = metadata.get_all(ROUTING_AGENT_ID_METADATA_KEY).iter().collect();
    if values.len() != 1 {
        return Err(Status::invalid_argument(format!(
            "Expecting a single {ROUTING_AGENT_ID_METADATA_KEY}, got {}",
            values.len()
        )));
    }
    values[0]
        .to_str()
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| Status::invalid_argument(format!("Invalid {ROUTING_AGENT_ID_METADATA_KEY}")))
}

/// Metadata a caller attaches to reach `agent_id`.
pub fn routing_metadata(agent_id: i64) -> MetadataMap {
    let mut md = MetadataMap::new();
    md.insert(ROUTING_AGENT_ID_METADATA_KEY, MetadataValue::from(agent_id));
    md
}

/// Copy of `metadata` without any `kas-hop-` keys.
pub fn remove_hop_meta(metadata: &MetadataMap) -> MetadataMap {
    filter_metadata(metadata, |key| !key.starts_with(ROUTING_HOP_PREFIX))
}

/// Copy of incoming call metadata suitable for an outgoing call to the next
/// hop. Routing keys are kept; transport headers are dropped.
pub fn outgoing_metadata(metadata: &MetadataMap) -> MetadataMap {
    filter_metadata(metadata, |key| !CONNECTION_SPECIFIC_KEYS.contains(&key))
}

fn filter_metadata(metadata: &MetadataMap, keep: impl Fn(&str) -> bool) -> MetadataMap {
    let mut out = MetadataMap::with_capacity(metadata.len());
    for entry in metadata.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) if keep(key.as_str()) => {
                out.append(key.clone(), value.clone());
            }
            KeyAndValueRef::Binary(key, value) if keep(key.as_str()) => {
                out.append_bin(key.clone(), value.clone());
            }
            _ => {}
        }
    }
    out
}

/// Append every entry of `src` to `dst`.
pub fn merge_metadata(dst: &mut MetadataMap, src: &MetadataMap) {
    for entry in src.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => {
                dst.append(key.clone(), value.clone());
            }
            KeyAndValueRef::Binary(key, value) => {
                dst.append_bin(key.clone(), value.clone());
            }
        }
    }
}

/// Convert metadata into its wire form. Binary values are stored decoded.
pub fn meta_to_values_map(metadata: &MetadataMap) -> HashMap<String, MetadataValues> {
    let mut map: HashMap<String, MetadataValues> = HashMap::new();
    for entry in metadata.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => {
                map.entry(key.as_str().to_owned())
                    .or_default()
                    .value
                    .push(value.as_bytes().to_vec());
            }
            KeyAndValueRef::Binary(key, value) => match value.to_bytes() {
                Ok(bytes) => map
                    .entry(key.as_str().to_owned())
                    .or_default()
                    .value
                    .push(bytes.to_vec()),
                Err(e) => {
                    warn!(key = key.as_str(), error = %e, "Dropping undecodable binary metadata");
                }
            },
        }
    }
    map
}

/// Inverse of [`meta_to_values_map`]. Entries that are not valid gRPC
/// metadata are dropped with a warning.
pub fn values_map_to_meta(map: &HashMap<String, MetadataValues>) -> MetadataMap {
    let mut md = MetadataMap::new();
    for (key, values) in map {
        if key.ends_with("-bin") {
            let Ok(key) = MetadataKey::<Binary>::from_bytes(key.as_bytes()) else {
                warn!(key = %key, "Dropping invalid binary metadata key");
                continue;
            };
            for v in &values.value {
                md.append_bin(key.clone(), BinaryMetadataValue::from_bytes(v));
            }
        } else {
            let Ok(key) = MetadataKey::<Ascii>::from_bytes(key.as_bytes()) else {
                warn!(key = %key, "Dropping invalid metadata key");
                continue;
            };
            for v in &values.value {
                match AsciiMetadataValue::try_from(v.as_slice()) {
                    Ok(value) => {
                        md.append(key.clone(), value);
                    }
                    Err(_) => warn!(key = key.as_str(), "Dropping invalid metadata value"),
                }
            }
        }
    }
    md
}

/// Wire form of a status: code, message and details bytes verbatim.
pub fn status_to_proto(status: &Status) -> RpcStatus {
    RpcStatus {
        code: status.code() as i32,
        message: status.message().to_owned(),
        details: status.details().to_vec(),
    }
}

pub fn status_from_proto(status: RpcStatus) -> Status {
    Status::with_details(
        Code::from(status.code),
        status.message,
        status.details.into(),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_round_trips_through_routing_metadata() {
        assert_eq!(agent_id_from_meta(&routing_metadata(123)).unwrap(), 123);
        assert_eq!(agent_id_from_meta(&routing_metadata(-5)).unwrap(), -5);
    }

    #[test]
    fn missing_agent_id_is_invalid_argument() {
        let err = agent_id_from_meta(&MetadataMap::new()).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(
            err.message(),
            "Expecting a single kas-hop-routing-agent-id, got 0"
        );
    }

    #[test]
    fn repeated_agent_id_is_invalid_argument() {
        let mut md = routing_metadata(1);
        md.append(ROUTING_AGENT_ID_METADATA_KEY, "2".parse().unwrap());
        let err = agent_id_from_meta(&md).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(err.message().ends_with("got 2"));
    }

    #[test]
    fn non_numeric_agent_id_is_invalid_argument() {
        let mut md = MetadataMap::new();
        md.insert(ROUTING_AGENT_ID_METADATA_KEY, "abc".parse().unwrap());
        let err = agent_id_from_meta(&md).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), "Invalid kas-hop-routing-agent-id");
    }

    #[test]
    fn remove_hop_meta_keeps_other_keys() {
        let mut md = routing_metadata(1);
        md.insert("kas-hop-other", "x".parse().unwrap());
        md.insert("key1", "v1".parse().unwrap());
        md.insert_bin("trace-bin", BinaryMetadataValue::from_bytes(b"\x00\x01"));

        let out = remove_hop_meta(&md);
        assert!(out.get(ROUTING_AGENT_ID_METADATA_KEY).is_none());
        assert!(out.get("kas-hop-other").is_none());
        assert_eq!(out.get("key1").unwrap(), "v1");
        assert_eq!(
            out.get_bin("trace-bin").unwrap().to_bytes().unwrap().as_ref(),
            b"\x00\x01"
        );
    }

    #[test]
    fn outgoing_metadata_keeps_routing_keys_drops_transport() {
        let mut md = routing_metadata(7);
        md.insert("grpc-timeout", "5S".parse().unwrap());
        md.insert("content-type", "application/grpc".parse().unwrap());
        md.insert("key1", "v1".parse().unwrap());

        let out = outgoing_metadata(&md);
        assert_eq!(agent_id_from_meta(&out).unwrap(), 7);
        assert!(out.get("grpc-timeout").is_none());
        assert!(out.get("content-type").is_none());
        assert_eq!(out.get("key1").unwrap(), "v1");
    }

    #[test]
    fn values_map_preserves_repeated_and_binary_values() {
        let mut md = MetadataMap::new();
        md.append("key", "a".parse().unwrap());
        md.append("key", "b".parse().unwrap());
        md.insert_bin("blob-bin", BinaryMetadataValue::from_bytes(&[0xde, 0xad]));

        let map = meta_to_values_map(&md);
        assert_eq!(map["key"].value, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(map["blob-bin"].value, vec![vec![0xde, 0xad]]);

        let back = values_map_to_meta(&map);
        let values: Vec<_> = back
            .get_all("key")
            .iter()
            .map(|v| v.to_str().unwrap().to_owned())
            .collect();
        assert_eq!(values, ["a", "b"]);
        assert_eq!(
            back.get_bin("blob-bin").unwrap().to_bytes().unwrap().as_ref(),
            &[0xde, 0xad]
        );
    }

    #[test]
    fn invalid_wire_metadata_is_dropped() {
        let mut map = HashMap::new();
        map.insert(
            "Bad Key".to_owned(),
            MetadataValues { value: vec![b"v".to_vec()] },
        );
        map.insert(
            "good".to_owned(),
            MetadataValues { value: vec![b"line\nbreak".to_vec(), b"ok".to_vec()] },
        );
        let md = values_map_to_meta(&map);
        assert_eq!(md.len(), 1);
        assert_eq!(md.get("good").unwrap(), "ok");
    }

    #[test]
    fn status_survives_wire_form() {
        let status = Status::with_details(
            Code::InvalidArgument,
            "Some expected error",
            vec![1, 2, 3].into(),
        );
        let back = status_from_proto(status_to_proto(&status));
        assert_eq!(back.code(), Code::InvalidArgument);
        assert_eq!(back.message(), "Some expected error");
        assert_eq!(back.details(), &[1, 2, 3]);
    }
}
