//! Wire encoding for skal messages
//!
//! Frames are self-describing and versioned: one protocol version byte
//! followed by a JSON envelope carrying every message field. Both peers
//! of a deployment must speak the same version; [`decode`] rejects
//! frames with an unknown version byte and frames missing any required
//! envelope field.
//!
//! Blob fields do not travel by value: a frame carries the
//! `(allocator, id)` pair and the receiving side reopens the blob
//! through its own allocator registry. This is lossless whenever sender
//! and receiver actually share the allocator's scope (same process for
//! `in-process`, same machine for `shared-memory`).

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use skal::alarm::Alarm;
use skal::msg::{IFlags, Message, MsgFlags};
use skal::{Name, Result, SkalError};

/// Protocol version emitted by [`encode`] and required by [`decode`]
pub const WIRE_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct WireMessage {
    timestamp: i64,
    sender: String,
    recipient: String,
    action: String,
    #[serde(default)]
    flags: u32,
    #[serde(default)]
    iflags: u32,
    ttl: i8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    alarms: Vec<WireAlarm>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    ints: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    doubles: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    strings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    miniblobs: BTreeMap<String, Vec<u8>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    blobs: BTreeMap<String, WireBlobRef>,
}

#[derive(Serialize, Deserialize)]
struct WireAlarm {
    name: String,
    severity: String,
    is_on: bool,
    auto_off: bool,
    note: String,
    origin: String,
    timestamp: i64,
}

#[derive(Serialize, Deserialize)]
struct WireBlobRef {
    allocator: String,
    id: String,
}

fn timestamp_nanos(ts: DateTime<Utc>) -> i64 {
    // Nanosecond timestamps cover 1678..2262, plenty for wall clocks
    ts.timestamp_nanos_opt().unwrap_or_default()
}

fn nanos_to_timestamp(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

/// Serialize a message into a wire frame
pub fn encode(msg: &Message) -> Bytes {
    let wire = WireMessage {
        timestamp: timestamp_nanos(msg.timestamp()),
        sender: msg.sender().to_string(),
        recipient: msg.recipient().to_string(),
        action: msg.action().to_string(),
        flags: msg.flags().bits(),
        iflags: msg.iflags().bits(),
        ttl: msg.ttl(),
        alarms: msg
            .alarms()
            .iter()
            .map(|alarm| WireAlarm {
                name: alarm.name().to_string(),
                severity: alarm.severity().to_string(),
                is_on: alarm.is_on(),
                auto_off: alarm.auto_off(),
                note: alarm.note().to_string(),
                origin: alarm.origin().to_string(),
                timestamp: timestamp_nanos(alarm.timestamp()),
            })
            .collect(),
        ints: msg
            .int_fields()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect(),
        doubles: msg
            .double_fields()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect(),
        strings: msg
            .string_fields()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        miniblobs: msg
            .miniblob_fields()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        blobs: msg
            .blob_fields()
            .iter()
            .map(|(k, proxy)| {
                (
                    k.clone(),
                    WireBlobRef {
                        allocator: proxy.allocator_name().to_string(),
                        id: proxy.id().to_string(),
                    },
                )
            })
            .collect(),
    };

    let mut frame = Vec::with_capacity(256);
    frame.push(WIRE_VERSION);
    serde_json::to_writer(&mut frame, &wire).expect("message envelope serializes");
    Bytes::from(frame)
}

/// Deserialize a wire frame back into a message
///
/// Fails with a version-mismatch error on an unknown version byte and a
/// format error on anything the envelope parser rejects, including a
/// missing `timestamp`, `sender`, `recipient`, `action` or `ttl`.
/// Attached blobs are reopened through the named allocator; an
/// unregistered allocator on an otherwise well-formed frame means the
/// process-wide allocator registry is broken, which is fatal.
pub fn decode(frame: &[u8]) -> Result<Message> {
    let (&version, body) = frame
        .split_first()
        .ok_or_else(|| SkalError::format("empty frame"))?;
    if version != WIRE_VERSION {
        return Err(SkalError::VersionMismatch {
            found: version,
            supported: WIRE_VERSION,
        });
    }

    let wire: WireMessage =
        serde_json::from_slice(body).map_err(|err| SkalError::format(err.to_string()))?;
    if wire.action.is_empty() {
        return Err(SkalError::format("empty action"));
    }

    let mut msg = Message::assemble(
        nanos_to_timestamp(wire.timestamp),
        Name::resolve(&wire.sender),
        Name::resolve(&wire.recipient),
        wire.action,
        MsgFlags::from_bits_truncate(wire.flags),
        IFlags::from_bits_truncate(wire.iflags),
        wire.ttl,
    );

    for alarm in wire.alarms {
        let severity = alarm.severity.parse()?;
        msg.attach_alarm(Alarm::from_parts(
            alarm.name,
            severity,
            alarm.is_on,
            alarm.auto_off,
            alarm.note,
            Name::resolve(&alarm.origin),
            nanos_to_timestamp(alarm.timestamp),
        ));
    }
    for (name, value) in wire.ints {
        msg.add_int(name, value);
    }
    for (name, value) in wire.doubles {
        msg.add_double(name, value);
    }
    for (name, value) in wire.strings {
        msg.add_string(name, value);
    }
    for (name, value) in wire.miniblobs {
        msg.add_miniblob(name, value);
    }
    for (name, blob) in wire.blobs {
        let allocator = match skal::blob::find_allocator(&blob.allocator) {
            Ok(allocator) => allocator,
            Err(err) => {
                // A well-formed frame names an allocator this process does
                // not have: the process-wide registry no longer matches the
                // deployment, and no later frame can be trusted either.
                error!(
                    allocator = blob.allocator,
                    blob = blob.id,
                    "allocator missing while decoding a well-formed frame: {err}"
                );
                std::process::abort();
            }
        };
        msg.add_blob(name, allocator.open(&blob.id)?);
    }
    Ok(msg)
}
