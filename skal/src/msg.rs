//! Message envelope
//!
//! Messages are the only way workers communicate. A message is built by its
//! producer, handed to [`send`](crate::send) (which consumes it) and owned
//! by exactly one queue or one handler invocation at a time from then on.
//!
//! Payload travels in named, typed fields: integers, doubles, strings,
//! miniblobs (small inline byte arrays) and blob proxies (references to
//! shared buffers, see [`blob`](crate::blob)). Adding a field under an
//! existing name overwrites it.

use std::collections::HashMap;

use bitflags::bitflags;
use chrono::{DateTime, Utc};

use crate::alarm::Alarm;
use crate::blob::BlobProxy;
use crate::domain::{self, Name};
use crate::error::{Result, SkalError};

/// Default time-to-live counter for new messages
///
/// Decremented at each router hop; the router drops messages whose ttl
/// reaches zero.
pub const DEFAULT_TTL: i8 = 4;

bitflags! {
    /// Public message flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u32 {
        /// Jump the regular lane in queues; best-effort only
        const URGENT = 0x01;
        /// The router may reorder this message
        const OUT_OF_ORDER_OK = 0x02;
        /// The router or a full queue may silently drop this message
        const DROP_OK = 0x04;
        /// Tell the sender if this message is dropped
        const NTF_DROP = 0x08;
        /// Informational: the recipient is a multicast group
        const MULTICAST = 0x10;
    }
}

bitflags! {
    /// Framework-private message flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IFlags: u32 {
        /// Framework-internal message: bypasses throttling and takes
        /// highest queue priority
        const INTERNAL = 0x10000;
    }
}

/// A message exchanged between workers
///
/// Cloning a message clones every field and increments the reference count
/// of every attached blob. A message cannot be cloned while the caller
/// holds a mapping of one of its blobs; the mapping guard borrows the
/// proxy, which borrows the message.
#[derive(Debug, Clone)]
pub struct Message {
    timestamp: DateTime<Utc>,
    sender: Name,
    recipient: Name,
    action: String,
    flags: MsgFlags,
    iflags: IFlags,
    ttl: i8,
    alarms: Vec<Alarm>,
    ints: HashMap<String, i64>,
    doubles: HashMap<String, f64>,
    strings: HashMap<String, String>,
    miniblobs: HashMap<String, Vec<u8>>,
    blobs: HashMap<String, BlobProxy>,
}

impl Message {
    /// Create a message
    ///
    /// The sender is set automatically: the calling worker's full name, or
    /// a stable per-thread identifier outside any worker. `action` must
    /// not be empty; actions starting with `skal-` are reserved for the
    /// framework.
    pub fn new(recipient: impl Into<Name>, action: impl Into<String>) -> Self {
        Self::build(
            domain::me(),
            recipient.into(),
            action.into(),
            MsgFlags::empty(),
            IFlags::empty(),
        )
    }

    /// Create a framework-internal message
    pub(crate) fn internal(sender: Name, recipient: Name, action: impl Into<String>) -> Self {
        Self::build(
            sender,
            recipient,
            action.into(),
            MsgFlags::empty(),
            IFlags::INTERNAL,
        )
    }

    fn build(
        sender: Name,
        recipient: Name,
        action: String,
        flags: MsgFlags,
        iflags: IFlags,
    ) -> Self {
        debug_assert!(!action.is_empty());
        Self {
            timestamp: Utc::now(),
            sender,
            recipient,
            action,
            flags,
            iflags,
            ttl: DEFAULT_TTL,
            alarms: Vec::new(),
            ints: HashMap::new(),
            doubles: HashMap::new(),
            strings: HashMap::new(),
            miniblobs: HashMap::new(),
            blobs: HashMap::new(),
        }
    }

    /// Reassemble a message from its decoded parts, with every envelope
    /// field given. Used by the wire codec; fields are then added with the
    /// regular `add_*` methods.
    pub fn assemble(
        timestamp: DateTime<Utc>,
        sender: Name,
        recipient: Name,
        action: impl Into<String>,
        flags: MsgFlags,
        iflags: IFlags,
        ttl: i8,
    ) -> Self {
        let mut msg = Self::build(sender, recipient, action.into(), flags, iflags);
        msg.timestamp = timestamp;
        msg.ttl = ttl;
        msg
    }

    /// Override the automatic sender
    pub fn with_sender(mut self, sender: impl Into<Name>) -> Self {
        self.sender = sender.into();
        self
    }

    /// Set message flags
    pub fn with_flags(mut self, flags: MsgFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the time-to-live counter
    pub fn with_ttl(mut self, ttl: i8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Wall-clock creation time (UTC, nanosecond resolution)
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Full name of the message producer
    pub fn sender(&self) -> &Name {
        &self.sender
    }

    /// Full name of the recipient worker or group
    pub fn recipient(&self) -> &Name {
        &self.recipient
    }

    pub(crate) fn set_recipient(&mut self, recipient: Name) {
        self.recipient = recipient;
    }

    /// The message verb, used for dispatch and group filtering
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Message flags
    pub fn flags(&self) -> MsgFlags {
        self.flags
    }

    /// Set message flags
    pub fn set_flags(&mut self, flags: MsgFlags) {
        self.flags = flags;
    }

    /// Framework-private flags
    pub fn iflags(&self) -> IFlags {
        self.iflags
    }

    /// Whether this is a framework-internal message
    pub fn is_internal(&self) -> bool {
        self.iflags.contains(IFlags::INTERNAL)
    }

    /// Time-to-live counter
    pub fn ttl(&self) -> i8 {
        self.ttl
    }

    /// Decrement the ttl and return the new value
    pub fn decrement_ttl(&mut self) -> i8 {
        self.ttl -= 1;
        self.ttl
    }

    /// Attach an alarm
    ///
    /// Alarms are not fields; they stack in attach order.
    pub fn attach_alarm(&mut self, alarm: Alarm) {
        self.alarms.push(alarm);
    }

    /// Detach the most recently attached alarm, if any
    pub fn detach_alarm(&mut self) -> Option<Alarm> {
        self.alarms.pop()
    }

    /// Currently attached alarms, in attach order
    pub fn alarms(&self) -> &[Alarm] {
        &self.alarms
    }

    /// Add an integer field, overwriting any previous value
    pub fn add_int(&mut self, name: impl Into<String>, value: i64) {
        self.ints.insert(name.into(), value);
    }

    /// Get an integer field
    pub fn get_int(&self, name: &str) -> Result<i64> {
        self.ints
            .get(name)
            .copied()
            .ok_or_else(|| SkalError::no_such_field("int", name))
    }

    /// Whether an integer field with that name exists
    pub fn has_int(&self, name: &str) -> bool {
        self.ints.contains_key(name)
    }

    /// Add a floating-point field, overwriting any previous value
    pub fn add_double(&mut self, name: impl Into<String>, value: f64) {
        self.doubles.insert(name.into(), value);
    }

    /// Get a floating-point field
    pub fn get_double(&self, name: &str) -> Result<f64> {
        self.doubles
            .get(name)
            .copied()
            .ok_or_else(|| SkalError::no_such_field("double", name))
    }

    /// Whether a floating-point field with that name exists
    pub fn has_double(&self, name: &str) -> bool {
        self.doubles.contains_key(name)
    }

    /// Add a string field, overwriting any previous value
    pub fn add_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.strings.insert(name.into(), value.into());
    }

    /// Get a string field
    pub fn get_string(&self, name: &str) -> Result<&str> {
        self.strings
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| SkalError::no_such_field("string", name))
    }

    /// Whether a string field with that name exists
    pub fn has_string(&self, name: &str) -> bool {
        self.strings.contains_key(name)
    }

    /// Add a miniblob field, overwriting any previous value
    pub fn add_miniblob(&mut self, name: impl Into<String>, value: Vec<u8>) {
        self.miniblobs.insert(name.into(), value);
    }

    /// Get a miniblob field
    pub fn get_miniblob(&self, name: &str) -> Result<&[u8]> {
        self.miniblobs
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| SkalError::no_such_field("miniblob", name))
    }

    /// Whether a miniblob field with that name exists
    pub fn has_miniblob(&self, name: &str) -> bool {
        self.miniblobs.contains_key(name)
    }

    /// Add a blob field, overwriting any previous value
    ///
    /// The message takes over the proxy's reference.
    pub fn add_blob(&mut self, name: impl Into<String>, proxy: BlobProxy) {
        self.blobs.insert(name.into(), proxy);
    }

    /// Get a copy of a blob field's proxy
    ///
    /// The returned proxy holds its own reference; the field stays
    /// attached to the message.
    pub fn get_blob(&self, name: &str) -> Result<BlobProxy> {
        self.blobs
            .get(name)
            .cloned()
            .ok_or_else(|| SkalError::no_such_field("blob", name))
    }

    /// Whether a blob field with that name exists
    pub fn has_blob(&self, name: &str) -> bool {
        self.blobs.contains_key(name)
    }

    /// Detach a blob field, transferring its proxy to the caller
    ///
    /// A second call with the same name fails with a field-lookup error,
    /// because the proxy has left the message.
    pub fn detach_blob(&mut self, name: &str) -> Result<BlobProxy> {
        self.blobs
            .remove(name)
            .ok_or_else(|| SkalError::no_such_field("blob", name))
    }

    /// All integer fields
    pub fn int_fields(&self) -> &HashMap<String, i64> {
        &self.ints
    }

    /// All floating-point fields
    pub fn double_fields(&self) -> &HashMap<String, f64> {
        &self.doubles
    }

    /// All string fields
    pub fn string_fields(&self) -> &HashMap<String, String> {
        &self.strings
    }

    /// All miniblob fields
    pub fn miniblob_fields(&self) -> &HashMap<String, Vec<u8>> {
        &self.miniblobs
    }

    /// All blob fields
    pub fn blob_fields(&self) -> &HashMap<String, BlobProxy> {
        &self.blobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::Severity;

    #[test]
    fn test_sender_set_automatically() {
        let msg = Message::new("boss", "work!");
        assert_eq!(msg.sender(), &domain::me());
        assert_eq!(msg.recipient(), &Name::resolve("boss"));
        assert_eq!(msg.action(), "work!");
        assert_eq!(msg.ttl(), DEFAULT_TTL);
        assert!(!msg.is_internal());
    }

    #[test]
    fn test_explicit_sender_and_flags() {
        let msg = Message::new("boss", "work!")
            .with_sender("mug@factory")
            .with_flags(MsgFlags::URGENT | MsgFlags::DROP_OK)
            .with_ttl(9);
        assert_eq!(msg.sender(), &Name::resolve("mug@factory"));
        assert!(msg.flags().contains(MsgFlags::URGENT));
        assert!(msg.flags().contains(MsgFlags::DROP_OK));
        assert_eq!(msg.ttl(), 9);
    }

    #[test]
    fn test_field_add_get_overwrite() {
        let mut msg = Message::new("boss", "work!");
        msg.add_int("count", 7);
        msg.add_int("count", 8);
        assert_eq!(msg.get_int("count").unwrap(), 8);

        msg.add_double("ratio", 0.5);
        assert_eq!(msg.get_double("ratio").unwrap(), 0.5);

        msg.add_string("tag", "red");
        assert_eq!(msg.get_string("tag").unwrap(), "red");

        msg.add_miniblob("bytes", vec![0xde, 0xad]);
        assert_eq!(msg.get_miniblob("bytes").unwrap(), &[0xde, 0xad]);

        assert!(msg.has_int("count"));
        assert!(!msg.has_int("missing"));
    }

    #[test]
    fn test_missing_field_errors() {
        let msg = Message::new("boss", "work!");
        assert!(matches!(
            msg.get_int("nope"),
            Err(SkalError::NoSuchField { kind: "int", .. })
        ));
        assert!(matches!(
            msg.get_string("nope"),
            Err(SkalError::NoSuchField { kind: "string", .. })
        ));
    }

    #[test]
    fn test_alarm_detach_is_lifo() {
        let mut msg = Message::new("boss", "work!");
        msg.attach_alarm(Alarm::new("first", Severity::Notice, true, false, ""));
        msg.attach_alarm(Alarm::new("second", Severity::Notice, true, false, ""));
        assert_eq!(msg.detach_alarm().unwrap().name(), "second");
        assert_eq!(msg.detach_alarm().unwrap().name(), "first");
        assert!(msg.detach_alarm().is_none());
    }

    #[test]
    fn test_detach_blob_twice_fails() {
        let mut msg = Message::new("boss", "work!");
        let proxy = crate::blob::create_blob("in-process", "", 16).unwrap();
        msg.add_blob("payload", proxy);

        let detached = msg.detach_blob("payload").unwrap();
        assert_eq!(detached.size(), 16);
        assert!(matches!(
            msg.detach_blob("payload"),
            Err(SkalError::NoSuchField { kind: "blob", .. })
        ));
    }

    #[test]
    fn test_clone_bumps_blob_refs() {
        let mut msg = Message::new("boss", "work!");
        let proxy = crate::blob::create_blob("in-process", "", 16).unwrap();
        msg.add_blob("payload", proxy);
        assert_eq!(msg.get_blob("payload").unwrap().ref_count(), 2);

        let copy = msg.clone();
        let original = msg.detach_blob("payload").unwrap();
        let copied = copy.blob_fields().get("payload").unwrap();
        assert_eq!(original.id(), copied.id());
        assert_eq!(original.ref_count(), 2);
    }

    #[test]
    fn test_ttl_decrement() {
        let mut msg = Message::new("boss", "work!").with_ttl(1);
        assert_eq!(msg.decrement_ttl(), 0);
        assert_eq!(msg.decrement_ttl(), -1);
    }
}
