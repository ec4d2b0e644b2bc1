//! Lossless round trip of every message field through the wire format

use skal::blob::IN_PROCESS_ALLOCATOR;
use skal::{Alarm, Message, MsgFlags, Severity};
use skal_codec::{decode, encode};

#[test]
fn every_field_survives_encode_decode() {
    let mut msg = Message::new("peer@far", "snapshot")
        .with_flags(MsgFlags::URGENT)
        .with_ttl(3);
    msg.attach_alarm(Alarm::new(
        "overheat",
        Severity::Warning,
        true,
        false,
        "too hot in here",
    ));
    msg.add_int("count", 42);
    msg.add_double("ratio", 0.25);
    msg.add_string("tag", "blue");
    msg.add_miniblob("magic", vec![0xde, 0xad, 0xbe, 0xef]);

    let mut blob = skal::create_blob(IN_PROCESS_ALLOCATOR, "", 100).unwrap();
    blob.scoped_map().unwrap()[..11].copy_from_slice(b"I am a blob");
    let blob_id = blob.id().to_string();
    msg.add_blob("payload", blob);

    let decoded = decode(&encode(&msg)).unwrap();

    assert_eq!(decoded.timestamp(), msg.timestamp());
    assert_eq!(decoded.sender(), msg.sender());
    assert_eq!(decoded.recipient(), msg.recipient());
    assert_eq!(decoded.action(), msg.action());
    assert_eq!(decoded.flags(), msg.flags());
    assert_eq!(decoded.iflags(), msg.iflags());
    assert_eq!(decoded.ttl(), msg.ttl());

    assert_eq!(decoded.alarms(), msg.alarms());

    assert_eq!(decoded.get_int("count").unwrap(), 42);
    assert_eq!(decoded.get_double("ratio").unwrap(), 0.25);
    assert_eq!(decoded.get_string("tag").unwrap(), "blue");
    assert_eq!(
        decoded.get_miniblob("magic").unwrap(),
        &[0xde, 0xad, 0xbe, 0xef]
    );

    // The blob travelled by identity and reopened through its allocator
    let mut reopened = decoded.get_blob("payload").unwrap();
    assert_eq!(reopened.id(), blob_id);
    assert_eq!(reopened.size(), 100);
    assert_eq!(&reopened.scoped_map().unwrap()[..11], b"I am a blob");
}

#[test]
fn multiple_decodes_share_the_blob() {
    let mut msg = Message::new("peer@far", "share");
    let blob = skal::create_blob(IN_PROCESS_ALLOCATOR, "", 16).unwrap();
    msg.add_blob("payload", blob);

    let frame = encode(&msg);
    let first = decode(&frame).unwrap();
    let second = decode(&frame).unwrap();

    let original = msg.get_blob("payload").unwrap();
    // message + the temporary + two decodes
    assert_eq!(original.ref_count(), 4);
    assert_eq!(first.get_blob("payload").unwrap().id(), original.id());
    drop(second);
    assert_eq!(original.ref_count(), 3);
}
