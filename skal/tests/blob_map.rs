//! Blob mapping mutual exclusion across threads

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use skal::blob::IN_PROCESS_ALLOCATOR;

#[test]
fn scoped_map_serializes_concurrent_mappers() {
    let mut proxy_a = skal::create_blob(IN_PROCESS_ALLOCATOR, "", 100).unwrap();
    let mut proxy_b = proxy_a.clone();
    let mut proxy_main = proxy_a.clone();
    assert_eq!(proxy_a.ref_count(), 3);

    let (mapped_tx, mapped_rx) = mpsc::channel();

    let writer = thread::spawn(move || {
        let mut map = proxy_a.scoped_map().unwrap();
        mapped_tx.send(()).unwrap();
        map[..13].copy_from_slice(b"Hello, World!");
        thread::sleep(Duration::from_millis(10));
        // Mapping released here, on scope exit
    });

    let reader = thread::spawn(move || {
        // Only try to map once the writer holds the mapping
        mapped_rx.recv().unwrap();
        let start = Instant::now();
        let mut map = proxy_b.scoped_map().unwrap();
        let blocked_for = start.elapsed();
        assert_eq!(&map[..13], b"Hello, World!");
        map[..12].copy_from_slice(b"How are you?");
        blocked_for
    });

    writer.join().unwrap();
    let blocked_for = reader.join().unwrap();
    assert!(
        blocked_for >= Duration::from_millis(2),
        "second mapper should have blocked, waited only {blocked_for:?}"
    );

    let map = proxy_main.scoped_map().unwrap();
    assert_eq!(&map[..12], b"How are you?");
}

#[test]
fn dropping_proxies_releases_the_blob() {
    let proxy = skal::create_blob(IN_PROCESS_ALLOCATOR, "", 8).unwrap();
    let id = proxy.id().to_string();

    let extra = proxy.clone();
    assert_eq!(proxy.ref_count(), 2);
    drop(extra);
    assert_eq!(proxy.ref_count(), 1);

    drop(proxy);
    assert!(skal::open_blob(IN_PROCESS_ALLOCATOR, &id).is_err());
}
