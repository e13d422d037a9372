//! Performance benchmarks for the frame codec and registry

use server::registry::ConnectionRegistry;
use shared::{decode, encode, transform, PacketType, PAYLOAD_CAPACITY};
use std::net::SocketAddr;
use std::time::Instant;

/// Benchmarks encoding full-capacity frames
#[test]
fn benchmark_frame_encoding() {
    let payload = vec![0x5a; PAYLOAD_CAPACITY];
    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let _ = encode(PacketType::Ping, &payload).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Frame encoding: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 5 seconds even in debug builds
    assert!(duration.as_secs() < 5);
}

/// Benchmarks decoding full-capacity frames
#[test]
fn benchmark_frame_decoding() {
    let frame = encode(PacketType::Pong, &vec![0x5a; PAYLOAD_CAPACITY]).unwrap();
    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let packet = decode(&frame).unwrap();
        assert_eq!(packet.payload.len(), PAYLOAD_CAPACITY);
    }

    let duration = start.elapsed();
    println!(
        "Frame decoding: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}

/// Benchmarks the payload transform on its own
#[test]
fn benchmark_payload_transform() {
    let mut payload = vec![0x11; PAYLOAD_CAPACITY];
    let iterations = 1_000_000;
    let start = Instant::now();

    for _ in 0..iterations {
        transform(&mut payload);
    }

    let duration = start.elapsed();
    println!(
        "Payload transform: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // An even number of applications restores the input
    assert!(payload.iter().all(|b| *b == 0x11));
    assert!(duration.as_secs() < 5);
}

/// Benchmarks register/snapshot/unregister churn on a large table
#[test]
fn benchmark_registry_churn() {
    let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
    let mut registry = ConnectionRegistry::new(10_000);
    let start = Instant::now();

    for handle in 0..10_000 {
        registry.register(handle, addr, ()).unwrap();
    }
    let snapshot = registry.snapshot();
    for handle in snapshot {
        registry.unregister(handle);
    }

    let duration = start.elapsed();
    println!("Registry churn: 10000 connections in {:?}", duration);

    assert!(registry.is_empty());
    assert!(duration.as_secs() < 2);
}
