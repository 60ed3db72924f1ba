//! Integration tests for the shared-memory request path: what the
//! controller writes, the supervisor and child must read back.

use prewarm_core::child::read_request;
use prewarm_core::errors::PrewarmError;
use prewarm_core::protocol::ForkRequest;
use prewarm_core::shm::{SharedMemory, SharedReader, SIZE_PREFIX_BYTES};
use std::collections::HashMap;
use std::io::Read;

fn write_region(request: &ForkRequest, stdin_data: &[u8]) -> SharedMemory {
    let payload = serde_json::to_vec(request).unwrap();
    let mut region =
        SharedMemory::create(SIZE_PREFIX_BYTES + payload.len() + stdin_data.len()).unwrap();
    region.write_data_with_size(&payload).unwrap();
    if !stdin_data.is_empty() {
        region.write(stdin_data).unwrap();
    }
    region
}

#[test]
fn test_supervisor_reads_controller_region() {
    let mut env = HashMap::new();
    env.insert("X".to_string(), "1".to_string());
    let request = ForkRequest {
        tty_name: "/dev/pts/9".to_string(),
        cwd: "/tmp".to_string(),
        argv: vec!["cmd".to_string(), "--flag".to_string()],
        env,
        stdin_size: 0,
    };
    let region = write_region(&request, b"");

    let prepared = read_request(region.name()).unwrap();
    assert_eq!(prepared.request, request);
    assert_eq!(prepared.shm_name, region.name());
}

#[test]
fn test_stdin_bytes_follow_the_fingerprint() {
    let request = ForkRequest {
        argv: vec!["echo".to_string()],
        stdin_size: 5,
        ..Default::default()
    };
    let mut region = write_region(&request, b"hello");
    region.set_unlink_on_drop(false);
    let name = region.name().to_string();

    let prepared = read_request(&name).unwrap();
    assert_eq!(prepared.request.stdin_size, 5);

    // The child's view: adopt the region, read the stdin slice to EOF
    drop(region);
    let adopted = SharedMemory::adopt(&name).unwrap();
    let mut reader = SharedReader::new(adopted, prepared.stdin_offset, 5).unwrap();
    let mut data = Vec::new();
    reader.read_to_end(&mut data).unwrap();
    assert_eq!(data, b"hello");

    // Adoption retired the name
    assert!(SharedMemory::open(&name).is_err());
}

#[test]
fn test_missing_region_is_reported() {
    let err = read_request("/kitty-prewarm-never-created").unwrap_err();
    assert!(matches!(err, PrewarmError::ShmMissing { .. }));
}

#[test]
fn test_lying_stdin_size_is_reported() {
    // Fingerprint claims stdin bytes the region does not hold
    let request = ForkRequest {
        argv: vec!["echo".to_string()],
        stdin_size: 4096,
        ..Default::default()
    };
    let payload = serde_json::to_vec(&request).unwrap();
    let mut region = SharedMemory::create(SIZE_PREFIX_BYTES + payload.len()).unwrap();
    region.write_data_with_size(&payload).unwrap();

    let err = read_request(region.name()).unwrap_err();
    assert!(matches!(err, PrewarmError::ShmTruncated { .. }));
}

#[test]
fn test_garbage_fingerprint_is_reported() {
    let mut region = SharedMemory::create(SIZE_PREFIX_BYTES + 9).unwrap();
    region.write_data_with_size(b"not json!").unwrap();
    let err = read_request(region.name()).unwrap_err();
    assert!(matches!(err, PrewarmError::DecodeFailed(_)));
}

#[test]
fn test_region_names_are_unique() {
    let a = SharedMemory::create(8).unwrap();
    let b = SharedMemory::create(8).unwrap();
    assert_ne!(a.name(), b.name());
    assert!(a.name().starts_with('/'));
}
