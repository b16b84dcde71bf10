mod support;

use bitset::AllocationMap;
use protocol::io::Client;
use std::os::unix::fs::MetadataExt;

#[tokio::test]
async fn all_zero_write_to_unallocated_region_stays_sparse() {
    let size = 1 << 20;
    let harness = support::spawn_server(size).await;
    *harness.server.allocation_map.write() = Some(AllocationMap::empty(size));

    let mut client = Client::connect(harness.addr).await.unwrap();
    let zeros = vec![0u8; 65536];
    client.write(0, &zeros).await.unwrap();

    assert!(!harness
        .server
        .allocation_map
        .read()
        .as_ref()
        .unwrap()
        .is_allocated_at(0));

    harness.file.as_file().sync_all().unwrap();
    assert_eq!(harness.file.as_file().metadata().unwrap().blocks(), 0);
}

#[tokio::test]
async fn non_zero_write_allocates_exactly_its_pages() {
    let size = 1 << 20;
    let harness = support::spawn_server(size).await;
    *harness.server.allocation_map.write() = Some(AllocationMap::empty(size));

    let mut client = Client::connect(harness.addr).await.unwrap();
    let mut payload = vec![0u8; 4096];
    payload[0] = 1;
    client.write(0, &payload).await.unwrap();

    assert!(harness
        .server
        .allocation_map
        .read()
        .as_ref()
        .unwrap()
        .is_allocated_at(0));
    assert!(!harness
        .server
        .allocation_map
        .read()
        .as_ref()
        .unwrap()
        .is_allocated_at(4096));
}
