mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use nbd_core::ActionAtFinish;
use protocol::io::Client;
use rand::RngCore;

async fn wait_for_mirror_to_finish(server: &nbd_core::ServerInner) {
    for _ in 0..200 {
        if !server.is_mirroring.load(Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("mirror did not converge in time");
}

#[tokio::test]
async fn mirror_replicates_pre_existing_content_to_a_byte_identical_destination() {
    let size = 1 << 24; // 16 MiB, comfortably above one page but small enough to run fast.

    let source = support::spawn_server(size).await;
    let dest = support::spawn_server(size).await;

    let mut rng = rand::rng();
    let mut content = vec![0u8; size as usize];
    rng.fill_bytes(&mut content);

    {
        let mut client = Client::connect(source.addr).await.unwrap();
        // split into chunks under the 32-bit length field's practical range.
        for chunk_start in (0..content.len()).step_by(1 << 20) {
            let chunk_end = (chunk_start + (1 << 20)).min(content.len());
            client
                .write(chunk_start as u64, &content[chunk_start..chunk_end])
                .await
                .unwrap();
        }
    }

    let upstream = Client::connect(dest.addr).await.unwrap();
    source
        .server
        .start_mirror(upstream, ActionAtFinish::Nothing)
        .await
        .unwrap();

    wait_for_mirror_to_finish(&source.server).await;

    let dest_bytes = std::fs::read(dest.file.path()).unwrap();
    assert_eq!(dest_bytes, content);
}

#[tokio::test]
async fn a_second_mirror_cannot_start_while_one_is_active() {
    let size = 1 << 20;
    let source = support::spawn_server(size).await;
    let dest_a = support::spawn_server(size).await;
    let dest_b = support::spawn_server(size).await;

    let upstream_a = Client::connect(dest_a.addr).await.unwrap();
    source
        .server
        .start_mirror(upstream_a, ActionAtFinish::Nothing)
        .await
        .unwrap();

    let upstream_b = Client::connect(dest_b.addr).await.unwrap();
    let err = source
        .server
        .start_mirror(upstream_b, ActionAtFinish::Nothing)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already running"));

    wait_for_mirror_to_finish(&source.server).await;
}
