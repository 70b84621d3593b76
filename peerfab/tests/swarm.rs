//! End-to-end tests over a real loopback swarm: one tracker, real peer
//! services, real chunk transfers.

use std::{fs, path::Path, sync::Arc, time::Duration};

use pretty_assertions::assert_eq;

use peerfab::{
    chunk_name,
    conf::{PeerConf, TrackerConf},
    download::Downloader,
    error::Error,
    peer::Peer,
    pool::ConnectionPool,
    tracker::{client::TrackerClient, Tracker},
    Shutdown, CHUNK_SIZE,
};

struct TestPeer {
    tracker: TrackerClient,
    downloader: Downloader,
}

async fn start_tracker(shutdown: &Shutdown) -> String {
    let conf = TrackerConf {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        heartbeat_timeout: Duration::from_secs(30),
    };
    let tracker = Tracker::bind(conf, shutdown.clone())
        .await
        .expect("bind tracker");
    let addr = tracker.local_addr().expect("tracker addr").to_string();
    tokio::spawn(tracker.run());
    addr
}

/// Starts a peer serving out of `dir`, announces whatever it already
/// shares, and returns handles for driving it.
async fn start_peer(
    name: &str,
    tracker_addr: &str,
    dir: &Path,
    shutdown: &Shutdown,
) -> TestPeer {
    let mut conf = PeerConf::new(name, dir);
    conf.tracker_addr = tracker_addr.to_string();
    conf.listen_addr = Some("127.0.0.1:0".parse().unwrap());

    let peer = Peer::start(conf.clone(), shutdown.clone())
        .await
        .expect("start peer");
    peer.announce_shared().await.expect("announce");
    let tracker = peer.tracker();
    tokio::spawn(peer.run());

    let pool = Arc::new(ConnectionPool::new(conf.transfer_timeout));
    let downloader = Downloader::new(name, dir, tracker.clone(), pool);
    TestPeer {
        tracker,
        downloader,
    }
}

/// A repeating 0x00..0xff pattern, `len` bytes long.
fn write_pattern_file(dir: &Path, file: &str, len: usize) -> Vec<u8> {
    let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
    fs::write(dir.join(file), &payload).expect("write file");
    payload
}

const TWO_AND_A_HALF_CHUNKS: usize = 5 * CHUNK_SIZE as usize / 2;

#[tokio::test]
async fn test_two_peer_round_trip() {
    let shutdown = Shutdown::new();
    let tracker_addr = start_tracker(&shutdown).await;

    let a_dir = tempfile::tempdir().expect("tempdir");
    let payload =
        write_pattern_file(a_dir.path(), "data.txt", TWO_AND_A_HALF_CHUNKS);
    start_peer("alice", &tracker_addr, a_dir.path(), &shutdown).await;

    let b_dir = tempfile::tempdir().expect("tempdir");
    let bob = start_peer("bob", &tracker_addr, b_dir.path(), &shutdown).await;

    bob.downloader
        .download("data.txt", 1)
        .await
        .expect("download");

    // bob reconstructed the file byte for byte
    assert_eq!(
        fs::read(b_dir.path().join("data.txt")).expect("read"),
        payload
    );
    // and holds every chunk file
    for index in 0..3 {
        assert!(b_dir.path().join(chunk_name("data.txt", index)).exists());
    }

    // both sides now seed all three chunks
    let adverts = bob.tracker.file_chunks("data.txt").await.expect("chunks");
    for peer in &["alice", "bob"] {
        for index in 0..3 {
            assert!(
                adverts
                    .iter()
                    .any(|ad| ad.peer == *peer && ad.chunk.index == index),
                "{} must seed chunk {}",
                peer,
                index
            );
        }
    }

    shutdown.trigger();
}

#[tokio::test]
async fn test_partial_pre_seed() {
    let shutdown = Shutdown::new();
    let tracker_addr = start_tracker(&shutdown).await;

    let a_dir = tempfile::tempdir().expect("tempdir");
    let payload =
        write_pattern_file(a_dir.path(), "data.txt", TWO_AND_A_HALF_CHUNKS);
    start_peer("alice", &tracker_addr, a_dir.path(), &shutdown).await;

    let b_dir = tempfile::tempdir().expect("tempdir");
    let bob = start_peer("bob", &tracker_addr, b_dir.path(), &shutdown).await;

    // bob already holds chunk 1 from an earlier, aborted attempt
    let chunk1 = &payload[CHUNK_SIZE as usize..2 * CHUNK_SIZE as usize];
    fs::write(b_dir.path().join(chunk_name("data.txt", 1)), chunk1)
        .expect("pre-seed");

    bob.downloader
        .download("data.txt", 1)
        .await
        .expect("download");

    assert_eq!(
        fs::read(b_dir.path().join("data.txt")).expect("read"),
        payload
    );
    // the pre-seeded chunk is advertised along with the fetched ones
    let adverts = bob.tracker.file_chunks("data.txt").await.expect("chunks");
    for index in 0..3 {
        assert!(adverts
            .iter()
            .any(|ad| ad.peer == "bob" && ad.chunk.index == index));
    }

    shutdown.trigger();
}

#[tokio::test]
async fn test_corrupt_sender_fails_before_assembly() {
    let shutdown = Shutdown::new();
    let tracker_addr = start_tracker(&shutdown).await;

    let a_dir = tempfile::tempdir().expect("tempdir");
    write_pattern_file(a_dir.path(), "data.txt", TWO_AND_A_HALF_CHUNKS);
    start_peer("alice", &tracker_addr, a_dir.path(), &shutdown).await;

    // corrupt alice's copy of chunk 1 after she advertised its checksum
    fs::write(
        a_dir.path().join(chunk_name("data.txt", 1)),
        b"not the advertised bytes",
    )
    .expect("corrupt");

    let b_dir = tempfile::tempdir().expect("tempdir");
    let bob = start_peer("bob", &tracker_addr, b_dir.path(), &shutdown).await;

    let outcome = bob.downloader.download("data.txt", 1).await;
    match outcome {
        Err(Error::Download { failures }) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].chunk_name, chunk_name("data.txt", 1));
            assert_eq!(failures[0].reason, "checksum mismatch");
        }
        other => panic!("expected download failure, got {:?}", other),
    }

    // the bad chunk never reached bob's disk and nothing was assembled
    assert!(!b_dir.path().join(chunk_name("data.txt", 1)).exists());
    assert!(!b_dir.path().join("data.txt").exists());

    shutdown.trigger();
}

#[tokio::test]
async fn test_contribution_gate_bounds_parallelism() {
    let shutdown = Shutdown::new();
    let tracker_addr = start_tracker(&shutdown).await;

    let a_dir = tempfile::tempdir().expect("tempdir");
    let payload =
        write_pattern_file(a_dir.path(), "data.txt", TWO_AND_A_HALF_CHUNKS);
    start_peer("alice", &tracker_addr, a_dir.path(), &shutdown).await;

    let b_dir = tempfile::tempdir().expect("tempdir");
    // bob contributes three chunks of some other file
    for index in 0..3 {
        fs::write(
            b_dir.path().join(chunk_name("junk.txt", index)),
            b"chunk payload",
        )
        .expect("write");
    }
    let bob = start_peer("bob", &tracker_addr, b_dir.path(), &shutdown).await;

    // three local chunks cap parallelism at two
    match bob.downloader.download("data.txt", 4).await {
        Err(Error::ParallelismBound { requested, cap }) => {
            assert_eq!(requested, 4);
            assert_eq!(cap, 2);
        }
        other => panic!("expected parallelism rejection, got {:?}", other),
    }

    // asking within the cap proceeds normally
    bob.downloader
        .download("data.txt", 2)
        .await
        .expect("download");
    assert_eq!(
        fs::read(b_dir.path().join("data.txt")).expect("read"),
        payload
    );

    shutdown.trigger();
}

#[tokio::test]
async fn test_download_without_checksum_is_refused() {
    let shutdown = Shutdown::new();
    let tracker_addr = start_tracker(&shutdown).await;

    let b_dir = tempfile::tempdir().expect("tempdir");
    let bob = start_peer("bob", &tracker_addr, b_dir.path(), &shutdown).await;

    assert!(matches!(
        bob.downloader.download("nobody-shares-this.txt", 1).await,
        Err(Error::ChecksumNotFound(_))
    ));

    shutdown.trigger();
}
