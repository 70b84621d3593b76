//! The parallel chunk download engine.
//!
//! A download runs in two phases. Planning asks the tracker for the
//! file's advertisements and terminal checksum, drops every chunk we
//! advertise ourselves or already hold on disk, picks one advertiser per
//! missing chunk uniformly at random and shuffles the result. Execution
//! fans the plan out over a semaphore-bounded set of workers: each worker
//! claims its chunk (at most one fetch per chunk across all workers),
//! fetches the bytes, verifies them against the advertised checksum
//! before anything touches disk, writes the chunk under its write lock
//! and immediately re-registers it with the tracker, so the peer seeds
//! every verified chunk while the rest of the file is still in flight.
//!
//! Per-chunk failures go to a failure queue instead of aborting the run;
//! only once the queue is proven empty is the file reassembled, verified
//! against the terminal checksum and re-advertised whole.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Instant,
};

use rand::{seq::SliceRandom, Rng};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use crate::{
    chunker,
    error::{ChunkFailure, Error, Result},
    hasher,
    peer::client::PeerClient,
    pool::ConnectionPool,
    tracker::client::TrackerClient,
    wire::ChunkAdvert,
    ChunkInfo,
};

/// The tit-for-tat contribution gate: the number of chunk files a peer
/// holds caps how many parallel fetches it may ask for.
pub fn max_parallel(local_chunks: usize) -> usize {
    match local_chunks {
        0..=2 => 1,
        3..=5 => 2,
        6..=7 => 3,
        _ => 4,
    }
}

/// One planned fetch: a chunk and the advertiser selected to serve it.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ChunkTask {
    /// The peer chosen at plan time; fixed for the whole attempt.
    peer: String,
    chunk: ChunkInfo,
}

/// The engine that fetches a file's missing chunks from other peers.
///
/// One instance per peer process is enough; each [`download`](Self::download)
/// call is an independent run with its own state, while the tracker
/// connection and the peer connection pool are shared across runs.
pub struct Downloader {
    peer_name: String,
    share_dir: PathBuf,
    tracker: TrackerClient,
    pool: Arc<ConnectionPool>,
}

impl Downloader {
    pub fn new(
        peer_name: impl Into<String>,
        share_dir: impl Into<PathBuf>,
        tracker: TrackerClient,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            peer_name: peer_name.into(),
            share_dir: share_dir.into(),
            tracker,
            pool,
        }
    }

    /// Downloads a file with at most `n_parallel` concurrent fetches.
    ///
    /// On success the share directory holds the verified file and all its
    /// chunk files, and the tracker lists this peer as a seeder for every
    /// chunk. On failure partial chunks may remain on disk (each one
    /// individually verified), but nothing unverified is ever written or
    /// advertised.
    pub async fn download(&self, file: &str, n_parallel: usize) -> Result<()> {
        // the contribution gate comes first: parallelism has to be earned
        let local_chunks = chunker::local_chunk_count(&self.share_dir)?;
        let cap = max_parallel(local_chunks);
        if n_parallel < 1 || n_parallel > cap {
            return Err(Error::ParallelismBound {
                requested: n_parallel,
                cap,
            });
        }

        // without a terminal checksum the download could never be
        // verified, so that lookup failing aborts the whole attempt
        let final_checksum = self.tracker.file_checksum(file).await?;
        let adverts = self.tracker.file_chunks(file).await?;
        let tasks = plan(
            adverts,
            &self.share_dir,
            &self.peer_name,
            &mut rand::thread_rng(),
        );
        log::info!(
            "Downloading '{}': {} chunk(s) to fetch, {} parallel",
            file,
            tasks.len(),
            n_parallel
        );

        // one write lock per planned chunk, created up front
        let write_locks: HashMap<String, AsyncMutex<()>> = tasks
            .iter()
            .map(|task| (task.chunk.name.clone(), AsyncMutex::new(())))
            .collect();
        let state = Arc::new(DownloadState {
            in_progress: Mutex::new(HashSet::new()),
            downloaded: Mutex::new(HashSet::new()),
            failures: Mutex::new(Vec::new()),
            write_locks,
            workers: Semaphore::new(n_parallel),
        });

        let mut joins = Vec::with_capacity(tasks.len());
        for task in tasks {
            let ctx = WorkerCtx {
                state: Arc::clone(&state),
                tracker: self.tracker.clone(),
                pool: Arc::clone(&self.pool),
                peer_name: self.peer_name.clone(),
                share_dir: self.share_dir.clone(),
                file: file.to_string(),
                final_checksum: final_checksum.clone(),
            };
            joins.push(tokio::spawn(fetch_chunk(ctx, task)));
        }
        for join in joins {
            if let Err(e) = join.await {
                log::error!("Download worker panicked: {}", e);
            }
        }

        let failures = {
            let mut failures = state.failures.lock().unwrap();
            std::mem::take(&mut *failures)
        };
        if !failures.is_empty() {
            for failure in &failures {
                log::warn!("Chunk failed: {}", failure);
            }
            return Err(Error::Download { failures });
        }

        self.finish(file, &final_checksum).await
    }

    /// Reassembles and verifies the completed download, then re-splits
    /// and re-advertises the whole file.
    async fn finish(&self, file: &str, final_checksum: &str) -> Result<()> {
        let dir = self.share_dir.clone();
        let file_name = file.to_string();
        let expected = final_checksum.to_string();

        // assembly hashes and copies the whole file; keep it off the
        // reactor
        let chunks = tokio::task::spawn_blocking(
            move || -> Result<Vec<ChunkInfo>> {
                let assembled = chunker::assemble(&dir, &file_name)?;
                let actual = hasher::digest_file(&assembled)?;
                if actual != expected {
                    std::fs::remove_file(&assembled)?;
                    return Err(Error::AssemblyMismatch {
                        file: file_name,
                        expected,
                        actual,
                    });
                }

                let target = dir.join(&file_name);
                if target.exists() {
                    // the original was here all along and every fetched
                    // chunk verified against it; the copy is redundant
                    std::fs::remove_file(&assembled)?;
                } else {
                    std::fs::rename(&assembled, &target)?;
                }

                // re-split to materialize every chunk file, including the
                // ones this peer held before the download started
                chunker::split(&dir, &file_name)
            },
        )
        .await
        .expect("assembly task panicked")?;

        // restore advertisements for the full chunk set
        self.tracker
            .register_chunks(&self.peer_name, file, &chunks, Some(final_checksum))
            .await?;
        log::info!(
            "Download of '{}' complete, seeding {} chunk(s)",
            file,
            chunks.len()
        );
        Ok(())
    }
}

/// Shared state of one download run.
struct DownloadState {
    /// Chunks some worker is currently fetching.
    in_progress: Mutex<HashSet<String>>,
    /// Chunks fetched, verified, written and re-advertised this run.
    downloaded: Mutex<HashSet<String>>,
    /// What went wrong, per chunk. Failures never retry within a run; a
    /// caller retries by reissuing the whole download.
    failures: Mutex<Vec<ChunkFailure>>,
    /// One write lock per planned chunk, so no two workers can ever
    /// write the same chunk file. Planning already issues each chunk at
    /// most once; the locks hold that line even if plans ever overlap.
    write_locks: HashMap<String, AsyncMutex<()>>,
    /// Bounds how many workers fetch at once.
    workers: Semaphore,
}

impl DownloadState {
    /// Atomically claims a chunk for one worker. False means another
    /// worker has it in flight or already finished it.
    fn claim(&self, chunk_name: &str) -> bool {
        let mut in_progress = self.in_progress.lock().unwrap();
        let downloaded = self.downloaded.lock().unwrap();
        if in_progress.contains(chunk_name) || downloaded.contains(chunk_name)
        {
            return false;
        }
        in_progress.insert(chunk_name.to_string());
        true
    }

    fn release(&self, chunk_name: &str) {
        self.in_progress.lock().unwrap().remove(chunk_name);
    }

    fn mark_downloaded(&self, chunk_name: &str) {
        self.downloaded
            .lock()
            .unwrap()
            .insert(chunk_name.to_string());
    }

    fn fail(&self, chunk_name: &str, reason: impl Into<String>) {
        self.failures.lock().unwrap().push(ChunkFailure {
            chunk_name: chunk_name.to_string(),
            reason: reason.into(),
        });
    }
}

/// Everything one worker needs, cloned per task.
struct WorkerCtx {
    state: Arc<DownloadState>,
    tracker: TrackerClient,
    pool: Arc<ConnectionPool>,
    peer_name: String,
    share_dir: PathBuf,
    file: String,
    final_checksum: String,
}

/// Fetches, verifies, stores and re-advertises one chunk.
async fn fetch_chunk(ctx: WorkerCtx, task: ChunkTask) {
    // bounded concurrency: hold a worker permit for the whole fetch
    let _permit = match ctx.state.workers.acquire().await {
        Ok(permit) => permit,
        // the semaphore outlives every worker, so this can't close on us
        Err(_) => return,
    };

    let chunk_name = task.chunk.name.clone();
    if !ctx.state.claim(&chunk_name) {
        log::debug!("Chunk '{}' already claimed, dropping task", chunk_name);
        return;
    }

    let outcome = fetch_claimed(&ctx, &task).await;
    // the claim is released no matter how the fetch went
    ctx.state.release(&chunk_name);
    if let Err(reason) = outcome {
        ctx.state.fail(&chunk_name, reason);
    }
}

async fn fetch_claimed(
    ctx: &WorkerCtx,
    task: &ChunkTask,
) -> std::result::Result<(), String> {
    let chunk = &task.chunk;

    // the advertiser may have expired since the plan was made
    let peer_addr = match ctx.tracker.peer_address(&task.peer).await {
        Ok(addr) => addr,
        Err(Error::PeerNotFound(_)) => return Err("peer not found".into()),
        Err(e) => return Err(format!("tracker lookup failed: {}", e)),
    };

    let pooled = ctx
        .pool
        .get(&peer_addr)
        .await
        .map_err(|e| format!("connection failed: {}", e))?;
    let source = PeerClient::new(pooled);

    let started = Instant::now();
    let bytes = match source.send_chunk(&chunk.name).await {
        Ok(bytes) => bytes,
        Err(Error::Peer(msg)) => return Err(msg),
        Err(e) => return Err(format!("transport error: {}", e)),
    };

    // the integrity gate: a chunk that doesn't hash to its advertisement
    // never reaches disk
    if hasher::digest(&bytes) != chunk.checksum {
        return Err("checksum mismatch".into());
    }

    let elapsed = started.elapsed();
    let mib = bytes.len() as f64 / (1024.0 * 1024.0);
    log::debug!(
        "Fetched '{}' from {}: {:.2} MiB at {:.2} MiB/s",
        chunk.name,
        task.peer,
        mib,
        mib / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    let path = chunker::checked_chunk_path(&ctx.share_dir, &chunk.name)
        .map_err(|e| e.to_string())?;
    {
        let _write_lock = match ctx.state.write_locks.get(&chunk.name) {
            Some(lock) => lock.lock().await,
            None => return Err("chunk missing from plan".into()),
        };
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| format!("write failed: {}", e))?;
    }

    // become a seeder for this chunk right away, long before the rest of
    // the file is here
    ctx.tracker
        .register_chunks(
            &ctx.peer_name,
            &ctx.file,
            std::slice::from_ref(chunk),
            Some(ctx.final_checksum.as_str()),
        )
        .await
        .map_err(|e| format!("seed registration failed: {}", e))?;

    ctx.state.mark_downloaded(&chunk.name);
    Ok(())
}

/// Builds the plan: group advertisements by chunk name, drop our own and
/// anything already on disk, pick one advertiser per chunk uniformly at
/// random, and shuffle so concurrent downloads don't all hammer the same
/// advertiser front to back.
fn plan<R: Rng>(
    adverts: Vec<ChunkAdvert>,
    share_dir: &Path,
    self_name: &str,
    rng: &mut R,
) -> Vec<ChunkTask> {
    let mut by_name: HashMap<String, Vec<ChunkAdvert>> = HashMap::new();
    for advert in adverts {
        if advert.peer == self_name {
            continue;
        }
        // advertised names come from the network; drop anything the path
        // check refuses rather than letting it poison the whole plan
        let path = match chunker::checked_chunk_path(share_dir, &advert.chunk.name)
        {
            Ok(path) => path,
            Err(e) => {
                log::warn!("Skipping advertisement: {}", e);
                continue;
            }
        };
        if path.exists() {
            continue;
        }
        by_name
            .entry(advert.chunk.name.clone())
            .or_default()
            .push(advert);
    }

    let mut tasks: Vec<ChunkTask> = by_name
        .into_iter()
        .filter_map(|(_, advertisers)| {
            advertisers.choose(rng).cloned().map(|chosen| ChunkTask {
                peer: chosen.peer,
                chunk: chosen.chunk,
            })
        })
        .collect();
    tasks.shuffle(rng);
    tasks
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::chunk_name;

    fn advert(peer: &str, file: &str, index: usize) -> ChunkAdvert {
        ChunkAdvert {
            peer: peer.to_string(),
            chunk: ChunkInfo {
                index,
                name: chunk_name(file, index),
                checksum: format!("{:064x}", index),
            },
        }
    }

    #[test]
    fn test_max_parallel_table() {
        assert_eq!(max_parallel(0), 1);
        assert_eq!(max_parallel(2), 1);
        assert_eq!(max_parallel(3), 2);
        assert_eq!(max_parallel(5), 2);
        assert_eq!(max_parallel(6), 3);
        assert_eq!(max_parallel(7), 3);
        assert_eq!(max_parallel(8), 4);
        assert_eq!(max_parallel(1000), 4);
    }

    #[test]
    fn test_plan_excludes_self_and_local_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        // chunk 1 is already on disk
        std::fs::write(dir.path().join(chunk_name("data.txt", 1)), b"x")
            .expect("write");

        let adverts = vec![
            advert("alice", "data.txt", 0),
            advert("alice", "data.txt", 1),
            advert("alice", "data.txt", 2),
            advert("bob", "data.txt", 2),
            // our own advertisement must never be a source
            advert("self", "data.txt", 0),
        ];
        let mut rng = StdRng::seed_from_u64(7);
        let tasks = plan(adverts, dir.path(), "self", &mut rng);

        let mut names: Vec<&str> =
            tasks.iter().map(|t| t.chunk.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["data.txt.chunk0", "data.txt.chunk2"]);
        // chunk 0 had only one eligible advertiser
        let chunk0 = tasks.iter().find(|t| t.chunk.index == 0).expect("task");
        assert_eq!(chunk0.peer, "alice");
        // each planned chunk picks from its own advertisers
        let chunk2 = tasks.iter().find(|t| t.chunk.index == 2).expect("task");
        assert!(chunk2.peer == "alice" || chunk2.peer == "bob");
    }

    #[test]
    fn test_plan_issues_each_chunk_at_most_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut adverts = Vec::new();
        // many advertisers per chunk, duplicates included
        for peer in &["alice", "bob", "carol"] {
            for index in 0..4 {
                adverts.push(advert(peer, "data.txt", index));
                adverts.push(advert(peer, "data.txt", index));
            }
        }
        let mut rng = StdRng::seed_from_u64(42);
        let tasks = plan(adverts, dir.path(), "self", &mut rng);

        let names: HashSet<&str> =
            tasks.iter().map(|t| t.chunk.name.as_str()).collect();
        assert_eq!(tasks.len(), 4);
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn test_plan_skips_unsafe_advertised_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut evil = advert("mallory", "data.txt", 0);
        evil.chunk.name = "../../etc/shadow".to_string();
        let adverts = vec![evil, advert("alice", "data.txt", 1)];

        let mut rng = StdRng::seed_from_u64(3);
        let tasks = plan(adverts, dir.path(), "self", &mut rng);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].chunk.index, 1);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let state = DownloadState {
            in_progress: Mutex::new(HashSet::new()),
            downloaded: Mutex::new(HashSet::new()),
            failures: Mutex::new(Vec::new()),
            write_locks: HashMap::new(),
            workers: Semaphore::new(1),
        };

        assert!(state.claim("data.txt.chunk0"));
        // second claim while in flight is refused
        assert!(!state.claim("data.txt.chunk0"));

        // a finished chunk stays claimed even after release
        state.mark_downloaded("data.txt.chunk0");
        state.release("data.txt.chunk0");
        assert!(!state.claim("data.txt.chunk0"));

        // a failed chunk (released, not downloaded) could be re-claimed
        // by a hypothetical replan
        assert!(state.claim("data.txt.chunk1"));
        state.release("data.txt.chunk1");
        assert!(state.claim("data.txt.chunk1"));
    }
}
