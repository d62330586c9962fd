//! Network Integration Tests
//!
//! Downloads streamed straight into the disk tier, the way the network tier
//! writes them.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tierfetch::cache::{CacheKey, DiskConfig, DiskHealth, DiskTier};
use tierfetch::network::{
    DownloadJob, DownloaderConfig, InMemoryTransport, LowSpeedConfigure,
    MultiConnectionDownloader, ServedResource, SpeedRecorder, Timeouts,
};
use tierfetch::sink::ByteSink;
use tierfetch::{Error, LoadParams, NetworkClass};
use tokio_util::sync::CancellationToken;

fn pattern(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i * 13 % 241) as u8).collect::<Vec<_>>())
}

fn job(url: &str) -> DownloadJob {
    DownloadJob {
        url: url.to_string(),
        timeouts: Timeouts::default(),
        low_speed: LowSpeedConfigure::new(
            NetworkClass::Wifi,
            Duration::from_secs(10),
            Duration::from_secs(30),
            1,
        )
        .unwrap(),
        length_limit: None,
        cancel: CancellationToken::new(),
        escalation: None,
    }
}

fn downloader(transport: Arc<InMemoryTransport>) -> MultiConnectionDownloader {
    MultiConnectionDownloader::new(
        transport,
        Arc::new(SpeedRecorder::default()),
        DownloaderConfig::default(),
    )
}

fn disk(root: &std::path::Path, budget: u64) -> Arc<DiskTier> {
    let config = DiskConfig {
        root: root.to_path_buf(),
        budget,
    };
    DiskTier::open(config, DiskHealth::new(Duration::from_secs(5))).unwrap()
}

fn key(url: &str) -> CacheKey {
    CacheKey::derive(url, &LoadParams::new()).unwrap()
}

async fn fetch_into(
    disk: &Arc<DiskTier>,
    downloader: &MultiConnectionDownloader,
    job: &DownloadJob,
) -> tierfetch::Result<std::path::PathBuf> {
    let writer = disk.begin_write(&key(&job.url), None)?;
    let sink: Arc<dyn ByteSink> = Arc::new(writer.sink()?);
    downloader.download(job, sink).await?;
    let committed = writer.commit()?;
    Ok(committed.path().to_path_buf())
}

// =============================================================================
// Feature 1: Downloads Into the Disk Tier
// =============================================================================

mod disk_download_tests {
    use super::*;

    #[tokio::test]
    async fn test_block_parallel_download_lands_intact() {
        let dir = tempfile::tempdir().unwrap();
        let url = "http://cdn.example/large.jpg";
        let data = pattern(400 * 1024 + 3);
        let transport = Arc::new(InMemoryTransport::new());
        transport.serve(url, ServedResource::new(data.clone()));

        let disk = disk(dir.path(), 10 * 1024 * 1024);
        let path = fetch_into(&disk, &downloader(transport.clone()), &job(url))
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), data.to_vec());
        assert!(transport.ranged_requests(url) > 1);
        assert_eq!(disk.read(&key(url)), Some(path));
        assert_eq!(disk.stats().total_bytes, data.len() as u64);
    }

    #[tokio::test]
    async fn test_range_mismatch_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = "http://cdn.example/liar.jpg";
        let data = pattern(200 * 1024);
        let transport = Arc::new(InMemoryTransport::new());
        transport.serve(url, ServedResource::new(data.clone()).misreporting_ranges());

        let disk = disk(dir.path(), 10 * 1024 * 1024);
        let path = fetch_into(&disk, &downloader(transport), &job(url))
            .await
            .unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), data.len());
        assert_eq!(written, data.to_vec());
    }

    #[tokio::test]
    async fn test_committed_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = "http://cdn.example/kept.png";
        let transport = Arc::new(InMemoryTransport::new());
        transport.serve(url, ServedResource::new(pattern(2048)));

        {
            let disk = disk(dir.path(), 1024 * 1024);
            fetch_into(&disk, &downloader(transport), &job(url))
                .await
                .unwrap();
        }

        let reopened = disk(dir.path(), 1024 * 1024);
        let path = reopened.read(&key(url)).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), pattern(2048).to_vec());
    }

    #[tokio::test]
    async fn test_budget_evicts_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(InMemoryTransport::new());
        let urls = ["http://cdn.example/a", "http://cdn.example/b", "http://cdn.example/c"];
        for url in urls {
            transport.serve(url, ServedResource::new(pattern(100)));
        }
        let disk = disk(dir.path(), 250);
        let downloader = downloader(transport);

        fetch_into(&disk, &downloader, &job(urls[0])).await.unwrap();
        fetch_into(&disk, &downloader, &job(urls[1])).await.unwrap();
        // a becomes most recent, so b is the victim
        assert!(disk.read(&key(urls[0])).is_some());
        fetch_into(&disk, &downloader, &job(urls[2])).await.unwrap();

        assert!(disk.contains(&key(urls[0])));
        assert!(!disk.contains(&key(urls[1])));
        assert!(disk.contains(&key(urls[2])));
        assert!(disk.stats().total_bytes <= 250);
    }
}

// =============================================================================
// Feature 2: Aborted Downloads
// =============================================================================

mod abort_tests {
    use super::*;

    #[tokio::test]
    async fn test_canceled_download_leaves_nothing_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let url = "http://cdn.example/slow.jpg";
        let transport = Arc::new(InMemoryTransport::new());
        transport.serve(
            url,
            ServedResource::new(pattern(50_000)).throttled(512, Duration::from_millis(50)),
        );
        let disk = disk(dir.path(), 1024 * 1024);
        let job = job(url);

        let cancel = job.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            cancel.cancel();
        });

        let result = fetch_into(&disk, &downloader(transport), &job).await;
        assert!(matches!(result, Err(Error::Canceled)));
        assert!(!disk.contains(&key(url)));
        assert_eq!(disk.stats().entries, 0);

        // the write lease was released with the writer
        let writer = disk.begin_write(&key(url), None).unwrap();
        writer.abort();
    }

    #[tokio::test]
    async fn test_http_error_keeps_disk_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let url = "http://cdn.example/gone.jpg";
        let transport = Arc::new(InMemoryTransport::new());
        transport.serve(url, ServedResource::new(pattern(10)).with_status(410));
        let disk = disk(dir.path(), 1024 * 1024);

        let result = fetch_into(&disk, &downloader(transport), &job(url)).await;
        assert!(matches!(result, Err(Error::HttpStatus { status: 410, .. })));
        assert!(disk.is_healthy());
        assert_eq!(disk.stats().entries, 0);
    }
}
