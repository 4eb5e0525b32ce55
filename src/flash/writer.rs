//! Block device writer
//!
//! Streams an image onto a device in fixed-size chunks on the blocking pool.
//! One job runs at a time. The cancellation token is checked between chunks,
//! and the device is fsynced whether the job completes or is cancelled, so a
//! cancelled write leaves a well-defined prefix on the device.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{WriteProgress, WriteStatus};
use crate::config::WriterConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, LabEvent};
use crate::lifecycle::claims::{Claim, ClaimRole, ResourceClaims};
use crate::msd::ImageSelection;

/// A running or finished write
pub struct WriteJob {
    pub id: Uuid,
    pub device: PathBuf,
    pub source: ImageSelection,
    pub started_at: DateTime<Utc>,
    written: AtomicU64,
    status: watch::Sender<WriteStatus>,
    cancel: CancellationToken,
}

pub type JobHandle = Arc<WriteJob>;

impl WriteJob {
    fn new(device: &Path, source: &ImageSelection) -> Self {
        let (status, _rx) = watch::channel(WriteStatus::Running);
        Self {
            id: Uuid::new_v4(),
            device: device.to_path_buf(),
            source: source.clone(),
            started_at: Utc::now(),
            written: AtomicU64::new(0),
            status,
            cancel: CancellationToken::new(),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> WriteStatus {
        self.status.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.status.borrow().is_finished()
    }

    /// Request cancellation; takes effect at the next chunk boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Non-blocking progress snapshot
    pub fn progress(&self) -> WriteProgress {
        WriteProgress {
            job_id: self.id,
            device: self.device.clone(),
            source: self.source.name.clone(),
            bytes_written: self.bytes_written(),
            total_bytes: self.source.size,
            status: self.status(),
            started_at: self.started_at,
        }
    }

    /// Wait until the job has finished
    pub async fn wait(&self) -> WriteStatus {
        let mut rx = self.status.subscribe();
        let status = match rx.wait_for(|s| s.is_finished()).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        };
        status
    }

    fn finish(&self, status: WriteStatus) {
        self.status.send_replace(status);
    }
}

/// Outcome of the copy loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Completed,
    Cancelled,
}

/// Copy `src` into `dst` chunk by chunk
///
/// `written` is advanced after every chunk and `on_chunk` is called with the
/// running total. The token is checked before each chunk is read.
pub fn copy_image<R: Read, W: Write>(
    src: &mut R,
    dst: &mut W,
    chunk_size: usize,
    token: &CancellationToken,
    written: &AtomicU64,
    mut on_chunk: impl FnMut(u64),
) -> io::Result<CopyOutcome> {
    let mut buf = vec![0u8; chunk_size.max(1)];

    loop {
        if token.is_cancelled() {
            return Ok(CopyOutcome::Cancelled);
        }

        let n = read_full(src, &mut buf)?;
        if n == 0 {
            return Ok(CopyOutcome::Completed);
        }

        dst.write_all(&buf[..n])?;
        let total = written.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
        on_chunk(total);
    }
}

/// Fill `buf` unless EOF comes first
fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Files and claims a job needs, acquired before it is started
struct Prepared {
    source: File,
    target: File,
    _claims: (Claim, Claim),
}

/// Image-to-device writer; at most one job at a time
pub struct BlockDeviceWriter {
    config: WriterConfig,
    claims: ResourceClaims,
    events: EventBus,
    start_lock: tokio::sync::Mutex<()>,
    /// Most recent job, running or finished
    current: Mutex<Option<JobHandle>>,
}

impl BlockDeviceWriter {
    pub fn new(config: WriterConfig, claims: ResourceClaims, events: EventBus) -> Self {
        Self {
            config,
            claims,
            events,
            start_lock: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
        }
    }

    /// Most recent job, running or finished
    pub fn current(&self) -> Option<JobHandle> {
        self.current.lock().clone()
    }

    /// Job in flight, if any
    pub fn running(&self) -> Option<JobHandle> {
        self.current().filter(|job| job.is_running())
    }

    /// Validate the target and start copying `image` onto `device`
    pub async fn start(&self, image: &ImageSelection, device: &Path) -> Result<JobHandle> {
        let _guard = self.start_lock.lock().await;

        if let Some(job) = self.running() {
            return Err(AppError::DeviceBusy(format!(
                "a write to {} is already running",
                job.device.display()
            )));
        }

        image.revalidate()?;

        let target_claim = self
            .claims
            .claim(device, ClaimRole::WriteTarget)
            .map_err(|c| AppError::DeviceBusy(c.to_string()))?;
        let source_claim = self
            .claims
            .claim(&image.path, ClaimRole::WriteSource)
            .map_err(|c| AppError::ImageUnavailable(c.to_string()))?;

        let job = Arc::new(WriteJob::new(device, image));
        let (device_path, source_image) = (device.to_path_buf(), image.clone());
        let prepared = tokio::task::spawn_blocking(move || {
            prepare(&source_image, &device_path, (target_claim, source_claim))
        })
        .await
        .map_err(|e| AppError::Internal(format!("Task join error: {}", e)))??;

        info!(
            "Writing {} ({}) to {}",
            image.name,
            image.size_display(),
            device.display()
        );
        self.events.publish(LabEvent::WriteStarted {
            job_id: job.id.to_string(),
            device: device.display().to_string(),
            source: image.path.display().to_string(),
            total_bytes: image.size,
        });

        *self.current.lock() = Some(job.clone());

        let chunk_size = self.config.chunk_size;
        let interval = Duration::from_millis(self.config.progress_interval_ms);
        let events = self.events.clone();
        let task_job = job.clone();
        tokio::task::spawn_blocking(move || {
            run_job(&task_job, prepared, chunk_size, interval, &events)
        });

        Ok(job)
    }
}

fn prepare(image: &ImageSelection, device: &Path, claims: (Claim, Claim)) -> Result<Prepared> {
    let source = File::open(&image.path)
        .map_err(|e| AppError::ImageUnavailable(format!("{}: {}", image.path.display(), e)))?;

    let mut target = OpenOptions::new()
        .write(true)
        .custom_flags(target_flags(device))
        .open(device)
        .map_err(|e| AppError::from_open(e, device))?;

    let capacity = target.seek(SeekFrom::End(0))?;
    target.seek(SeekFrom::Start(0))?;
    debug!("{} capacity: {} bytes", device.display(), capacity);

    if capacity < image.size {
        return Err(AppError::DeviceTooSmall {
            device: device.display().to_string(),
            required: image.size,
            capacity,
        });
    }

    Ok(Prepared {
        source,
        target,
        _claims: claims,
    })
}

/// Extra open flags for the write target
///
/// Block devices are opened with O_EXCL so one that is mounted or held by
/// another process fails with EBUSY instead of being overwritten.
fn target_flags(device: &Path) -> i32 {
    let is_block = fs::metadata(device)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false);
    exclusive_flags(is_block)
}

fn exclusive_flags(is_block_device: bool) -> i32 {
    if is_block_device {
        libc::O_EXCL
    } else {
        0
    }
}

fn run_job(
    job: &WriteJob,
    mut prepared: Prepared,
    chunk_size: usize,
    interval: Duration,
    events: &EventBus,
) {
    let mut last_emit = Instant::now();
    let outcome = copy_image(
        &mut prepared.source,
        &mut prepared.target,
        chunk_size,
        &job.cancel,
        &job.written,
        |total| {
            if last_emit.elapsed() >= interval {
                last_emit = Instant::now();
                events.publish(LabEvent::WriteProgress {
                    job_id: job.id.to_string(),
                    bytes_written: total,
                    total_bytes: job.source.size,
                });
            }
        },
    );

    let status = match outcome.and_then(|o| prepared.target.sync_all().map(|_| o)) {
        Ok(CopyOutcome::Completed) => {
            info!(
                "Write to {} completed: {} bytes",
                job.device.display(),
                job.bytes_written()
            );
            WriteStatus::Completed
        }
        Ok(CopyOutcome::Cancelled) => {
            info!(
                "Write to {} cancelled after {} bytes",
                job.device.display(),
                job.bytes_written()
            );
            WriteStatus::Cancelled
        }
        Err(e) => {
            warn!("Write to {} failed: {}", job.device.display(), e);
            WriteStatus::Failed(e.to_string())
        }
    };

    // Claims are released before waiters observe the final status
    drop(prepared);

    events.publish(LabEvent::WriteFinished {
        job_id: job.id.to_string(),
        status: status.as_str().to_string(),
        bytes_written: job.bytes_written(),
        error: match &status {
            WriteStatus::Failed(reason) => Some(reason.clone()),
            _ => None,
        },
    });
    job.finish(status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn writer(claims: &ResourceClaims, chunk_size: usize) -> BlockDeviceWriter {
        let config = WriterConfig {
            chunk_size,
            progress_interval_ms: 0,
        };
        BlockDeviceWriter::new(config, claims.clone(), EventBus::new())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_copy_cancel_between_chunks() {
        let data = pattern(10 * 64);
        let mut src = Cursor::new(data.clone());
        let mut dst = Vec::new();
        let token = CancellationToken::new();
        let written = AtomicU64::new(0);
        let mut seen = Vec::new();

        let outcome = copy_image(&mut src, &mut dst, 64, &token, &written, |total| {
            seen.push(total);
            if seen.len() == 3 {
                token.cancel();
            }
        })
        .unwrap();

        assert_eq!(outcome, CopyOutcome::Cancelled);
        assert_eq!(written.load(Ordering::Relaxed), 3 * 64);
        assert_eq!(dst, data[..3 * 64]);
        assert_eq!(seen, vec![64, 128, 192]);
    }

    #[test]
    fn test_copy_partial_last_chunk() {
        let data = pattern(100);
        let mut dst = Vec::new();
        let written = AtomicU64::new(0);

        let outcome = copy_image(
            &mut Cursor::new(data.clone()),
            &mut dst,
            64,
            &CancellationToken::new(),
            &written,
            |_| {},
        )
        .unwrap();

        assert_eq!(outcome, CopyOutcome::Completed);
        assert_eq!(dst, data);
        assert_eq!(written.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_block_devices_opened_exclusively() {
        assert_eq!(exclusive_flags(true), libc::O_EXCL);
        assert_eq!(exclusive_flags(false), 0);

        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("disk.img");
        fs::write(&file, b"").unwrap();
        assert_eq!(target_flags(&file), 0);
        assert_eq!(target_flags(&temp_dir.path().join("sdz")), 0);
        assert_eq!(target_flags(Path::new("/dev/null")), 0);
    }

    #[tokio::test]
    async fn test_write_image_to_device() {
        let temp_dir = TempDir::new().unwrap();
        let image_path = temp_dir.path().join("debian.iso");
        let device = temp_dir.path().join("sdb");
        let data = pattern(2_048_000);
        fs::write(&image_path, &data).unwrap();
        fs::write(&device, vec![0u8; 4_000_000]).unwrap();

        let claims = ResourceClaims::new();
        let writer = writer(&claims, 256 * 1024);
        let image = ImageSelection::open(&image_path).unwrap();

        let job = writer.start(&image, &device).await.unwrap();
        assert_eq!(job.wait().await, WriteStatus::Completed);

        let progress = job.progress();
        assert_eq!(progress.bytes_written, 2_048_000);
        assert_eq!(progress.total_bytes, 2_048_000);

        let written = fs::read(&device).unwrap();
        assert_eq!(written.len(), 4_000_000);
        assert_eq!(&written[..2_048_000], &data[..]);
        assert!(written[2_048_000..].iter().all(|b| *b == 0));
        assert!(claims.is_empty());
        assert!(writer.running().is_none());
    }

    #[tokio::test]
    async fn test_device_too_small() {
        let temp_dir = TempDir::new().unwrap();
        let image_path = temp_dir.path().join("big.img");
        let device = temp_dir.path().join("sdc");
        fs::write(&image_path, vec![1u8; 4096]).unwrap();
        fs::write(&device, vec![0u8; 1024]).unwrap();

        let claims = ResourceClaims::new();
        let writer = writer(&claims, 1024);
        let image = ImageSelection::open(&image_path).unwrap();

        let err = writer.start(&image, &device).await.err().unwrap();
        assert!(matches!(
            err,
            AppError::DeviceTooSmall {
                required: 4096,
                capacity: 1024,
                ..
            }
        ));
        assert!(claims.is_empty());
        assert!(writer.current().is_none());
    }

    #[tokio::test]
    async fn test_missing_device() {
        let temp_dir = TempDir::new().unwrap();
        let image_path = temp_dir.path().join("a.iso");
        fs::write(&image_path, b"abc").unwrap();

        let claims = ResourceClaims::new();
        let writer = writer(&claims, 1024);
        let image = ImageSelection::open(&image_path).unwrap();

        let err = writer
            .start(&image, &temp_dir.path().join("sdz"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "not_found");
        assert!(!temp_dir.path().join("sdz").exists());
    }

    #[tokio::test]
    async fn test_claimed_target_is_busy() {
        let temp_dir = TempDir::new().unwrap();
        let image_path = temp_dir.path().join("a.iso");
        let device = temp_dir.path().join("sdb");
        fs::write(&image_path, b"abc").unwrap();
        fs::write(&device, vec![0u8; 16]).unwrap();

        let claims = ResourceClaims::new();
        let _backing = claims.claim(&device, ClaimRole::Backing).unwrap();
        let writer = writer(&claims, 1024);
        let image = ImageSelection::open(&image_path).unwrap();

        let err = writer.start(&image, &device).await.err().unwrap();
        assert_eq!(err.code(), "device_busy");
        assert_eq!(claims.holders(&device), vec![ClaimRole::Backing]);
    }

    #[tokio::test]
    async fn test_progress_events_published() {
        let temp_dir = TempDir::new().unwrap();
        let image_path = temp_dir.path().join("a.iso");
        let device = temp_dir.path().join("sdb");
        fs::write(&image_path, pattern(4096)).unwrap();
        fs::write(&device, vec![0u8; 4096]).unwrap();

        let claims = ResourceClaims::new();
        let writer = writer(&claims, 1024);
        let mut rx = writer.events.subscribe();
        let image = ImageSelection::open(&image_path).unwrap();

        let job = writer.start(&image, &device).await.unwrap();
        job.wait().await;

        let mut last_progress = 0;
        let mut finished = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                LabEvent::WriteProgress { bytes_written, .. } => {
                    assert!(bytes_written >= last_progress);
                    last_progress = bytes_written;
                }
                LabEvent::WriteFinished { status, .. } => {
                    assert_eq!(status, "completed");
                    finished = true;
                }
                _ => {}
            }
        }
        assert!(finished);
        assert_eq!(last_progress, 4096);
    }
}
