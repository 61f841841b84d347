use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{error, warn};

pub const MAX_QUEUE_SIZE: usize = 100;
const RESUME_FRACTION_PERCENT: usize = 80;

const STAGING_CAPACITY: usize = 4 * 1024 * 1024;

/// Writer capability selected at runtime by the file manager. Errors are
/// reported through the return value and kept as a string; a failed write
/// leaves the writer open but degraded.
pub trait FileWriter: Send {
    fn open(&mut self, path: &Path) -> bool;
    fn write(&mut self, data: &[u8]) -> bool;
    fn close(&mut self) -> bool;
    fn last_error(&self) -> Option<String>;
    fn is_open(&self) -> bool;
}

/// Buffered synchronous writer: accumulates into a 4 MiB staging buffer and
/// only touches the disk when it fills (or on close).
pub struct StdWriter {
    file: Option<File>,
    staging: Vec<u8>,
    last_error: Option<String>,
}

impl Default for StdWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl StdWriter {
    pub fn new() -> Self {
        StdWriter {
            file: None,
            staging: Vec::with_capacity(STAGING_CAPACITY),
            last_error: None,
        }
    }

    fn flush_staging(&mut self) -> bool {
        if self.staging.is_empty() {
            return true;
        }
        let Some(file) = self.file.as_mut() else {
            self.last_error = Some("writer is not open".into());
            return false;
        };
        match file.write_all(&self.staging) {
            Ok(()) => {
                self.staging.clear();
                true
            }
            Err(e) => {
                self.last_error = Some(format!("write failed: {e}"));
                false
            }
        }
    }
}

impl FileWriter for StdWriter {
    fn open(&mut self, path: &Path) -> bool {
        match File::create(path) {
            Ok(file) => {
                self.file = Some(file);
                self.staging.clear();
                self.last_error = None;
                true
            }
            Err(e) => {
                self.last_error = Some(format!("open {} failed: {e}", path.display()));
                false
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> bool {
        if self.file.is_none() {
            self.last_error = Some("writer is not open".into());
            return false;
        }
        self.staging.extend_from_slice(data);
        if self.staging.len() >= STAGING_CAPACITY {
            return self.flush_staging();
        }
        true
    }

    fn close(&mut self) -> bool {
        let flushed = self.flush_staging();
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all() {
                warn!("sync on close failed: {e}");
            }
        }
        flushed
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

struct AsyncShared {
    queue: Mutex<VecDeque<Vec<u8>>>,
    data_ready: Condvar,
    not_full: Condvar,
    stop: AtomicBool,
    error: Mutex<Option<String>>,
}

/// Asynchronous writer: `write` enqueues onto a bounded queue drained by a
/// worker thread that flushes after every blob. A full queue blocks the
/// producer until the backlog drops below 80 % of capacity.
pub struct AsyncWriter {
    shared: Arc<AsyncShared>,
    worker: Option<JoinHandle<()>>,
    max_queue: usize,
    resume_below: usize,
}

impl Default for AsyncWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncWriter {
    pub fn new() -> Self {
        Self::with_queue_limit(MAX_QUEUE_SIZE)
    }

    pub fn with_queue_limit(max_queue: usize) -> Self {
        AsyncWriter {
            shared: Arc::new(AsyncShared {
                queue: Mutex::new(VecDeque::new()),
                data_ready: Condvar::new(),
                not_full: Condvar::new(),
                stop: AtomicBool::new(false),
                error: Mutex::new(None),
            }),
            worker: None,
            max_queue,
            resume_below: max_queue * RESUME_FRACTION_PERCENT / 100,
        }
    }

    fn worker_loop(mut file: File, shared: Arc<AsyncShared>) {
        loop {
            let blob = {
                let mut queue = shared.queue.lock().unwrap();
                while queue.is_empty() && !shared.stop.load(Ordering::Acquire) {
                    queue = shared.data_ready.wait(queue).unwrap();
                }
                match queue.pop_front() {
                    Some(blob) => blob,
                    None => break, // stopped and drained
                }
            };
            shared.not_full.notify_all();

            if let Err(e) = file.write_all(&blob).and_then(|()| file.flush()) {
                error!("async writer i/o failure: {e}");
                *shared.error.lock().unwrap() = Some(format!("write failed: {e}"));
            }
        }

        if let Err(e) = file.sync_all() {
            warn!("sync on close failed: {e}");
        }
    }
}

impl FileWriter for AsyncWriter {
    fn open(&mut self, path: &Path) -> bool {
        if self.worker.is_some() {
            self.close();
        }

        let file = match File::create(path) {
            Ok(file) => file,
            Err(e) => {
                *self.shared.error.lock().unwrap() =
                    Some(format!("open {} failed: {e}", path.display()));
                return false;
            }
        };

        self.shared.stop.store(false, Ordering::Release);
        self.shared.queue.lock().unwrap().clear();
        *self.shared.error.lock().unwrap() = None;

        let shared = Arc::clone(&self.shared);
        match std::thread::Builder::new()
            .name("async-writer".into())
            .spawn(move || Self::worker_loop(file, shared))
        {
            Ok(handle) => {
                self.worker = Some(handle);
                true
            }
            Err(e) => {
                *self.shared.error.lock().unwrap() = Some(format!("spawn failed: {e}"));
                false
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> bool {
        if self.worker.is_none() {
            *self.shared.error.lock().unwrap() = Some("writer is not open".into());
            return false;
        }

        let mut queue = self.shared.queue.lock().unwrap();
        if queue.len() >= self.max_queue {
            // Block until the worker has drained below the resume mark.
            while queue.len() >= self.resume_below && !self.shared.stop.load(Ordering::Acquire) {
                queue = self.shared.not_full.wait(queue).unwrap();
            }
        }
        queue.push_back(data.to_vec());
        drop(queue);
        self.shared.data_ready.notify_one();
        true
    }

    fn close(&mut self) -> bool {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.data_ready.notify_all();
        self.shared.not_full.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.shared.error.lock().unwrap().is_none()
    }

    fn last_error(&self) -> Option<String> {
        self.shared.error.lock().unwrap().clone()
    }

    fn is_open(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn std_writer_stages_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staged.raw");

        let mut writer = StdWriter::new();
        assert!(writer.open(&path));
        assert!(writer.write(b"hello "));
        assert!(writer.write(b"world"));

        // Nothing reaches the disk before the staging buffer fills.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        assert!(writer.close());
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn std_writer_flushes_through_when_staging_fills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.raw");

        let mut writer = StdWriter::new();
        assert!(writer.open(&path));
        let chunk = vec![0xa5u8; STAGING_CAPACITY];
        assert!(writer.write(&chunk));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), chunk.len() as u64);
        writer.close();
    }

    #[test]
    fn std_writer_reports_open_failure() {
        let mut writer = StdWriter::new();
        assert!(!writer.open(Path::new("/nonexistent-dir/file.raw")));
        assert!(writer.last_error().is_some());
        assert!(!writer.is_open());
    }

    #[test]
    fn async_writer_persists_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("async.raw");

        let mut writer = AsyncWriter::new();
        assert!(writer.open(&path));
        for i in 0..20u8 {
            assert!(writer.write(&[i; 3]));
        }
        assert!(writer.close());

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 60);
        assert_eq!(&contents[0..3], &[0, 0, 0]);
        assert_eq!(&contents[57..60], &[19, 19, 19]);
    }

    #[test]
    fn async_writer_close_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drain.raw");

        let mut writer = AsyncWriter::with_queue_limit(10);
        assert!(writer.open(&path));
        let blob = vec![1u8; 4096];
        for _ in 0..8 {
            writer.write(&blob);
        }
        assert!(writer.close());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8 * 4096);
    }

    #[test]
    fn async_writer_blocks_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocked.raw");

        let mut writer = AsyncWriter::with_queue_limit(5);
        assert!(writer.open(&path));

        // Writes proceed even when the producer momentarily outruns the
        // worker; each call returns only after space was available.
        let start = std::time::Instant::now();
        for _ in 0..50 {
            assert!(writer.write(&[0u8; 65536]));
        }
        assert!(writer.close());
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            50 * 65536
        );
    }

    #[test]
    fn async_writer_write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.raw");

        let mut writer = AsyncWriter::new();
        assert!(writer.open(&path));
        writer.close();
        assert!(!writer.write(b"late"));
        assert!(writer.last_error().is_some());
    }
}
