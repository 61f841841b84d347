use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Local;
use log::{error, info, warn};
use util::packet::{DataPacket, DataPacketBatch};
use util::stats::SmoothedRate;

use super::convert::{builtin, Converter};
use super::writer::{AsyncWriter, FileWriter, StdWriter};
use super::{FileFormat, SaveParameters, SaveStatistics, SaveStatus};
use crate::error::SaveError;
use crate::events::{Event, EventBus};
use crate::process::DataSink;

const SAVE_WAIT_INTERVAL: Duration = Duration::from_millis(100);
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);
const WRITE_ERROR_BACKOFF: Duration = Duration::from_millis(500);
const SAVE_RATE_ALPHA: f64 = 0.3;

const LOAD_CHUNK_SIZE: usize = 1024 * 1024;
const LOAD_PACKET_SIZE: usize = 64 * 1024;
const LOAD_QUEUE_CAP: usize = 1000;
const LOAD_FULL_BACKOFF: Duration = Duration::from_millis(10);
const LOAD_PROGRESS_STEP: u8 = 5;

const DEFAULT_CACHE_BYTES: usize = 16 * 1024 * 1024;

/// Bounded in-memory cache of recently written blobs, kept for UI preview.
struct DataCache {
    entries: VecDeque<Arc<[u8]>>,
    total: usize,
    max: usize,
}

impl DataCache {
    fn new(max: usize) -> Self {
        DataCache {
            entries: VecDeque::new(),
            total: 0,
            max,
        }
    }

    fn add(&mut self, blob: Arc<[u8]>) {
        self.total += blob.len();
        self.entries.push_back(blob);
        while self.total > self.max {
            match self.entries.pop_front() {
                Some(evicted) => self.total -= evicted.len(),
                None => break,
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.total = 0;
    }

    fn latest(&self) -> Option<Arc<[u8]>> {
        self.entries.back().cloned()
    }
}

struct SaveQueues {
    packets: VecDeque<DataPacket>,
    batches: VecDeque<DataPacketBatch>,
}

enum SaveItem {
    Batch(DataPacketBatch),
    Packet(DataPacket),
}

struct ProgressTracker {
    last_emit: Instant,
    last_total: u64,
}

struct LoaderShared {
    loading: AtomicBool,
    queue: Mutex<VecDeque<DataPacket>>,
    seek_target: Mutex<Option<u64>>,
    file_path: Mutex<Option<PathBuf>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct ManagerInner {
    events: EventBus,
    params: Mutex<SaveParameters>,
    stats: Mutex<SaveStatistics>,
    writer: Mutex<Box<dyn FileWriter>>,
    converters: Mutex<HashMap<FileFormat, Arc<dyn Converter>>>,
    queues: Mutex<SaveQueues>,
    data_ready: Condvar,
    running: AtomicBool,
    paused: AtomicBool,
    save_thread: Mutex<Option<JoinHandle<()>>>,
    rate: SmoothedRate,
    progress: Mutex<ProgressTracker>,
    cache: Mutex<DataCache>,
    loader: LoaderShared,
    read_in_flight: AtomicBool,
}

/// Owns a writer and a converter set: applies the naming policy, splits
/// files on size/duration, writes sidecar metadata and offers offline
/// read-back of previously saved captures.
pub struct FileManager {
    inner: Arc<ManagerInner>,
}

fn timestamp_segment() -> String {
    Local::now().format("%Y%m%d_%H%M%S_%3f").to_string()
}

fn date_segment() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// `{prefix}[_{seq:06}][_{timestamp}].{ext}`
fn build_file_name(params: &SaveParameters, sequence: u32, extension: &str) -> String {
    let mut name = params.file_prefix.clone();
    if params.auto_naming {
        name.push_str(&format!("_{sequence:06}"));
    }
    if params.append_timestamp {
        name.push('_');
        name.push_str(&timestamp_segment());
    }
    name.push('.');
    name.push_str(extension);
    name
}

fn resolve_save_dir(params: &SaveParameters) -> PathBuf {
    if params.create_subfolder {
        params.base_path.join(date_segment())
    } else {
        params.base_path.clone()
    }
}

impl FileManager {
    pub fn new(events: EventBus) -> Arc<Self> {
        let mut converters: HashMap<FileFormat, Arc<dyn Converter>> = HashMap::new();
        for format in [
            FileFormat::Raw,
            FileFormat::Bmp,
            FileFormat::Tiff,
            FileFormat::Png,
            FileFormat::Csv,
        ] {
            if let Some(converter) = builtin(format) {
                converters.insert(format, converter);
            }
        }

        Arc::new(FileManager {
            inner: Arc::new(ManagerInner {
                events,
                params: Mutex::new(SaveParameters::default()),
                stats: Mutex::new(SaveStatistics::default()),
                writer: Mutex::new(Box::new(AsyncWriter::new())),
                converters: Mutex::new(converters),
                queues: Mutex::new(SaveQueues {
                    packets: VecDeque::new(),
                    batches: VecDeque::new(),
                }),
                data_ready: Condvar::new(),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                save_thread: Mutex::new(None),
                rate: SmoothedRate::new(SAVE_RATE_ALPHA),
                progress: Mutex::new(ProgressTracker {
                    last_emit: Instant::now(),
                    last_total: 0,
                }),
                cache: Mutex::new(DataCache::new(DEFAULT_CACHE_BYTES)),
                loader: LoaderShared {
                    loading: AtomicBool::new(false),
                    queue: Mutex::new(VecDeque::new()),
                    seek_target: Mutex::new(None),
                    file_path: Mutex::new(None),
                    thread: Mutex::new(None),
                },
                read_in_flight: AtomicBool::new(false),
            }),
        })
    }

    pub fn set_save_parameters(&self, params: SaveParameters) {
        *self.inner.params.lock().unwrap() = params;
    }

    pub fn save_parameters(&self) -> SaveParameters {
        self.inner.params.lock().unwrap().clone()
    }

    pub fn statistics(&self) -> SaveStatistics {
        self.inner.stats.lock().unwrap().clone()
    }

    pub fn is_saving(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn register_converter(&self, format: FileFormat, converter: Arc<dyn Converter>) {
        self.inner.converters.lock().unwrap().insert(format, converter);
    }

    pub fn supported_formats(&self) -> Vec<&'static str> {
        let converters = self.inner.converters.lock().unwrap();
        let mut extensions: Vec<&'static str> =
            converters.values().map(|c| c.file_extension()).collect();
        extensions.sort_unstable();
        extensions.dedup();
        extensions
    }

    /// Swap the writer strategy. Refused while a save is running.
    pub fn set_use_async_writer(&self, use_async: bool) -> Result<(), SaveError> {
        if self.is_saving() {
            return Err(SaveError::Busy);
        }
        let mut writer = self.inner.writer.lock().unwrap();
        *writer = if use_async {
            Box::new(AsyncWriter::new())
        } else {
            Box::new(StdWriter::new())
        };
        Ok(())
    }

    pub fn start_saving(&self) -> Result<(), SaveError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(SaveError::AlreadyRunning);
        }

        let params = self.save_parameters();
        let save_dir = resolve_save_dir(&params);
        if let Err(e) = std::fs::create_dir_all(&save_dir) {
            self.inner.running.store(false, Ordering::Release);
            error!("save directory not writable: {e}");
            return Err(SaveError::PathNotWritable(save_dir));
        }

        {
            let mut stats = self.inner.stats.lock().unwrap();
            *stats = SaveStatistics {
                status: SaveStatus::Saving,
                save_path: save_dir,
                ..SaveStatistics::default()
            };
        }
        self.inner.rate.reset();
        {
            let mut progress = self.inner.progress.lock().unwrap();
            progress.last_emit = Instant::now();
            progress.last_total = 0;
        }
        self.inner.paused.store(false, Ordering::Release);
        self.inner.cache.lock().unwrap().clear();

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("file-save".into())
            .spawn(move || save_thread(inner))
            .expect("spawn save thread");
        *self.inner.save_thread.lock().unwrap() = Some(handle);

        self.inner.events.publish(Event::SaveStatusChanged(SaveStatus::Saving));
        info!("saving started");
        Ok(())
    }

    pub fn stop_saving(&self) -> Result<SaveStatistics, SaveError> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Err(SaveError::NotRunning);
        }
        self.inner.data_ready.notify_all();
        if let Some(handle) = self.inner.save_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        // Drain whatever arrived after the thread noticed the stop.
        while let Some(item) = take_item(&self.inner) {
            process_item(&self.inner, item);
        }

        {
            let mut writer = self.inner.writer.lock().unwrap();
            if writer.is_open() {
                writer.close();
            }
        }

        let stats = {
            let mut stats = self.inner.stats.lock().unwrap();
            if stats.status != SaveStatus::Error {
                stats.status = SaveStatus::Completed;
            }
            stats.clone()
        };

        let params = self.save_parameters();
        if params.save_metadata {
            if let Err(e) = write_metadata(&stats, &params) {
                warn!("failed to write metadata sidecar: {e}");
            }
        }

        self.inner.events.publish(Event::SaveCompleted {
            path: stats.save_path.clone(),
            total_bytes: stats.total_bytes,
        });
        self.inner
            .events
            .publish(Event::SaveStatusChanged(stats.status));
        info!(
            "saving stopped: {} bytes in {} files",
            stats.total_bytes, stats.file_count
        );
        Ok(stats)
    }

    /// Pause or resume the save thread. Returns whether the call changed
    /// anything; repeated identical requests are no-ops.
    pub fn pause_saving(&self, pause: bool) -> bool {
        if !self.is_saving() {
            return false;
        }
        if self.inner.paused.swap(pause, Ordering::AcqRel) == pause {
            return false;
        }

        let status = if pause {
            SaveStatus::Paused
        } else {
            SaveStatus::Saving
        };
        self.inner.stats.lock().unwrap().status = status;
        if !pause {
            self.inner.data_ready.notify_all();
        }
        self.inner.events.publish(Event::SaveStatusChanged(status));
        true
    }

    /// Most recently written blob, for preview surfaces.
    pub fn recent_data(&self) -> Option<Arc<[u8]>> {
        self.inner.cache.lock().unwrap().latest()
    }

    // ---- offline read-back ------------------------------------------------

    pub fn start_loading(&self, path: &Path) -> Result<(), SaveError> {
        self.stop_loading();

        let file = File::open(path)?;
        let total_bytes = file.metadata()?.len();

        self.inner.loader.loading.store(true, Ordering::Release);
        *self.inner.loader.file_path.lock().unwrap() = Some(path.to_path_buf());
        *self.inner.loader.seek_target.lock().unwrap() = None;

        self.inner.events.publish(Event::LoadStarted {
            path: path.to_path_buf(),
            total_bytes,
        });

        let inner = Arc::clone(&self.inner);
        let path = path.to_path_buf();
        let handle = std::thread::Builder::new()
            .name("file-loader".into())
            .spawn(move || loader_thread(inner, file, path, total_bytes))
            .expect("spawn loader thread");
        *self.inner.loader.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop_loading(&self) {
        self.inner.loader.loading.store(false, Ordering::Release);
        if let Some(handle) = self.inner.loader.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.inner.loader.queue.lock().unwrap().clear();
        *self.inner.loader.file_path.lock().unwrap() = None;
    }

    pub fn is_loading(&self) -> bool {
        self.inner.loader.loading.load(Ordering::Acquire)
    }

    pub fn current_load_file(&self) -> Option<PathBuf> {
        self.inner.loader.file_path.lock().unwrap().clone()
    }

    pub fn has_more_packets(&self) -> bool {
        !self.inner.loader.queue.lock().unwrap().is_empty() || self.is_loading()
    }

    pub fn next_packet(&self) -> Option<DataPacket> {
        self.inner.loader.queue.lock().unwrap().pop_front()
    }

    /// Re-align the loader to `position`; queued packets are discarded.
    pub fn seek_to(&self, position: u64) {
        *self.inner.loader.seek_target.lock().unwrap() = Some(position);
        self.inner.loader.queue.lock().unwrap().clear();
    }

    /// Synchronous random-range read. `size` is clamped to the file end.
    pub fn read_range(path: &Path, offset: u64, size: usize) -> Result<Vec<u8>, SaveError> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok(Vec::new());
        }
        let clamped = size.min((len - offset) as usize);
        file.seek(SeekFrom::Start(offset))?;
        let mut out = vec![0u8; clamped];
        file.read_exact(&mut out)?;
        Ok(out)
    }

    /// Asynchronous range read; at most one request may be in flight.
    pub fn read_range_async(
        &self,
        path: &Path,
        offset: u64,
        size: usize,
        request_id: u64,
    ) -> Result<(), SaveError> {
        if self.inner.read_in_flight.swap(true, Ordering::AcqRel) {
            return Err(SaveError::ReadInFlight);
        }

        let inner = Arc::clone(&self.inner);
        let path = path.to_path_buf();
        std::thread::Builder::new()
            .name("range-read".into())
            .spawn(move || {
                match Self::read_range(&path, offset, size) {
                    Ok(data) => inner.events.publish(Event::DataReadCompleted {
                        data: data.into(),
                        offset,
                        request_id,
                    }),
                    Err(e) => inner.events.publish(Event::DataReadError {
                        message: e.to_string(),
                        request_id,
                    }),
                }
                inner.read_in_flight.store(false, Ordering::Release);
            })
            .expect("spawn range read thread");
        Ok(())
    }
}

impl Drop for FileManager {
    fn drop(&mut self) {
        if self.is_saving() {
            let _ = self.stop_saving();
        }
        self.stop_loading();
    }
}

impl DataSink for FileManager {
    fn on_packet(&self, packet: &DataPacket) -> anyhow::Result<()> {
        if !self.is_saving() {
            return Ok(());
        }
        // Unit-sized complete batches already arrive through on_batch; the
        // compatibility re-delivery must not be saved twice.
        if packet.is_batch_complete && packet.packets_in_batch == 1 && packet.offset_in_file.is_none()
        {
            return Ok(());
        }
        let mut queues = self.inner.queues.lock().unwrap();
        queues.packets.push_back(packet.clone());
        drop(queues);
        self.inner.data_ready.notify_one();
        Ok(())
    }

    fn on_batch(&self, batch: &DataPacketBatch) -> anyhow::Result<()> {
        if !self.is_saving() {
            return Ok(());
        }
        let mut queues = self.inner.queues.lock().unwrap();
        queues.batches.push_back(batch.clone());
        drop(queues);
        self.inner.data_ready.notify_one();
        Ok(())
    }
}

fn take_item(inner: &ManagerInner) -> Option<SaveItem> {
    let mut queues = inner.queues.lock().unwrap();
    if let Some(batch) = queues.batches.pop_front() {
        return Some(SaveItem::Batch(batch));
    }
    queues.packets.pop_front().map(SaveItem::Packet)
}

fn save_thread(inner: Arc<ManagerInner>) {
    info!("save thread started");

    while inner.running.load(Ordering::Acquire) {
        let item = {
            let queues = inner.queues.lock().unwrap();
            let idle = inner.paused.load(Ordering::Acquire)
                || (queues.batches.is_empty() && queues.packets.is_empty());
            if idle {
                let (queues, _) = inner
                    .data_ready
                    .wait_timeout(queues, SAVE_WAIT_INTERVAL)
                    .unwrap();
                drop(queues);
                None
            } else {
                drop(queues);
                take_item(&inner)
            }
        };

        if !inner.running.load(Ordering::Acquire) {
            break;
        }
        if inner.paused.load(Ordering::Acquire) {
            continue;
        }
        if let Some(item) = item {
            process_item(&inner, item);
        }
    }

    info!("save thread stopped");
}

fn process_item(inner: &ManagerInner, item: SaveItem) {
    let params = inner.params.lock().unwrap().clone();

    let converter = inner.converters.lock().unwrap().get(&params.format).cloned();

    let (blob, extension) = match &item {
        SaveItem::Batch(batch) => {
            let Some(converter) = converter else {
                report_save_error(inner, "no converter registered for the selected format");
                return;
            };
            match converter.convert_batch(batch, &params) {
                Ok(blob) => (blob, converter.file_extension()),
                Err(e) => {
                    report_save_error(inner, &format!("conversion failed: {e}"));
                    return;
                }
            }
        }
        SaveItem::Packet(packet) => {
            // RAW single packets bypass the converter entirely; the
            // extension is forced to .raw regardless of the naming rule.
            if params.format == FileFormat::Raw {
                (packet.data.to_vec(), "raw")
            } else {
                let Some(converter) = converter else {
                    report_save_error(inner, "no converter registered for the selected format");
                    return;
                };
                match converter.convert(packet, &params) {
                    Ok(blob) => (blob, converter.file_extension()),
                    Err(e) => {
                        report_save_error(inner, &format!("conversion failed: {e}"));
                        return;
                    }
                }
            }
        }
    };

    if let Err(message) = write_blob(inner, &params, &blob, extension) {
        report_save_error(inner, &message);
        {
            let mut writer = inner.writer.lock().unwrap();
            if writer.is_open() {
                writer.close();
            }
        }
        // One failed file must not collapse the pipeline.
        std::thread::sleep(WRITE_ERROR_BACKOFF);
        return;
    }

    inner.cache.lock().unwrap().add(blob.into());
    publish_progress(inner);
}

fn write_blob(
    inner: &ManagerInner,
    params: &SaveParameters,
    blob: &[u8],
    extension: &str,
) -> Result<(), String> {
    let mut writer = inner.writer.lock().unwrap();
    let mut stats = inner.stats.lock().unwrap();

    if should_split(params, &stats, writer.is_open()) {
        if writer.is_open() {
            writer.close();
        }

        let dir = resolve_save_dir(params);
        std::fs::create_dir_all(&dir).map_err(|e| format!("cannot create {}: {e}", dir.display()))?;

        let sequence = stats.file_count + 1;
        let name = build_file_name(params, sequence, extension);
        let path = dir.join(&name);
        if !writer.open(&path) {
            return Err(writer
                .last_error()
                .unwrap_or_else(|| "writer open failed".into()));
        }

        stats.file_count = sequence;
        stats.current_file_bytes = 0;
        stats.current_file_start = Some(Instant::now());
        stats.current_file_name = name;
        info!("writing to {}", path.display());
    }

    if !writer.write(blob) {
        return Err(writer
            .last_error()
            .unwrap_or_else(|| "write failed".into()));
    }

    stats.current_file_bytes += blob.len() as u64;
    stats.total_bytes += blob.len() as u64;
    Ok(())
}

/// Split when no file is open, the size limit is reached, or the per-file
/// duration has elapsed. Parameters and counters are read under the same
/// critical section as the write that follows.
fn should_split(params: &SaveParameters, stats: &SaveStatistics, writer_open: bool) -> bool {
    if !writer_open {
        return true;
    }
    if stats.current_file_bytes >= params.max_file_size() {
        return true;
    }
    let split_secs = params.auto_split_secs();
    if split_secs > 0 {
        if let Some(start) = stats.current_file_start {
            if start.elapsed() >= Duration::from_secs(split_secs) {
                return true;
            }
        }
    }
    false
}

fn report_save_error(inner: &ManagerInner, message: &str) {
    error!("save error: {message}");
    {
        let mut stats = inner.stats.lock().unwrap();
        stats.status = SaveStatus::Error;
        stats.last_error = Some(message.to_string());
    }
    inner.events.publish(Event::SaveError(message.to_string()));
    inner.events.publish(Event::SaveStatusChanged(SaveStatus::Error));
}

fn publish_progress(inner: &ManagerInner) {
    let snapshot = {
        let mut progress = inner.progress.lock().unwrap();
        let elapsed = progress.last_emit.elapsed();
        if elapsed < PROGRESS_INTERVAL {
            return;
        }

        let mut stats = inner.stats.lock().unwrap();
        let delta = stats.total_bytes.saturating_sub(progress.last_total);
        let instant_rate = delta as f64 / elapsed.as_secs_f64() / (1024.0 * 1024.0);
        stats.save_rate_mbps = inner.rate.update(instant_rate);

        progress.last_emit = Instant::now();
        progress.last_total = stats.total_bytes;
        stats.clone()
    };

    inner.events.publish(Event::SaveProgressUpdated(snapshot));
}

fn write_metadata(stats: &SaveStatistics, params: &SaveParameters) -> std::io::Result<()> {
    let metadata = serde_json::json!({
        "timestamp": Local::now().to_rfc3339(),
        "totalBytes": stats.total_bytes,
        "fileCount": stats.file_count,
        "format": params.format.as_int(),
        "options": params.options,
    });
    let path = stats.save_path.join("metadata.json");
    std::fs::write(path, serde_json::to_vec_pretty(&metadata)?)
}

fn loader_thread(inner: Arc<ManagerInner>, mut file: File, path: PathBuf, total_bytes: u64) {
    let mut chunk = vec![0u8; LOAD_CHUNK_SIZE];
    let mut offset = 0u64;
    let mut packet_index = 0u64;
    let mut last_percent = 0u8;

    'outer: while inner.loader.loading.load(Ordering::Acquire) {
        if let Some(target) = inner.loader.seek_target.lock().unwrap().take() {
            inner.loader.queue.lock().unwrap().clear();
            if let Err(e) = file.seek(SeekFrom::Start(target)) {
                inner.events.publish(Event::LoadError(format!("seek failed: {e}")));
                break;
            }
            offset = target;
        }

        let bytes_read = match file.read(&mut chunk) {
            Ok(n) => n,
            Err(e) => {
                inner.events.publish(Event::LoadError(format!("read failed: {e}")));
                break;
            }
        };

        if bytes_read == 0 {
            inner.events.publish(Event::LoadCompleted {
                path: path.clone(),
                total_bytes,
            });
            break;
        }

        for piece in chunk[..bytes_read].chunks(LOAD_PACKET_SIZE) {
            loop {
                if !inner.loader.loading.load(Ordering::Acquire) {
                    break 'outer;
                }
                if inner.loader.queue.lock().unwrap().len() < LOAD_QUEUE_CAP {
                    break;
                }
                std::thread::sleep(LOAD_FULL_BACKOFF);
            }

            let packet = DataPacket::from_file(piece.to_vec().into(), offset, packet_index);
            offset += piece.len() as u64;
            packet_index += 1;
            inner.loader.queue.lock().unwrap().push_back(packet);
        }

        let queued = inner.loader.queue.lock().unwrap().len();
        inner.events.publish(Event::NewDataAvailable {
            queued_packets: queued,
        });

        if total_bytes > 0 {
            let percent = (offset * 100 / total_bytes) as u8;
            if percent >= last_percent + LOAD_PROGRESS_STEP {
                inner.events.publish(Event::LoadProgress {
                    percent,
                    bytes_read: offset,
                });
                last_percent = percent;
            }
        }
    }

    inner.loader.loading.store(false, Ordering::Release);
    info!("loader thread finished at offset {offset}");
}
