//! Cross-component scenarios: ring to processor to sinks, backpressure and
//! the save pipeline, without any USB hardware in the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fx3stream::events::{Event, EventBus};
use fx3stream::file::{FileFormat, FileManager, SaveParameters};
use fx3stream::process::{DataSink, Processor};
use util::packet::{DataPacket, DataPacketBatch};
use util::ring::{OccupancyLevel, RingBuffer, RingConfig};
use util::state::{AppState, StateEvent, StateMachine};

fn commit(ring: &RingBuffer, payload: &[u8]) {
    let mut slot = ring.write_slot();
    slot.buf()[..payload.len()].copy_from_slice(payload);
    ring.commit(slot, payload.len()).unwrap();
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached in time");
}

struct CollectingSink {
    batches: Mutex<Vec<Vec<usize>>>,
}

impl DataSink for CollectingSink {
    fn on_packet(&self, _packet: &DataPacket) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_batch(&self, batch: &DataPacketBatch) -> anyhow::Result<()> {
        self.batches
            .lock()
            .unwrap()
            .push(batch.packets.iter().map(|p| p.size()).collect());
        Ok(())
    }
}

/// Ten 16 KiB reads against the default 8-packet / 50 ms batcher: one full
/// batch immediately, the 2-packet remainder closed by the time trigger.
#[test]
fn batcher_closes_by_count_then_by_time() {
    let ring = Arc::new(RingBuffer::new(RingConfig {
        buffer_count: 64,
        buffer_size: 262144,
        max_packets_per_batch: 8,
        max_batch_interval: Duration::from_millis(50),
        batching: true,
    }));
    let sink = Arc::new(CollectingSink {
        batches: Mutex::new(Vec::new()),
    });
    let stopping = Arc::new(AtomicBool::new(false));
    let events = EventBus::new();

    let handle = Processor {
        ring: Arc::clone(&ring),
        sinks: vec![Arc::clone(&sink) as Arc<dyn DataSink>],
        events: events.clone(),
        stopping: Arc::clone(&stopping),
    }
    .spawn();

    let payload = vec![0x42u8; 16 * 1024];
    for _ in 0..10 {
        commit(&ring, &payload);
    }

    wait_until(|| sink.batches.lock().unwrap().len() == 2);

    stopping.store(true, Ordering::Release);
    ring.notify();
    handle.join().unwrap();
    events.shutdown();

    let batches = sink.batches.lock().unwrap();
    assert_eq!(batches[0].len(), 8);
    assert_eq!(batches[1].len(), 2);
    assert!(batches
        .iter()
        .flatten()
        .all(|&size| size == 16 * 1024));
}

/// With the consumer stalled, the 64-slot ring crosses the 90 % threshold
/// at the 58th commit, and the error edge lands the machine in DeviceError.
#[test]
fn stalled_consumer_reaches_critical_occupancy() {
    let ring = RingBuffer::new(RingConfig {
        buffer_count: 64,
        buffer_size: 1024,
        ..RingConfig::default()
    });

    let payload = [1u8; 64];
    for _ in 0..57 {
        commit(&ring, &payload);
    }
    assert_ne!(ring.occupancy_level(), OccupancyLevel::Critical);

    commit(&ring, &payload);
    assert_eq!(ring.pending_packets(), 58);
    assert_eq!(ring.occupancy_level(), OccupancyLevel::Critical);

    // The producer escalates this as an error stop.
    let machine = StateMachine::new(AppState::Transferring);
    machine.dispatch(StateEvent::ErrorOccurred, "buffer overflow");
    assert_eq!(machine.current(), AppState::DeviceError);
}

/// Full data path: ring commits flow through the processor into the file
/// manager and the RAW file is byte-identical to the committed payload.
#[test]
fn raw_bytes_roundtrip_through_the_whole_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let events = EventBus::new();

    let manager = FileManager::new(events.clone());
    manager.set_save_parameters(SaveParameters {
        base_path: dir.path().to_path_buf(),
        format: FileFormat::Raw,
        append_timestamp: false,
        create_subfolder: false,
        ..SaveParameters::default()
    });
    manager.start_saving().unwrap();

    let ring = Arc::new(RingBuffer::new(RingConfig {
        buffer_count: 16,
        buffer_size: 4096,
        max_packets_per_batch: 4,
        max_batch_interval: Duration::from_millis(20),
        batching: true,
    }));
    let stopping = Arc::new(AtomicBool::new(false));
    let handle = Processor {
        ring: Arc::clone(&ring),
        sinks: vec![Arc::clone(&manager) as Arc<dyn DataSink>],
        events: events.clone(),
        stopping: Arc::clone(&stopping),
    }
    .spawn();

    let mut expected = Vec::new();
    for i in 0..8u8 {
        let payload = vec![i; 1000];
        expected.extend_from_slice(&payload);
        commit(&ring, &payload);
    }

    wait_until(|| manager.statistics().total_bytes == expected.len() as u64);

    stopping.store(true, Ordering::Release);
    ring.notify();
    handle.join().unwrap();

    let stats = manager.stop_saving().unwrap();
    assert_eq!(stats.total_bytes, expected.len() as u64);

    let mut written: Vec<(String, Vec<u8>)> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| {
            let entry = entry.unwrap();
            let name = entry.file_name().into_string().unwrap();
            name.ends_with(".raw")
                .then(|| (name, std::fs::read(entry.path()).unwrap()))
        })
        .collect();
    written.sort_by(|a, b| a.0.cmp(&b.0));
    let recovered: Vec<u8> = written.into_iter().flat_map(|(_, bytes)| bytes).collect();
    assert_eq!(recovered, expected);

    events.shutdown();
}

/// 2.5 MiB across a 1 MiB split limit: exactly three sequence-numbered
/// files whose sizes sum to 2,621,440 bytes.
#[test]
fn size_split_produces_three_sequenced_files() {
    let dir = tempfile::tempdir().unwrap();
    let events = EventBus::new();

    let manager = FileManager::new(events.clone());
    let mut params = SaveParameters {
        base_path: dir.path().to_path_buf(),
        format: FileFormat::Raw,
        file_prefix: "capture".into(),
        append_timestamp: false,
        create_subfolder: false,
        ..SaveParameters::default()
    };
    params
        .options
        .insert("max_file_size".into(), serde_json::json!(1024 * 1024));
    manager.set_save_parameters(params);
    manager.start_saving().unwrap();

    // 10 batches of 256 KiB.
    let chunk = 262144usize;
    for id in 1..=10u32 {
        let packet = DataPacket::new(vec![id as u8; chunk].into_boxed_slice().into(), id, 1);
        manager
            .on_batch(&DataPacketBatch {
                batch_id: id,
                packets: vec![packet],
            })
            .unwrap();
    }

    wait_until(|| manager.statistics().total_bytes == 10 * chunk as u64);
    let stats = manager.stop_saving().unwrap();
    assert_eq!(stats.file_count, 3);

    let mut total = 0u64;
    for sequence in 1..=3u32 {
        let path = dir.path().join(format!("capture_{sequence:06}.raw"));
        assert!(path.exists(), "missing {}", path.display());
        total += std::fs::metadata(path).unwrap().len();
    }
    assert_eq!(total, 2_621_440);

    events.shutdown();
}

/// Random payload sizes and contents survive the RAW save path unchanged.
#[test]
fn random_payloads_roundtrip_through_save() {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    let dir = tempfile::tempdir().unwrap();
    let events = EventBus::new();

    let manager = FileManager::new(events.clone());
    manager.set_save_parameters(SaveParameters {
        base_path: dir.path().to_path_buf(),
        format: FileFormat::Raw,
        file_prefix: "rand".into(),
        append_timestamp: false,
        ..SaveParameters::default()
    });
    manager.start_saving().unwrap();

    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let mut expected = Vec::new();
    for id in 1..=20u32 {
        let len = rng.gen_range(1..=4096);
        let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        expected.extend_from_slice(&payload);
        manager
            .on_batch(&DataPacketBatch {
                batch_id: id,
                packets: vec![DataPacket::new(payload.into_boxed_slice().into(), id, 1)],
            })
            .unwrap();
    }

    wait_until(|| manager.statistics().total_bytes == expected.len() as u64);
    let stats = manager.stop_saving().unwrap();
    assert_eq!(stats.file_count, 1);

    let written = std::fs::read(dir.path().join("rand_000001.raw")).unwrap();
    assert_eq!(written, expected);
    events.shutdown();
}

/// After the stop flag is honored no further data events are published.
#[test]
fn stopped_pipeline_goes_silent() {
    let ring = Arc::new(RingBuffer::new(RingConfig {
        buffer_count: 8,
        buffer_size: 256,
        max_packets_per_batch: 1,
        ..RingConfig::default()
    }));
    let stopping = Arc::new(AtomicBool::new(false));
    let events = EventBus::new();

    let delivered = Arc::new(Mutex::new(0usize));
    {
        let delivered = Arc::clone(&delivered);
        events.subscribe(Arc::new(move |event| {
            if matches!(event, Event::BatchDataReceived(_) | Event::DataReceived(_)) {
                *delivered.lock().unwrap() += 1;
            }
        }));
    }

    let handle = Processor {
        ring: Arc::clone(&ring),
        sinks: Vec::new(),
        events: events.clone(),
        stopping: Arc::clone(&stopping),
    }
    .spawn();

    commit(&ring, &[9u8; 16]);
    wait_until(|| *delivered.lock().unwrap() > 0);

    stopping.store(true, Ordering::Release);
    ring.notify();
    handle.join().unwrap();

    let before = *delivered.lock().unwrap();
    commit(&ring, &[9u8; 16]);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(*delivered.lock().unwrap(), before);

    events.shutdown();
}
