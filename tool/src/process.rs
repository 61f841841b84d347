use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info};
use util::packet::{DataPacket, DataPacketBatch};
use util::ring::{ReadyData, RingBuffer};

use crate::acquire::STOP_CHECK_INTERVAL_MS;
use crate::events::{Event, EventBus};

/// Consumer capability fed by the processor. Implementations must be cheap
/// to call; heavy work belongs behind the sink's own queue.
pub trait DataSink: Send + Sync {
    fn on_packet(&self, packet: &DataPacket) -> anyhow::Result<()>;

    fn on_batch(&self, batch: &DataPacketBatch) -> anyhow::Result<()> {
        for packet in &batch.packets {
            self.on_packet(packet)?;
        }
        Ok(())
    }
}

/// Consumer side of the pipeline: drains the ring and fans data out to the
/// registered sinks, preferring closed batches over loose packets.
pub struct Processor {
    pub ring: Arc<RingBuffer>,
    pub sinks: Vec<Arc<dyn DataSink>>,
    pub events: EventBus,
    pub stopping: Arc<AtomicBool>,
}

impl Processor {
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("processor".into())
            .spawn(move || {
                self.run();
                info!("processing thread stopped");
            })
            .expect("spawn processor thread")
    }

    fn run(&self) {
        info!("processing thread started");
        let wait = Duration::from_millis(STOP_CHECK_INTERVAL_MS);

        loop {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            match self.ring.wait_ready(wait) {
                Some(ReadyData::Batch(batch)) => self.deliver_batch(&batch),
                Some(ReadyData::Packet(packet)) => self.deliver_packet(&packet),
                None => {}
            }
        }
    }

    fn deliver_batch(&self, batch: &DataPacketBatch) {
        if batch.is_empty() {
            // The ring never closes an empty batch.
            error!("empty batch popped from ring");
            return;
        }

        for sink in &self.sinks {
            if let Err(e) = sink.on_batch(batch) {
                error!("batch sink failed: {e:#}");
                self.events
                    .publish(Event::AcquisitionError(format!("batch processing error: {e:#}")));
            }
        }

        // Backward compatibility contract: a unit-sized batch is also
        // delivered through the single-packet path.
        if batch.len() == 1 {
            let packet = &batch.packets[0];
            for sink in &self.sinks {
                if let Err(e) = sink.on_packet(packet) {
                    error!("packet sink failed: {e:#}");
                    self.events
                        .publish(Event::AcquisitionError(format!("data processing error: {e:#}")));
                }
            }
            self.events.publish(Event::DataReceived(packet.clone()));
        }

        self.events.publish(Event::BatchDataReceived(batch.clone()));
    }

    fn deliver_packet(&self, packet: &DataPacket) {
        for sink in &self.sinks {
            if let Err(e) = sink.on_packet(packet) {
                error!("packet sink failed: {e:#}");
                self.events
                    .publish(Event::AcquisitionError(format!("data processing error: {e:#}")));
            }
        }
        self.events.publish(Event::DataReceived(packet.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use util::ring::{RingBuffer, RingConfig};

    struct Recorder {
        batches: Mutex<Vec<usize>>,
        packets: Mutex<Vec<usize>>,
    }

    impl DataSink for Recorder {
        fn on_packet(&self, packet: &DataPacket) -> anyhow::Result<()> {
            self.packets.lock().unwrap().push(packet.size());
            Ok(())
        }

        fn on_batch(&self, batch: &DataPacketBatch) -> anyhow::Result<()> {
            self.batches.lock().unwrap().push(batch.len());
            Ok(())
        }
    }

    fn commit(ring: &RingBuffer, byte: u8, len: usize) {
        let mut slot = ring.write_slot();
        slot.buf()[..len].fill(byte);
        ring.commit(slot, len).unwrap();
    }

    #[test]
    fn prefers_batches_and_keeps_unit_batch_compat() {
        let ring = Arc::new(RingBuffer::new(RingConfig {
            buffer_count: 16,
            buffer_size: 64,
            max_packets_per_batch: 2,
            max_batch_interval: Duration::from_secs(10),
            batching: true,
        }));
        let sink = Arc::new(Recorder {
            batches: Mutex::new(Vec::new()),
            packets: Mutex::new(Vec::new()),
        });
        let stopping = Arc::new(AtomicBool::new(false));
        let events = EventBus::new();

        let processor = Processor {
            ring: Arc::clone(&ring),
            sinks: vec![Arc::clone(&sink) as Arc<dyn DataSink>],
            events: events.clone(),
            stopping: Arc::clone(&stopping),
        };
        let handle = processor.spawn();

        commit(&ring, 1, 8);
        commit(&ring, 2, 8);

        for _ in 0..100 {
            if !sink.batches.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        stopping.store(true, Ordering::Release);
        ring.notify();
        handle.join().unwrap();
        events.shutdown();

        assert_eq!(*sink.batches.lock().unwrap(), vec![2]);
        // Two-packet batch: no single-packet compatibility delivery.
        assert!(sink.packets.lock().unwrap().is_empty());
    }

    #[test]
    fn sink_failure_does_not_kill_the_loop() {
        struct Failing;
        impl DataSink for Failing {
            fn on_packet(&self, _: &DataPacket) -> anyhow::Result<()> {
                anyhow::bail!("disk full")
            }
        }

        let ring = Arc::new(RingBuffer::new(RingConfig {
            buffer_count: 8,
            buffer_size: 16,
            max_packets_per_batch: 1,
            max_batch_interval: Duration::from_secs(10),
            batching: true,
        }));
        let stopping = Arc::new(AtomicBool::new(false));
        let events = EventBus::new();

        let processor = Processor {
            ring: Arc::clone(&ring),
            sinks: vec![Arc::new(Failing) as Arc<dyn DataSink>],
            events: events.clone(),
            stopping: Arc::clone(&stopping),
        };
        let handle = processor.spawn();

        commit(&ring, 3, 4);
        commit(&ring, 4, 4);
        std::thread::sleep(Duration::from_millis(50));

        // The loop must still be alive and draining.
        assert_eq!(ring.pending_packets(), 0);

        stopping.store(true, Ordering::Release);
        ring.notify();
        handle.join().unwrap();
        events.shutdown();
    }
}
