use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// One committed read result from the bulk-in endpoint.
///
/// The payload is shared, immutable and reference counted so that several
/// sinks can consume the same packet without copying it.
#[derive(Clone, Debug)]
pub struct DataPacket {
    pub data: Arc<[u8]>,
    /// Nanoseconds since the unix epoch, taken at commit time.
    pub timestamp: u64,
    pub batch_id: u32,
    /// 1-based position within the batch this packet belongs to.
    pub packets_in_batch: u32,
    /// Set only on the final packet of a completed batch.
    pub is_batch_complete: bool,
    /// Byte offset of this packet in its source file. Offline read-back only.
    pub offset_in_file: Option<u64>,
    /// Sequential index assigned by the offline loader.
    pub packet_index: Option<u64>,
}

impl DataPacket {
    pub fn new(data: Arc<[u8]>, batch_id: u32, packets_in_batch: u32) -> Self {
        DataPacket {
            data,
            timestamp: epoch_nanos(),
            batch_id,
            packets_in_batch,
            is_batch_complete: false,
            offset_in_file: None,
            packet_index: None,
        }
    }

    /// Packet loaded back from a file rather than committed by the ring.
    pub fn from_file(data: Arc<[u8]>, offset_in_file: u64, packet_index: u64) -> Self {
        DataPacket {
            data,
            timestamp: epoch_nanos(),
            batch_id: 0,
            packets_in_batch: 1,
            is_batch_complete: true,
            offset_in_file: Some(offset_in_file),
            packet_index: Some(packet_index),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

pub fn epoch_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Ordered packets sharing one batch id, closed by a size or time trigger.
#[derive(Clone, Debug)]
pub struct DataPacketBatch {
    pub batch_id: u32,
    pub packets: Vec<DataPacket>,
}

impl DataPacketBatch {
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.packets.iter().map(DataPacket::size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_reports_payload_size() {
        let packet = DataPacket::new(Arc::from(vec![0u8; 42].into_boxed_slice()), 1, 1);
        assert_eq!(packet.size(), 42);
        assert!(!packet.is_batch_complete);
        assert!(packet.offset_in_file.is_none());
    }

    #[test]
    fn file_packet_carries_origin() {
        let packet = DataPacket::from_file(Arc::from(vec![1u8; 8].into_boxed_slice()), 4096, 7);
        assert_eq!(packet.offset_in_file, Some(4096));
        assert_eq!(packet.packet_index, Some(7));
        assert!(packet.is_batch_complete);
    }

    #[test]
    fn batch_sums_bytes() {
        let batch = DataPacketBatch {
            batch_id: 3,
            packets: vec![
                DataPacket::new(Arc::from(vec![0u8; 10].into_boxed_slice()), 3, 1),
                DataPacket::new(Arc::from(vec![0u8; 22].into_boxed_slice()), 3, 2),
            ],
        };
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.total_bytes(), 32);
    }
}
