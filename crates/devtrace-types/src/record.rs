//! Fixed-size record layouts.
//!
//! Every trace category stores back-to-back records of one constant size.
//! Layouts are little-endian:
//!
//! HWTS log entry (64 bytes):
//! - `[0]`      mode byte, low 3 bits = log type (0 start, 1 end)
//! - `[1]`      flags, bit 0 = AI-core task
//! - `[2..4]`   sequence counter
//! - `[4..6]`   stream id
//! - `[6..8]`   task id
//! - `[8..16]`  syscnt (device clock ticks)
//! - `[16..18]` batch id
//! - `[18..20]` core id
//! - `[20..64]` reserved
//!
//! AI-core PMU sample (128 bytes):
//! - `[0]`      kind tag
//! - `[2..4]`   stream id
//! - `[4..6]`   task id
//! - `[8..16]`  total cycles
//! - `[16..24]` start ticks
//! - `[24..88]` eight PMU event counters
//! - `[88..128]` reserved

use devtrace_error::{Result, TraceError};
use serde::{Deserialize, Serialize};

use crate::task::{RecordKind, TaskKey, TaskRecord};

/// Size of one HWTS log entry on disk.
pub const HWTS_RECORD_SIZE: usize = 64;
/// Size of one AI-core PMU sample on disk.
pub const AIC_PMU_RECORD_SIZE: usize = 128;
/// Number of PMU event counters carried per AI-core sample.
pub const PMU_EVENT_COUNT: usize = 8;

const HWTS_AI_CORE_FLAG: u8 = 0x01;

/// Decode contract for a fixed-size trace record.
pub trait FixedRecord: Sized {
    /// Exact on-disk size of one record.
    const SIZE: usize;
    /// Category tag used in slice file names and log fields.
    const CATEGORY: &'static str;

    /// Decode one record from exactly [`Self::SIZE`] bytes.
    fn decode(bytes: &[u8]) -> Result<Self>;

    /// Task identity carried by the record.
    fn task_key(&self) -> TaskKey;
}

/// Decode a record-aligned buffer into records.
///
/// The buffer must be a whole number of records; aligned readers guarantee
/// this, so a remainder means the caller mixed categories.
pub fn decode_records<R: FixedRecord>(bytes: &[u8]) -> Result<Vec<R>> {
    if bytes.len() % R::SIZE != 0 {
        return Err(TraceError::RecordDecode {
            category: R::CATEGORY,
            detail: format!(
                "buffer of {} bytes is not a multiple of record size {}",
                bytes.len(),
                R::SIZE
            ),
        });
    }
    bytes.chunks_exact(R::SIZE).map(R::decode).collect()
}

impl FixedRecord for TaskRecord {
    const SIZE: usize = HWTS_RECORD_SIZE;
    const CATEGORY: &'static str = "hwts";

    fn decode(bytes: &[u8]) -> Result<Self> {
        check_len::<Self>(bytes)?;
        Ok(Self {
            kind: RecordKind::from_mode_byte(bytes[0]),
            ai_core: bytes[1] & HWTS_AI_CORE_FLAG != 0,
            counter: read_u16_at(bytes, 2),
            stream_id: u32::from(read_u16_at(bytes, 4)),
            task_id: u32::from(read_u16_at(bytes, 6)),
            timestamp: read_i64_at(bytes, 8),
            batch_id: read_u16_at(bytes, 16),
            core_id: read_u16_at(bytes, 18),
        })
    }

    fn task_key(&self) -> TaskKey {
        self.key()
    }
}

impl TaskRecord {
    /// Encode into the on-disk layout.
    ///
    /// Stream and task ids are stored as 16-bit fields; larger values are
    /// rejected.
    pub fn encode(&self) -> Result<[u8; HWTS_RECORD_SIZE]> {
        let stream_id = narrow_id(self.stream_id, "stream_id")?;
        let task_id = narrow_id(self.task_id, "task_id")?;
        let mut out = [0_u8; HWTS_RECORD_SIZE];
        out[0] = self.kind.to_mode_bits();
        out[1] = if self.ai_core { HWTS_AI_CORE_FLAG } else { 0 };
        out[2..4].copy_from_slice(&self.counter.to_le_bytes());
        out[4..6].copy_from_slice(&stream_id.to_le_bytes());
        out[6..8].copy_from_slice(&task_id.to_le_bytes());
        out[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        out[16..18].copy_from_slice(&self.batch_id.to_le_bytes());
        out[18..20].copy_from_slice(&self.core_id.to_le_bytes());
        Ok(out)
    }
}

/// One decoded AI-core PMU sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AicPmuRecord {
    pub tag: u8,
    pub stream_id: u32,
    pub task_id: u32,
    pub total_cycles: u64,
    pub start_ticks: i64,
    pub events: [u64; PMU_EVENT_COUNT],
}

impl FixedRecord for AicPmuRecord {
    const SIZE: usize = AIC_PMU_RECORD_SIZE;
    const CATEGORY: &'static str = "aicore";

    fn decode(bytes: &[u8]) -> Result<Self> {
        check_len::<Self>(bytes)?;
        let mut events = [0_u64; PMU_EVENT_COUNT];
        for (index, event) in events.iter_mut().enumerate() {
            *event = read_u64_at(bytes, 24 + index * 8);
        }
        Ok(Self {
            tag: bytes[0],
            stream_id: u32::from(read_u16_at(bytes, 2)),
            task_id: u32::from(read_u16_at(bytes, 4)),
            total_cycles: read_u64_at(bytes, 8),
            start_ticks: read_i64_at(bytes, 16),
            events,
        })
    }

    fn task_key(&self) -> TaskKey {
        TaskKey::new(self.stream_id, self.task_id)
    }
}

impl AicPmuRecord {
    /// Encode into the on-disk layout.
    pub fn encode(&self) -> Result<[u8; AIC_PMU_RECORD_SIZE]> {
        let stream_id = narrow_id(self.stream_id, "stream_id")?;
        let task_id = narrow_id(self.task_id, "task_id")?;
        let mut out = [0_u8; AIC_PMU_RECORD_SIZE];
        out[0] = self.tag;
        out[2..4].copy_from_slice(&stream_id.to_le_bytes());
        out[4..6].copy_from_slice(&task_id.to_le_bytes());
        out[8..16].copy_from_slice(&self.total_cycles.to_le_bytes());
        out[16..24].copy_from_slice(&self.start_ticks.to_le_bytes());
        for (index, event) in self.events.iter().enumerate() {
            let start = 24 + index * 8;
            out[start..start + 8].copy_from_slice(&event.to_le_bytes());
        }
        Ok(out)
    }
}

fn check_len<R: FixedRecord>(bytes: &[u8]) -> Result<()> {
    if bytes.len() == R::SIZE {
        Ok(())
    } else {
        Err(TraceError::RecordDecode {
            category: R::CATEGORY,
            detail: format!("expected {} bytes, got {}", R::SIZE, bytes.len()),
        })
    }
}

fn narrow_id(value: u32, field: &str) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| TraceError::invalid_argument(format!("{field} {value} does not fit in u16")))
}

// Callers have already checked the slice length against the record size.
fn read_u16_at(bytes: &[u8], start: usize) -> u16 {
    u16::from_le_bytes([bytes[start], bytes[start + 1]])
}

fn read_u64_at(bytes: &[u8], start: usize) -> u64 {
    let mut array = [0_u8; 8];
    array.copy_from_slice(&bytes[start..start + 8]);
    u64::from_le_bytes(array)
}

fn read_i64_at(bytes: &[u8], start: usize) -> i64 {
    let mut array = [0_u8; 8];
    array.copy_from_slice(&bytes[start..start + 8]);
    i64::from_le_bytes(array)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn sample_task(kind: RecordKind) -> TaskRecord {
        TaskRecord {
            kind,
            ai_core: true,
            counter: 513,
            stream_id: 3,
            task_id: 7,
            timestamp: 1_700_000_123,
            batch_id: 2,
            core_id: 11,
        }
    }

    #[test]
    fn test_hwts_layout_offsets() {
        let bytes = sample_task(RecordKind::End).encode().expect("encode");
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], HWTS_AI_CORE_FLAG);
        assert_eq!(&bytes[4..6], &3_u16.to_le_bytes());
        assert_eq!(&bytes[6..8], &7_u16.to_le_bytes());
        assert_eq!(&bytes[8..16], &1_700_000_123_i64.to_le_bytes());
        assert!(bytes[20..].iter().all(|b| *b == 0), "reserved bytes stay zero");
    }

    #[test]
    fn test_hwts_decode_ignores_high_mode_bits() {
        let mut bytes = sample_task(RecordKind::Start).encode().expect("encode");
        bytes[0] |= 0xF8;
        let decoded = TaskRecord::decode(&bytes).expect("decode");
        assert_eq!(decoded.kind, RecordKind::Start);
        assert_eq!(decoded.key(), TaskKey::new(3, 7));
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let err = TaskRecord::decode(&[0_u8; 63]).expect_err("short buffer");
        assert!(err.to_string().contains("expected 64 bytes, got 63"));
        let err = AicPmuRecord::decode(&[0_u8; 64]).expect_err("short buffer");
        assert!(err.to_string().contains("aicore"));
    }

    #[test]
    fn test_encode_rejects_wide_ids() {
        let mut record = sample_task(RecordKind::Start);
        record.task_id = 70_000;
        assert!(record.encode().is_err());
    }

    #[test]
    fn test_decode_records_requires_whole_records() {
        let one = sample_task(RecordKind::Start).encode().expect("encode");
        let mut buf = one.to_vec();
        buf.extend_from_slice(&one);
        assert_eq!(decode_records::<TaskRecord>(&buf).expect("decode").len(), 2);
        buf.push(0);
        assert!(decode_records::<TaskRecord>(&buf).is_err());
        assert!(decode_records::<TaskRecord>(&[]).expect("empty").is_empty());
    }

    #[test]
    fn test_aic_pmu_events_layout() {
        let record = AicPmuRecord {
            tag: 0x2A,
            stream_id: 5,
            task_id: 9,
            total_cycles: 12_345,
            start_ticks: -4,
            events: [1, 2, 3, 4, 5, 6, 7, 8],
        };
        let bytes = record.encode().expect("encode");
        assert_eq!(&bytes[24 + 7 * 8..24 + 8 * 8], &8_u64.to_le_bytes());
        let decoded = AicPmuRecord::decode(&bytes).expect("decode");
        assert_eq!(decoded, record);
        assert_eq!(decoded.task_key(), TaskKey::new(5, 9));
    }

    proptest! {
        #[test]
        fn prop_hwts_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), HWTS_RECORD_SIZE)) {
            let decoded = TaskRecord::decode(&bytes).expect("exact-size buffers always decode");
            prop_assert!(decoded.stream_id <= u32::from(u16::MAX));
            prop_assert!(decoded.task_id <= u32::from(u16::MAX));
        }
    }
}
