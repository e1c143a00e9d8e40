//! Log record payloads: prepares, commits, and system records.

use bytes::Bytes;

use crate::core::{EventId, EventNumber, StreamId};

use super::{LogError, LogResult};

const KIND_PREPARE: u8 = 0;
const KIND_COMMIT: u8 = 1;
const KIND_SYSTEM: u8 = 2;

/// Flags carried by a prepare record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrepareFlags(u16);

impl PrepareFlags {
    /// The prepare carries event data.
    pub const DATA: PrepareFlags = PrepareFlags(1 << 0);
    /// First prepare of its transaction.
    pub const TRANSACTION_BEGIN: PrepareFlags = PrepareFlags(1 << 1);
    /// Last prepare of its transaction.
    pub const TRANSACTION_END: PrepareFlags = PrepareFlags(1 << 2);
    /// The prepare is its own commit (single-event append).
    pub const IMPLICIT_COMMIT: PrepareFlags = PrepareFlags(1 << 3);
    /// Event data is JSON.
    pub const IS_JSON: PrepareFlags = PrepareFlags(1 << 4);
    /// Hard-delete tombstone.
    pub const TOMBSTONE: PrepareFlags = PrepareFlags(1 << 5);

    const ALL: u16 = 0b11_1111;

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> LogResult<Self> {
        if bits & !Self::ALL != 0 {
            return Err(LogError::RecordInvalid {
                reason: format!("unknown prepare flag bits {bits:#x}"),
            });
        }
        Ok(Self(bits))
    }

    pub fn contains(self, other: PrepareFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn with(self, other: PrepareFlags) -> Self {
        Self(self.0 | other.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrepareLog {
    pub flags: PrepareFlags,
    /// Position of the first prepare in the transaction.
    pub transaction_position: i64,
    /// Index of this prepare within its transaction.
    pub transaction_offset: i32,
    pub stream: StreamId,
    pub event_number: EventNumber,
    pub event_id: EventId,
    pub event_type: String,
    pub created_ms: u64,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl PrepareLog {
    pub fn is_implicit_commit(&self) -> bool {
        self.flags.contains(PrepareFlags::IMPLICIT_COMMIT)
    }

    pub fn is_transaction_end(&self) -> bool {
        self.flags.contains(PrepareFlags::TRANSACTION_END)
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags.contains(PrepareFlags::TOMBSTONE)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitLog {
    /// Position of the first prepare of the committed transaction.
    pub transaction_position: i64,
    pub first_event_number: EventNumber,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemRecordKind {
    Epoch = 0,
}

impl SystemRecordKind {
    fn from_u8(raw: u8) -> LogResult<Self> {
        match raw {
            0 => Ok(SystemRecordKind::Epoch),
            other => Err(LogError::RecordInvalid {
                reason: format!("unknown system record kind {other}"),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemLog {
    pub kind: SystemRecordKind,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogRecord {
    Prepare(PrepareLog),
    Commit(CommitLog),
    System(SystemLog),
}

impl LogRecord {
    pub fn encode(&self) -> LogResult<Vec<u8>> {
        match self {
            LogRecord::Prepare(prepare) => encode_prepare(prepare),
            LogRecord::Commit(commit) => Ok(encode_commit(commit)),
            LogRecord::System(system) => Ok(encode_system(system)),
        }
    }

    pub fn decode(bytes: &[u8]) -> LogResult<LogRecord> {
        let mut offset = 0usize;
        let kind = read_u8(bytes, &mut offset)?;
        match kind {
            KIND_PREPARE => decode_prepare(bytes, offset).map(LogRecord::Prepare),
            KIND_COMMIT => decode_commit(bytes, offset).map(LogRecord::Commit),
            KIND_SYSTEM => decode_system(bytes, offset).map(LogRecord::System),
            other => Err(LogError::RecordInvalid {
                reason: format!("unknown record kind {other}"),
            }),
        }
    }
}

fn encode_prepare(prepare: &PrepareLog) -> LogResult<Vec<u8>> {
    let stream_bytes = prepare.stream.as_str().as_bytes();
    let type_bytes = prepare.event_type.as_bytes();
    if stream_bytes.len() > u16::MAX as usize {
        return Err(LogError::RecordInvalid {
            reason: "stream id too long for prepare".to_string(),
        });
    }
    if type_bytes.len() > u16::MAX as usize {
        return Err(LogError::RecordInvalid {
            reason: "event type too long for prepare".to_string(),
        });
    }

    let mut buf = Vec::with_capacity(
        1 + 2 + 8 + 4 + 8 + 16 + 8 + 2 + stream_bytes.len() + 2 + type_bytes.len() + 4
            + prepare.data.len()
            + 4
            + prepare.metadata.len(),
    );
    buf.push(KIND_PREPARE);
    buf.extend_from_slice(&prepare.flags.bits().to_le_bytes());
    buf.extend_from_slice(&prepare.transaction_position.to_le_bytes());
    buf.extend_from_slice(&prepare.transaction_offset.to_le_bytes());
    buf.extend_from_slice(&prepare.event_number.get().to_le_bytes());
    buf.extend_from_slice(prepare.event_id.as_uuid().as_bytes());
    buf.extend_from_slice(&prepare.created_ms.to_le_bytes());
    buf.extend_from_slice(&(stream_bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(stream_bytes);
    buf.extend_from_slice(&(type_bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(type_bytes);
    buf.extend_from_slice(&(prepare.data.len() as u32).to_le_bytes());
    buf.extend_from_slice(&prepare.data);
    buf.extend_from_slice(&(prepare.metadata.len() as u32).to_le_bytes());
    buf.extend_from_slice(&prepare.metadata);
    Ok(buf)
}

fn decode_prepare(bytes: &[u8], mut offset: usize) -> LogResult<PrepareLog> {
    let flags = PrepareFlags::from_bits(read_u16(bytes, &mut offset)?)?;
    let transaction_position = read_i64(bytes, &mut offset)?;
    let transaction_offset = read_i32(bytes, &mut offset)?;
    let event_number_raw = read_i64(bytes, &mut offset)?;
    let event_number = EventNumber::new(event_number_raw).ok_or_else(|| {
        LogError::RecordInvalid {
            reason: format!("negative event number {event_number_raw}"),
        }
    })?;
    let event_id = EventId::new(uuid::Uuid::from_bytes(read_array::<16>(bytes, &mut offset)?));
    let created_ms = read_u64(bytes, &mut offset)?;

    let stream_len = read_u16(bytes, &mut offset)? as usize;
    let stream_raw = take(bytes, &mut offset, stream_len)?;
    let stream_str = std::str::from_utf8(stream_raw).map_err(|_| LogError::RecordInvalid {
        reason: "stream id not utf-8".to_string(),
    })?;
    let stream = StreamId::parse(stream_str).map_err(|err| LogError::RecordInvalid {
        reason: err.to_string(),
    })?;

    let type_len = read_u16(bytes, &mut offset)? as usize;
    let type_raw = take(bytes, &mut offset, type_len)?;
    let event_type = std::str::from_utf8(type_raw)
        .map_err(|_| LogError::RecordInvalid {
            reason: "event type not utf-8".to_string(),
        })?
        .to_string();

    let data_len = read_u32(bytes, &mut offset)? as usize;
    let data = Bytes::copy_from_slice(take(bytes, &mut offset, data_len)?);
    let metadata_len = read_u32(bytes, &mut offset)? as usize;
    let metadata = Bytes::copy_from_slice(take(bytes, &mut offset, metadata_len)?);

    if offset != bytes.len() {
        return Err(LogError::RecordInvalid {
            reason: format!("{} trailing bytes after prepare", bytes.len() - offset),
        });
    }

    Ok(PrepareLog {
        flags,
        transaction_position,
        transaction_offset,
        stream,
        event_number,
        event_id,
        event_type,
        created_ms,
        data,
        metadata,
    })
}

fn encode_commit(commit: &CommitLog) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + 8);
    buf.push(KIND_COMMIT);
    buf.extend_from_slice(&commit.transaction_position.to_le_bytes());
    buf.extend_from_slice(&commit.first_event_number.get().to_le_bytes());
    buf
}

fn decode_commit(bytes: &[u8], mut offset: usize) -> LogResult<CommitLog> {
    let transaction_position = read_i64(bytes, &mut offset)?;
    let first_raw = read_i64(bytes, &mut offset)?;
    let first_event_number =
        EventNumber::new(first_raw).ok_or_else(|| LogError::RecordInvalid {
            reason: format!("negative first event number {first_raw}"),
        })?;
    if offset != bytes.len() {
        return Err(LogError::RecordInvalid {
            reason: format!("{} trailing bytes after commit", bytes.len() - offset),
        });
    }
    Ok(CommitLog {
        transaction_position,
        first_event_number,
    })
}

fn encode_system(system: &SystemLog) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + system.payload.len());
    buf.push(KIND_SYSTEM);
    buf.push(system.kind as u8);
    buf.extend_from_slice(&system.payload);
    buf
}

fn decode_system(bytes: &[u8], mut offset: usize) -> LogResult<SystemLog> {
    let kind = SystemRecordKind::from_u8(read_u8(bytes, &mut offset)?)?;
    let payload = Bytes::copy_from_slice(&bytes[offset..]);
    Ok(SystemLog { kind, payload })
}

fn read_u8(bytes: &[u8], offset: &mut usize) -> LogResult<u8> {
    let slice = take(bytes, offset, 1)?;
    Ok(slice[0])
}

fn read_u16(bytes: &[u8], offset: &mut usize) -> LogResult<u16> {
    let slice = take(bytes, offset, 2)?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

fn read_u32(bytes: &[u8], offset: &mut usize) -> LogResult<u32> {
    let slice = take(bytes, offset, 4)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_i32(bytes: &[u8], offset: &mut usize) -> LogResult<i32> {
    let slice = take(bytes, offset, 4)?;
    Ok(i32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_u64(bytes: &[u8], offset: &mut usize) -> LogResult<u64> {
    let slice = take(bytes, offset, 8)?;
    Ok(u64::from_le_bytes(slice.try_into().expect("8 bytes")))
}

fn read_i64(bytes: &[u8], offset: &mut usize) -> LogResult<i64> {
    let slice = take(bytes, offset, 8)?;
    Ok(i64::from_le_bytes(slice.try_into().expect("8 bytes")))
}

fn read_array<const N: usize>(bytes: &[u8], offset: &mut usize) -> LogResult<[u8; N]> {
    let slice = take(bytes, offset, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

fn take<'a>(bytes: &'a [u8], offset: &mut usize, len: usize) -> LogResult<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| LogError::RecordInvalid {
            reason: "record length overflow".to_string(),
        })?;
    if end > bytes.len() {
        return Err(LogError::RecordInvalid {
            reason: "record truncated".to_string(),
        });
    }
    let slice = &bytes[*offset..end];
    *offset = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_prepare() -> PrepareLog {
        PrepareLog {
            flags: PrepareFlags::DATA
                .with(PrepareFlags::TRANSACTION_BEGIN)
                .with(PrepareFlags::TRANSACTION_END)
                .with(PrepareFlags::IMPLICIT_COMMIT),
            transaction_position: 4096,
            transaction_offset: 0,
            stream: StreamId::parse("orders-1").unwrap(),
            event_number: EventNumber::new(3).unwrap(),
            event_id: EventId::new(Uuid::from_bytes([7u8; 16])),
            event_type: "order-placed".to_string(),
            created_ms: 1_700_000_000_000,
            data: Bytes::from_static(b"{\"total\":12}"),
            metadata: Bytes::from_static(b"{}"),
        }
    }

    #[test]
    fn prepare_roundtrip() {
        let prepare = sample_prepare();
        let bytes = LogRecord::Prepare(prepare.clone()).encode().unwrap();
        let decoded = LogRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, LogRecord::Prepare(prepare));
    }

    #[test]
    fn commit_roundtrip() {
        let commit = CommitLog {
            transaction_position: 128,
            first_event_number: EventNumber::ZERO,
        };
        let bytes = LogRecord::Commit(commit).encode().unwrap();
        assert_eq!(LogRecord::decode(&bytes).unwrap(), LogRecord::Commit(commit));
    }

    #[test]
    fn system_roundtrip() {
        let system = SystemLog {
            kind: SystemRecordKind::Epoch,
            payload: Bytes::from_static(b"\x01\x00"),
        };
        let bytes = LogRecord::System(system.clone()).encode().unwrap();
        assert_eq!(
            LogRecord::decode(&bytes).unwrap(),
            LogRecord::System(system)
        );
    }

    #[test]
    fn unknown_flag_bits_rejected() {
        assert!(matches!(
            PrepareFlags::from_bits(1 << 9),
            Err(LogError::RecordInvalid { .. })
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = LogRecord::Prepare(sample_prepare()).encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            LogRecord::decode(&bytes),
            Err(LogError::RecordInvalid { .. })
        ));
    }

    #[test]
    fn tombstone_flag_observed() {
        let mut prepare = sample_prepare();
        prepare.flags = prepare.flags.with(PrepareFlags::TOMBSTONE);
        prepare.event_number = EventNumber::TOMBSTONE;
        let bytes = LogRecord::Prepare(prepare.clone()).encode().unwrap();
        match LogRecord::decode(&bytes).unwrap() {
            LogRecord::Prepare(decoded) => {
                assert!(decoded.is_tombstone());
                assert_eq!(decoded.event_number, EventNumber::TOMBSTONE);
            }
            other => panic!("expected prepare, got {other:?}"),
        }
    }
}
