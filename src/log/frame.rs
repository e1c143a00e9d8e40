//! Record framing: `u32 length | payload | u32 length`.
//!
//! The duplicated length suffix makes backward scans possible and doubles as
//! the torn-write detector on recovery.

use std::io::Read;

use super::{LogError, LogResult};

pub const FRAME_PREFIX_LEN: usize = 4;
pub const FRAME_SUFFIX_LEN: usize = 4;
pub const FRAME_OVERHEAD: usize = FRAME_PREFIX_LEN + FRAME_SUFFIX_LEN;

pub fn encode_frame(payload: &[u8], max_record_bytes: usize) -> LogResult<Vec<u8>> {
    if payload.is_empty() {
        return Err(LogError::FrameLengthInvalid {
            reason: "frame payload cannot be empty".to_string(),
        });
    }
    if payload.len() > max_record_bytes {
        return Err(LogError::RecordTooLarge {
            max_bytes: max_record_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| LogError::FrameLengthInvalid {
        reason: "frame length exceeds u32".to_string(),
    })?;

    let mut buf = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&length.to_le_bytes());
    Ok(buf)
}

/// Sequential frame reader over any byte source positioned at a frame
/// boundary. `Ok(None)` means clean end of data; a torn or corrupt frame is
/// an error so recovery can truncate at the last good boundary.
pub struct FrameReader<R> {
    reader: R,
    max_record_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_record_bytes: usize) -> Self {
        Self {
            reader,
            max_record_bytes,
        }
    }

    pub fn read_next(&mut self) -> LogResult<Option<Vec<u8>>> {
        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        match read_fully(&mut self.reader, &mut prefix)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Partial(got) => {
                return Err(LogError::FrameTorn {
                    reason: format!("length prefix truncated after {got} bytes"),
                })
            }
            ReadOutcome::Full => {}
        }

        let length = u32::from_le_bytes(prefix) as usize;
        if length == 0 {
            return Err(LogError::FrameLengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if length > self.max_record_bytes {
            return Err(LogError::FrameLengthInvalid {
                reason: format!(
                    "frame length {length} exceeds max record bytes {}",
                    self.max_record_bytes
                ),
            });
        }

        let mut body = vec![0u8; length + FRAME_SUFFIX_LEN];
        match read_fully(&mut self.reader, &mut body)? {
            ReadOutcome::Full => {}
            ReadOutcome::Eof | ReadOutcome::Partial(_) => {
                return Err(LogError::FrameTorn {
                    reason: format!("frame body truncated (expected {length} bytes)"),
                })
            }
        }

        let suffix = u32::from_le_bytes(body[length..].try_into().expect("4 bytes"));
        if suffix as usize != length {
            return Err(LogError::FrameSuffixMismatch {
                prefix: length as u32,
                suffix,
            });
        }

        body.truncate(length);
        Ok(Some(body))
    }
}

enum ReadOutcome {
    Full,
    Eof,
    Partial(usize),
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> LogResult<ReadOutcome> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = reader
            .read(&mut buf[read..])
            .map_err(|source| LogError::Io { path: None, source })?;
        if n == 0 {
            if read == 0 {
                return Ok(ReadOutcome::Eof);
            }
            return Ok(ReadOutcome::Partial(read));
        }
        read += n;
    }
    Ok(ReadOutcome::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip() {
        let frame = encode_frame(b"hello", 1024).unwrap();
        assert_eq!(frame.len(), 5 + FRAME_OVERHEAD);

        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        let payload = reader.read_next().unwrap().unwrap();
        assert_eq!(payload, b"hello");
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn suffix_mismatch_detected() {
        let mut frame = encode_frame(b"hello", 1024).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;

        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        assert!(matches!(
            reader.read_next(),
            Err(LogError::FrameSuffixMismatch { .. })
        ));
    }

    #[test]
    fn torn_body_detected() {
        let mut frame = encode_frame(b"hello world", 1024).unwrap();
        frame.truncate(frame.len() - 6);

        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        assert!(matches!(
            reader.read_next(),
            Err(LogError::FrameTorn { .. })
        ));
    }

    #[test]
    fn oversized_length_rejected() {
        let frame = encode_frame(b"hello", 1024).unwrap();
        let mut reader = FrameReader::new(Cursor::new(frame), 4);
        assert!(matches!(
            reader.read_next(),
            Err(LogError::FrameLengthInvalid { .. })
        ));
    }

    #[test]
    fn empty_payload_rejected() {
        assert!(matches!(
            encode_frame(b"", 1024),
            Err(LogError::FrameLengthInvalid { .. })
        ));
    }
}
