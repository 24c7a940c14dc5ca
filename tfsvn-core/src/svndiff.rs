//! svndiff wire codec for the TfSvn gateway
//!
//! Implements the SVN binary delta container format (version 0): a `"SVN"`
//! signature plus version byte, followed by windows of copy instructions and
//! literal data. The gateway never computes true deltas; it wraps full file
//! content in CopyFromNewData windows so an SVN client can consume it, so the
//! encoder side is replace-only while the decoder handles the full
//! instruction set.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, DiffError>;

/// Errors raised while decoding or applying an svndiff stream.
///
/// All of these are fatal for the stream in question: the bytes are wrong and
/// retrying the decode cannot help.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("stream does not start with the SVN signature")]
    BadSignature,

    #[error("unsupported svndiff version {0} (only version 0 is supported)")]
    UnsupportedVersion(u8),

    #[error("truncated svndiff stream at offset {0}")]
    Truncated(usize),

    #[error("varint at offset {0} exceeds 64 bits")]
    VarintOverflow(usize),

    #[error("invalid instruction byte {byte:#04x} at instruction offset {offset}")]
    InvalidInstruction { byte: u8, offset: usize },

    #[error("copy-from-source range {offset}+{len} out of bounds (source has {available} bytes)")]
    SourceOutOfBounds { offset: u64, len: u64, available: usize },

    #[error("copy-from-target offset {offset} beyond produced output ({produced} bytes)")]
    TargetOutOfBounds { offset: u64, produced: usize },

    #[error("window produced {produced} bytes but declared a target length of {expected}")]
    WindowMismatch { produced: u64, expected: u64 },
}

/// Signature plus version byte for the one svndiff version we speak.
const SVNDIFF_V0_HEADER: [u8; 4] = *b"SVN\0";

/// Output buffers grow in multiples of this, not to the exact required size.
pub const ALLOCATION_ALIGNMENT: usize = 1 << 20;

/// Largest literal-data section placed in a single window.
pub const MAX_DATA_CHUNK: usize = 100_000;

const OPCODE_SOURCE: u8 = 0;
const OPCODE_TARGET: u8 = 1;
const OPCODE_NEW_DATA: u8 = 2;

/// One decoded svndiff window: the five header values plus its instruction
/// and literal-data sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffWindow {
    /// Offset into the source view, relative to the stream's running cursor.
    pub source_offset: u64,
    /// Length of the source view.
    pub source_len: u64,
    /// Exact number of bytes replaying the instructions must produce.
    pub target_len: u64,
    /// Raw instruction section.
    pub instructions: Vec<u8>,
    /// Raw literal-data section consumed by CopyFromNewData.
    pub new_data: Vec<u8>,
}

/// One parsed copy instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffInstruction {
    CopyFromSource { offset: u64, len: u64 },
    CopyFromTarget { offset: u64, len: u64 },
    CopyFromNewData { len: u64 },
}

/// Append `value` as a big-endian 7-bit-group varint, minimal length.
///
/// Every byte except the last has bit 7 set. Zero encodes as a single `0x00`.
pub fn write_varint(value: u64, out: &mut Vec<u8>) {
    let mut groups = 1u32;
    let mut v = value >> 7;
    while v > 0 {
        v >>= 7;
        groups += 1;
    }
    while groups > 1 {
        groups -= 1;
        out.push((((value >> (groups * 7)) & 0x7f) | 0x80) as u8);
    }
    out.push((value & 0x7f) as u8);
}

/// Read a varint starting at `*pos`, advancing `*pos` past it.
pub fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    loop {
        let byte = *buf.get(*pos).ok_or(DiffError::Truncated(*pos))?;
        *pos += 1;
        if value >> 57 != 0 {
            return Err(DiffError::VarintOverflow(*pos - 1));
        }
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

/// Number of bytes `write_varint` emits for `value`.
fn varint_len(value: u64) -> u64 {
    let mut len = 1;
    let mut v = value >> 7;
    while v > 0 {
        v >>= 7;
        len += 1;
    }
    len
}

fn read_instruction(buf: &[u8], pos: &mut usize) -> Result<DiffInstruction> {
    let start = *pos;
    let byte = *buf.get(*pos).ok_or(DiffError::Truncated(*pos))?;
    *pos += 1;

    // Bits 7-6 select the opcode; bits 5-0 carry an inline length, with zero
    // meaning the length follows as a varint.
    let opcode = byte >> 6;
    let mut len = u64::from(byte & 0x3f);
    if len == 0 {
        len = read_varint(buf, pos)?;
    }

    match opcode {
        OPCODE_SOURCE => {
            let offset = read_varint(buf, pos)?;
            Ok(DiffInstruction::CopyFromSource { offset, len })
        }
        OPCODE_TARGET => {
            let offset = read_varint(buf, pos)?;
            Ok(DiffInstruction::CopyFromTarget { offset, len })
        }
        OPCODE_NEW_DATA => Ok(DiffInstruction::CopyFromNewData { len }),
        _ => Err(DiffError::InvalidInstruction {
            byte,
            offset: start,
        }),
    }
}

fn write_new_data_instruction(len: usize, out: &mut Vec<u8>) {
    let len = len as u64;
    if (1..64).contains(&len) {
        out.push((OPCODE_NEW_DATA << 6) | (len as u8));
    } else {
        out.push(OPCODE_NEW_DATA << 6);
        write_varint(len, out);
    }
}

/// Decode a complete svndiff stream into its windows.
///
/// Strict: a bad signature, an unsupported version, or any truncation fails
/// the whole decode. There is no partial result.
pub fn decode_windows(stream: &[u8]) -> Result<Vec<DiffWindow>> {
    if stream.len() < SVNDIFF_V0_HEADER.len() {
        return Err(DiffError::Truncated(stream.len()));
    }
    if stream[..3] != SVNDIFF_V0_HEADER[..3] {
        return Err(DiffError::BadSignature);
    }
    if stream[3] != 0 {
        return Err(DiffError::UnsupportedVersion(stream[3]));
    }

    let mut pos = SVNDIFF_V0_HEADER.len();
    let mut windows = Vec::new();
    while pos < stream.len() {
        let source_offset = read_varint(stream, &mut pos)?;
        let source_len = read_varint(stream, &mut pos)?;
        let target_len = read_varint(stream, &mut pos)?;
        let instructions_len = read_varint(stream, &mut pos)? as usize;
        let data_len = read_varint(stream, &mut pos)? as usize;

        let instructions_end = pos
            .checked_add(instructions_len)
            .filter(|end| *end <= stream.len())
            .ok_or(DiffError::Truncated(stream.len()))?;
        let data_end = instructions_end
            .checked_add(data_len)
            .filter(|end| *end <= stream.len())
            .ok_or(DiffError::Truncated(stream.len()))?;

        windows.push(DiffWindow {
            source_offset,
            source_len,
            target_len,
            instructions: stream[pos..instructions_end].to_vec(),
            new_data: stream[instructions_end..data_end].to_vec(),
        });
        pos = data_end;
    }
    Ok(windows)
}

/// Grow `buf`'s capacity to an [`ALLOCATION_ALIGNMENT`] multiple covering
/// `needed` bytes. Many small copy instructions would otherwise trigger a
/// reallocation per instruction.
fn reserve_aligned(buf: &mut Vec<u8>, needed: usize) {
    if needed <= buf.capacity() {
        return;
    }
    let aligned = needed.div_ceil(ALLOCATION_ALIGNMENT) * ALLOCATION_ALIGNMENT;
    buf.reserve_exact(aligned - buf.len());
}

/// Replay one window's instructions and return the produced target bytes.
///
/// `source_base` is added to every CopyFromSource offset. The produced length
/// must match the window's declared `target_len` exactly.
pub fn apply_window(window: &DiffWindow, source: &[u8], source_base: usize) -> Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::new();
    let mut pos = 0usize;
    let mut data_pos = 0usize;

    while pos < window.instructions.len() {
        let instruction = read_instruction(&window.instructions, &mut pos)?;
        let len = match instruction {
            DiffInstruction::CopyFromSource { len, .. }
            | DiffInstruction::CopyFromTarget { len, .. }
            | DiffInstruction::CopyFromNewData { len } => len,
        };

        // No instruction may produce past the declared target length.
        // Checking up front bounds the output buffer before any copying.
        let produced_after = (out.len() as u64).saturating_add(len);
        if produced_after > window.target_len {
            return Err(DiffError::WindowMismatch {
                produced: produced_after,
                expected: window.target_len,
            });
        }
        let needed = out.len() + len as usize;

        match instruction {
            DiffInstruction::CopyFromSource { offset, len } => {
                let start = (source_base as u64).checked_add(offset);
                let end = start.and_then(|s| s.checked_add(len));
                match (start, end) {
                    (Some(start), Some(end)) if end <= source.len() as u64 => {
                        reserve_aligned(&mut out, needed);
                        out.extend_from_slice(&source[start as usize..end as usize]);
                    }
                    _ => {
                        return Err(DiffError::SourceOutOfBounds {
                            offset,
                            len,
                            available: source.len(),
                        });
                    }
                }
            }
            DiffInstruction::CopyFromTarget { offset, len } => {
                let offset = offset as usize;
                if len > 0 && offset >= out.len() {
                    return Err(DiffError::TargetOutOfBounds {
                        offset: offset as u64,
                        produced: out.len(),
                    });
                }
                reserve_aligned(&mut out, needed);
                // The copied range may overlap the bytes being appended, so
                // copy byte-by-byte in increasing index order. A bulk copy
                // would read stale bytes and break run-length expansion.
                for i in 0..len as usize {
                    let byte = out[offset + i];
                    out.push(byte);
                }
            }
            DiffInstruction::CopyFromNewData { len } => {
                let end = data_pos
                    .checked_add(len as usize)
                    .filter(|end| *end <= window.new_data.len())
                    .ok_or(DiffError::Truncated(window.new_data.len()))?;
                reserve_aligned(&mut out, needed);
                out.extend_from_slice(&window.new_data[data_pos..end]);
                data_pos = end;
            }
        }
    }

    if out.len() as u64 != window.target_len {
        return Err(DiffError::WindowMismatch {
            produced: out.len() as u64,
            expected: window.target_len,
        });
    }
    Ok(out)
}

/// Decode a stream and apply every window in sequence against `source`.
///
/// Source offsets are interpreted relative to a running cursor that advances
/// by each window's produced target length. Replace-only streams (the only
/// kind this gateway emits) never read the source, so the cursor is inert for
/// them.
pub fn apply_stream(stream: &[u8], source: &[u8]) -> Result<Vec<u8>> {
    let windows = decode_windows(stream)?;
    let mut out = Vec::new();
    let mut source_base = 0usize;
    for window in &windows {
        let produced = apply_window(window, source, source_base)?;
        source_base += produced.len();
        out.extend_from_slice(&produced);
    }
    Ok(out)
}

/// Build a single-instruction window that replaces the whole target with
/// `data`. Used to transmit full content inside the delta container.
pub fn encode_replace(data: &[u8]) -> DiffWindow {
    let mut instructions = Vec::new();
    write_new_data_instruction(data.len(), &mut instructions);
    DiffWindow {
        source_offset: 0,
        source_len: 0,
        target_len: data.len() as u64,
        instructions,
        new_data: data.to_vec(),
    }
}

fn write_window(window: &DiffWindow, out: &mut Vec<u8>) {
    write_varint(window.source_offset, out);
    write_varint(window.source_len, out);
    write_varint(window.target_len, out);
    write_varint(window.instructions.len() as u64, out);
    write_varint(window.new_data.len() as u64, out);
    out.extend_from_slice(&window.instructions);
    out.extend_from_slice(&window.new_data);
}

/// Serialize `data` as a chunked replace-only svndiff stream and return it
/// base64-encoded, ready to embed in a response body.
///
/// Chunks are capped at `min(ALLOCATION_ALIGNMENT, MAX_DATA_CHUNK)` bytes so
/// a client can apply the stream window-by-window under bounded memory.
/// Empty input yields a signature with zero windows.
pub fn encode_chunked_base64(data: &[u8]) -> String {
    let chunk = ALLOCATION_ALIGNMENT.min(MAX_DATA_CHUNK);
    let mut wire = Vec::with_capacity(encoded_wire_len_hint(data.len() as u64) as usize);
    wire.extend_from_slice(&SVNDIFF_V0_HEADER);
    for piece in data.chunks(chunk) {
        write_window(&encode_replace(piece), &mut wire);
    }
    BASE64.encode(wire)
}

fn encoded_wire_len_hint(raw_len: u64) -> u64 {
    let chunk = ALLOCATION_ALIGNMENT.min(MAX_DATA_CHUNK) as u64;
    let mut wire = SVNDIFF_V0_HEADER.len() as u64;
    let mut remaining = raw_len;
    while remaining > 0 {
        let data_len = remaining.min(chunk);
        let instructions_len = if (1..64).contains(&data_len) {
            1
        } else {
            1 + varint_len(data_len)
        };
        // source_offset + source_len (one zero byte each), target_len,
        // instructions_len, data_len, then the two sections.
        wire += 2
            + varint_len(data_len)
            + varint_len(instructions_len)
            + varint_len(data_len)
            + instructions_len
            + data_len;
        remaining -= data_len;
    }
    wire
}

/// Exact length of [`encode_chunked_base64`]'s output for `raw_len` input
/// bytes, computed without the bytes themselves.
///
/// The prefetch loader uses this to reserve budget for an item before
/// downloading it.
pub fn encoded_len_hint(raw_len: u64) -> u64 {
    encoded_wire_len_hint(raw_len).div_ceil(3) * 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip_varint(value: u64) -> (Vec<u8>, u64) {
        let mut encoded = Vec::new();
        write_varint(value, &mut encoded);
        let mut pos = 0;
        let decoded = read_varint(&encoded, &mut pos).unwrap();
        assert_eq!(pos, encoded.len());
        (encoded, decoded)
    }

    #[test]
    fn varint_known_vectors() {
        assert_eq!(roundtrip_varint(0).0, vec![0x00]);
        assert_eq!(roundtrip_varint(127).0, vec![0x7f]);
        assert_eq!(roundtrip_varint(128).0, vec![0x81, 0x00]);
        assert_eq!(roundtrip_varint(300).0, vec![0x82, 0x2c]);
    }

    #[test]
    fn varint_extremes_roundtrip() {
        for value in [0, 1, 127, 128, 16383, 16384, u64::MAX - 1, u64::MAX] {
            assert_eq!(roundtrip_varint(value).1, value);
        }
        assert_eq!(roundtrip_varint(u64::MAX).0.len(), 10);
    }

    #[test]
    fn varint_rejects_overflow() {
        // Ten all-continuation 0xff bytes carry 70 significant bits.
        let encoded = vec![0xff; 10];
        let mut pos = 0;
        assert!(matches!(
            read_varint(&encoded, &mut pos),
            Err(DiffError::VarintOverflow(_))
        ));
    }

    #[test]
    fn varint_truncated_is_an_error() {
        let mut pos = 0;
        assert!(matches!(
            read_varint(&[0x82], &mut pos),
            Err(DiffError::Truncated(_))
        ));
    }

    #[test]
    fn small_replace_matches_known_bytes() {
        let wire = BASE64.decode(encode_chunked_base64(b"abc")).unwrap();
        assert_eq!(
            wire,
            [
                b'S', b'V', b'N', 0, // header
                0,        // source_offset
                0,        // source_len
                3,        // target_len
                1,        // instructions_len
                3,        // data_len
                0x80 | 3, // insert 3 bytes
                b'a', b'b', b'c',
            ]
        );
    }

    #[test]
    fn empty_input_encodes_to_bare_signature() {
        let wire = BASE64.decode(encode_chunked_base64(b"")).unwrap();
        assert_eq!(wire, b"SVN\0");
        assert!(decode_windows(&wire).unwrap().is_empty());
        assert_eq!(apply_stream(&wire, &[]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn decode_rejects_bad_signature() {
        assert!(matches!(
            decode_windows(b"XVN\0"),
            Err(DiffError::BadSignature)
        ));
    }

    #[test]
    fn decode_rejects_unsupported_version() {
        assert!(matches!(
            decode_windows(b"SVN\x01"),
            Err(DiffError::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn decode_rejects_truncated_window() {
        // Declares a 3-byte data section but carries only one byte.
        let stream = [b'S', b'V', b'N', 0, 0, 0, 3, 1, 3, 0x80 | 3, b'a'];
        assert!(matches!(
            decode_windows(&stream),
            Err(DiffError::Truncated(_))
        ));
    }

    #[test]
    fn apply_rejects_invalid_opcode() {
        let window = DiffWindow {
            source_offset: 0,
            source_len: 0,
            target_len: 1,
            instructions: vec![0xc1], // opcode 3
            new_data: Vec::new(),
        };
        assert!(matches!(
            apply_window(&window, &[], 0),
            Err(DiffError::InvalidInstruction { byte: 0xc1, .. })
        ));
    }

    #[test]
    fn apply_rejects_target_length_mismatch() {
        let mut window = encode_replace(b"abc");
        window.target_len = 4;
        assert!(matches!(
            apply_window(&window, &[], 0),
            Err(DiffError::WindowMismatch {
                produced: 3,
                expected: 4
            })
        ));
    }

    #[test]
    fn apply_rejects_instruction_producing_past_target_len() {
        // Declares a 2-byte target but the single instruction inserts 3.
        let window = DiffWindow {
            source_offset: 0,
            source_len: 0,
            target_len: 2,
            instructions: vec![0x80 | 3],
            new_data: b"abc".to_vec(),
        };
        assert!(matches!(
            apply_window(&window, &[], 0),
            Err(DiffError::WindowMismatch {
                produced: 3,
                expected: 2
            })
        ));
    }

    #[test]
    fn apply_rejects_runaway_target_copy_before_copying() {
        // A target copy with an extended length far past the declared
        // target must fail up front, not after producing the bytes.
        let mut instructions = vec![0x80 | 1, 0x40];
        write_varint(1 << 30, &mut instructions);
        instructions.push(0x00); // offset
        let window = DiffWindow {
            source_offset: 0,
            source_len: 0,
            target_len: 6,
            instructions,
            new_data: b"A".to_vec(),
        };
        assert!(matches!(
            apply_window(&window, &[], 0),
            Err(DiffError::WindowMismatch { expected: 6, .. })
        ));
    }

    #[test]
    fn overlapping_target_copy_expands_runs() {
        // Seed one byte, then copy five bytes starting at offset 0. The
        // copied range overlaps the bytes being produced.
        let window = DiffWindow {
            source_offset: 0,
            source_len: 0,
            target_len: 6,
            instructions: vec![0x80 | 1, 0x40 | 5, 0x00],
            new_data: b"A".to_vec(),
        };
        assert_eq!(apply_window(&window, &[], 0).unwrap(), b"AAAAAA");
    }

    #[test]
    fn copy_from_source_honors_base_offset() {
        let window = DiffWindow {
            source_offset: 0,
            source_len: 4,
            target_len: 4,
            instructions: vec![0x04, 0x00], // copy 4 source bytes from offset 0
            new_data: Vec::new(),
        };
        assert_eq!(apply_window(&window, b"-abcd", 1).unwrap(), b"abcd");
    }

    #[test]
    fn copy_from_source_out_of_bounds_is_an_error() {
        let window = DiffWindow {
            source_offset: 0,
            source_len: 4,
            target_len: 4,
            instructions: vec![0x04, 0x00],
            new_data: Vec::new(),
        };
        assert!(matches!(
            apply_window(&window, b"ab", 0),
            Err(DiffError::SourceOutOfBounds { .. })
        ));
    }

    #[test]
    fn chunking_bound_is_exact() {
        let data = vec![7u8; 250_000];
        let wire = BASE64.decode(encode_chunked_base64(&data)).unwrap();
        let windows = decode_windows(&wire).unwrap();
        assert_eq!(windows.len(), 3);
        let lens: Vec<usize> = windows.iter().map(|w| w.new_data.len()).collect();
        assert_eq!(lens, vec![100_000, 100_000, 50_000]);
    }

    #[test]
    fn encoded_len_hint_matches_encoder() {
        for len in [0usize, 1, 62, 63, 64, 1000, 99_999, 100_000, 100_001, 250_000] {
            let data = vec![0u8; len];
            assert_eq!(
                encoded_len_hint(len as u64),
                encode_chunked_base64(&data).len() as u64,
                "hint mismatch for input length {len}"
            );
        }
    }

    #[test]
    fn chunked_roundtrip_restores_input() {
        let data: Vec<u8> = (0..250_000u32).map(|i| (i % 251) as u8).collect();
        let wire = BASE64.decode(encode_chunked_base64(&data)).unwrap();
        assert_eq!(apply_stream(&wire, &[]).unwrap(), data);
    }

    proptest! {
        #[test]
        fn varint_roundtrip_is_minimal(value: u64) {
            let (encoded, decoded) = roundtrip_varint(value);
            prop_assert_eq!(decoded, value);
            let expected_len = (64 - value.leading_zeros()).max(1).div_ceil(7) as usize;
            prop_assert_eq!(encoded.len(), expected_len);
        }

        #[test]
        fn replace_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..50_000usize)) {
            let wire = BASE64.decode(encode_chunked_base64(&data)).unwrap();
            prop_assert_eq!(apply_stream(&wire, &[]).unwrap(), data);
        }
    }
}
