//! Incremental WebM block demuxer.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::error::AudioError;
use crate::AudioResult;

const ID_SEGMENT: u32 = 0x1853_8067;
const ID_CLUSTER: u32 = 0x1F43_B675;
const ID_BLOCK_GROUP: u32 = 0xA0;
const ID_BLOCK: u32 = 0xA1;
const ID_SIMPLE_BLOCK: u32 = 0xA3;

const CLUSTER_ID_BYTES: [u8; 4] = [0x1F, 0x43, 0xB6, 0x75];

/// Upper bound for a single element body; anything larger is treated as
/// corruption.
const MAX_ELEMENT_SIZE: u64 = 1 << 20;

/// Upper bound for a block accepted while resynchronizing.
const MAX_RESYNC_BLOCK_SIZE: u64 = 8 * 1024;

const LACING_MASK: u8 = 0x06;

/// Flag bits that are zero in every unlaced block (reserved and lacing).
const RESYNC_FLAGS_MASK: u8 = 0x76;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for an element ID and size.
    Header,

    /// Discarding the body of an element we do not care about.
    Skip(u64),

    /// Waiting for the complete body of a block.
    Block(usize),

    /// Scanning for the next cluster or block after lost or corrupt input.
    Resync,
}

/// Outcome of checking a possible resync point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    Valid,
    Incomplete,
    Invalid,
}

/// Splits a streamed WebM container into compressed block payloads.
///
/// Master elements are entered without tracking their end, which makes the
/// demuxer indifferent to the unknown-size segments and clusters live
/// recorders produce. After corrupt input, or after [`resync`] when chunks
/// were lost, it scans forward to the next cluster or block and continues.
///
/// [`resync`]: BlockDemuxer::resync
#[derive(Debug)]
pub struct BlockDemuxer {
    buf: BytesMut,
    state: State,
    blocks: u64,
    resyncs: u64,
}

impl BlockDemuxer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            state: State::Header,
            blocks: 0,
            resyncs: 0,
        }
    }

    /// Number of blocks emitted since creation.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Number of times the demuxer had to search for a sync point.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drops all buffered bytes and starts over at an element boundary.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = State::Header;
    }

    /// Drops buffered bytes after input was lost; the next bytes are
    /// searched for a cluster or block to continue from.
    pub fn resync(&mut self) {
        self.buf.clear();
        self.enter_resync();
    }

    /// Appends a chunk and pushes every block payload completed by it.
    ///
    /// On a malformed stream the demuxer resynchronizes and keeps going; the
    /// first fault is returned once the chunk is consumed, with every block
    /// recovered around it already in `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Bytes>) -> AudioResult<()> {
        self.buf.extend_from_slice(chunk);

        let mut fault = None;
        while let Err(e) = self.drain(out) {
            warn!("Audio container fault, resynchronizing: {}", e);
            self.enter_resync();
            fault.get_or_insert(e);
        }
        fault.map_or(Ok(()), Err)
    }

    fn enter_resync(&mut self) {
        if self.state != State::Resync {
            self.resyncs += 1;
            self.state = State::Resync;
        }
    }

    fn drain(&mut self, out: &mut Vec<Bytes>) -> AudioResult<()> {
        loop {
            match self.state {
                State::Header => {
                    let Some((id, id_len)) = read_vint(&self.buf, true)? else {
                        return Ok(());
                    };
                    if id_len > 4 {
                        return Err(AudioError::MalformedContainer(format!(
                            "element ID of {id_len} bytes"
                        )));
                    }
                    let Some((size, size_len)) = read_vint(&self.buf[id_len..], false)? else {
                        return Ok(());
                    };
                    let unknown = is_unknown_size(size, size_len);
                    self.buf.advance(id_len + size_len);

                    let id = id as u32;
                    self.state = match id {
                        ID_SEGMENT | ID_CLUSTER | ID_BLOCK_GROUP => State::Header,
                        _ if unknown => {
                            return Err(AudioError::MalformedContainer(format!(
                                "element {id:#x} of unknown size"
                            )));
                        }
                        _ if size > MAX_ELEMENT_SIZE => {
                            return Err(AudioError::MalformedContainer(format!(
                                "element {id:#x} of unusable size {size}"
                            )));
                        }
                        ID_BLOCK | ID_SIMPLE_BLOCK => State::Block(size as usize),
                        _ => State::Skip(size),
                    };
                }
                State::Skip(remaining) => {
                    let take = remaining.min(self.buf.len() as u64);
                    self.buf.advance(take as usize);
                    if take < remaining {
                        self.state = State::Skip(remaining - take);
                        return Ok(());
                    }
                    self.state = State::Header;
                }
                State::Block(size) => {
                    if self.buf.len() < size {
                        return Ok(());
                    }
                    let body = self.buf.split_to(size).freeze();
                    self.state = State::Header;

                    match block_payload(body) {
                        Ok(payload) => {
                            self.blocks += 1;
                            trace!(len = payload.len(), "Audio block");
                            out.push(payload);
                        }
                        Err(e) => warn!("Dropping audio block: {}", e),
                    }
                }
                State::Resync => {
                    let (offset, found) = find_sync_point(&self.buf);
                    self.buf.advance(offset);
                    if !found {
                        return Ok(());
                    }
                    debug!(skipped = offset, "Audio container resynchronized");
                    self.state = State::Header;
                }
            }
        }
    }
}

impl Default for BlockDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the offset of the first plausible cluster or block start and
/// whether it was confirmed. Unconfirmed, the offset marks where scanning
/// resumes once more bytes arrive.
fn find_sync_point(buf: &[u8]) -> (usize, bool) {
    for pos in 0..buf.len() {
        let candidate = match buf[pos] {
            0x1F => check_cluster(&buf[pos..]),
            0xA3 => check_simple_block(&buf[pos..]),
            _ => Candidate::Invalid,
        };
        match candidate {
            Candidate::Valid => return (pos, true),
            Candidate::Incomplete => return (pos, false),
            Candidate::Invalid => {}
        }
    }
    (buf.len(), false)
}

fn check_cluster(buf: &[u8]) -> Candidate {
    let known = buf.len().min(CLUSTER_ID_BYTES.len());
    if buf[..known] != CLUSTER_ID_BYTES[..known] {
        return Candidate::Invalid;
    }
    match buf.get(CLUSTER_ID_BYTES.len()) {
        None => Candidate::Incomplete,
        Some(0) => Candidate::Invalid,
        Some(_) => Candidate::Valid,
    }
}

/// A block counts as a sync point when its header is plausible and the
/// element right after it starts another block or a cluster.
fn check_simple_block(buf: &[u8]) -> Candidate {
    let (size, size_len) = match read_vint(&buf[1..], false) {
        Ok(Some(vint)) => vint,
        Ok(None) => return Candidate::Incomplete,
        Err(_) => return Candidate::Invalid,
    };
    if size_len > 4
        || is_unknown_size(size, size_len)
        || !(4..=MAX_RESYNC_BLOCK_SIZE).contains(&size)
    {
        return Candidate::Invalid;
    }

    let body = 1 + size_len;
    match buf.get(body) {
        None => return Candidate::Incomplete,
        Some(track) if track & 0x80 == 0 => return Candidate::Invalid,
        Some(_) => {}
    }
    match buf.get(body + 3) {
        None => return Candidate::Incomplete,
        Some(flags) if flags & RESYNC_FLAGS_MASK != 0 => return Candidate::Invalid,
        Some(_) => {}
    }

    match buf.get(body + size as usize) {
        None => Candidate::Incomplete,
        Some(0xA3) | Some(0x1F) => Candidate::Valid,
        Some(_) => Candidate::Invalid,
    }
}

/// Reads an EBML variable-length integer.
///
/// Returns `None` if more bytes are needed. IDs keep their length marker,
/// sizes do not.
fn read_vint(buf: &[u8], keep_marker: bool) -> AudioResult<Option<(u64, usize)>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    if first == 0 {
        return Err(AudioError::MalformedContainer(
            "variable-length integer longer than 8 bytes".to_string(),
        ));
    }

    let len = first.leading_zeros() as usize + 1;
    if buf.len() < len {
        return Ok(None);
    }

    let mut value = if keep_marker {
        u64::from(first)
    } else {
        u64::from(first) & (0xFFu64 >> len)
    };
    for &byte in &buf[1..len] {
        value = (value << 8) | u64::from(byte);
    }
    Ok(Some((value, len)))
}

fn is_unknown_size(size: u64, len: usize) -> bool {
    size == (1u64 << (7 * len)) - 1
}

/// Strips the block header (track number, timecode, flags).
fn block_payload(mut body: Bytes) -> AudioResult<Bytes> {
    let track_len = match read_vint(&body, false)? {
        Some((_, len)) => len,
        None => return Err(AudioError::MalformedContainer("empty block".to_string())),
    };
    let header_len = track_len + 3;
    if body.len() < header_len {
        return Err(AudioError::MalformedContainer(format!(
            "block of {} bytes shorter than its header",
            body.len()
        )));
    }

    let flags = body[header_len - 1];
    if flags & LACING_MASK != 0 {
        return Err(AudioError::MalformedContainer(
            "laced blocks are not supported".to_string(),
        ));
    }

    body.advance(header_len);
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(id: &[u8], body: &[u8]) -> Vec<u8> {
        assert!(body.len() < 0x7F);
        let mut out = id.to_vec();
        out.push(0x80 | body.len() as u8);
        out.extend_from_slice(body);
        out
    }

    fn simple_block(payload: &[u8]) -> Vec<u8> {
        let mut body = vec![0x81, 0x00, 0x00, 0x80];
        body.extend_from_slice(payload);
        element(&[0xA3], &body)
    }

    fn stream(payloads: &[&[u8]]) -> Vec<u8> {
        let mut out = element(&[0x1A, 0x45, 0xDF, 0xA3], &[0x42, 0x86, 0x81, 0x01]);
        // Segment and cluster of unknown size.
        out.extend_from_slice(&[0x18, 0x53, 0x80, 0x67, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        out.extend(element(&[0x15, 0x49, 0xA9, 0x66], &[0x2A, 0xD7, 0xB1, 0x83, 0x0F, 0x42, 0x40]));
        out.extend_from_slice(&[0x1F, 0x43, 0xB6, 0x75, 0xFF]);
        out.extend(element(&[0xE7], &[0x00]));
        for payload in payloads {
            out.extend(simple_block(payload));
        }
        out
    }

    #[test]
    fn test_whole_stream() {
        let bytes = stream(&[b"first", b"second"]);
        let mut demuxer = BlockDemuxer::new();
        let mut out = Vec::new();
        demuxer.feed(&bytes, &mut out).unwrap();

        assert_eq!(out, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
        assert_eq!(demuxer.blocks(), 2);
        assert_eq!(demuxer.buffered(), 0);
    }

    #[test]
    fn test_byte_by_byte_matches_whole_stream() {
        let bytes = stream(&[b"abc", b"", b"0123456789"]);
        let mut demuxer = BlockDemuxer::new();
        let mut out = Vec::new();
        for byte in &bytes {
            demuxer.feed(std::slice::from_ref(byte), &mut out).unwrap();
        }

        assert_eq!(
            out,
            vec![
                Bytes::from_static(b"abc"),
                Bytes::new(),
                Bytes::from_static(b"0123456789")
            ]
        );
    }

    #[test]
    fn test_block_group_is_entered() {
        let mut bytes = stream(&[]);
        let mut block = vec![0x81, 0x00, 0x10, 0x00];
        block.extend_from_slice(b"grouped");
        bytes.extend(element(&[0xA0], &element(&[0xA1], &block)));

        let mut out = Vec::new();
        BlockDemuxer::new().feed(&bytes, &mut out).unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"grouped")]);
    }

    #[test]
    fn test_laced_block_dropped() {
        let mut bytes = stream(&[b"ok"]);
        bytes.extend(element(&[0xA3], &[0x81, 0x00, 0x00, 0x82, 0x01, 0x02]));
        bytes.extend(simple_block(b"after"));

        let mut out = Vec::new();
        BlockDemuxer::new().feed(&bytes, &mut out).unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"ok"), Bytes::from_static(b"after")]);
    }

    #[test]
    fn test_unknown_size_leaf_resyncs() {
        let mut demuxer = BlockDemuxer::new();
        let mut out = Vec::new();
        let mut bytes = simple_block(b"kept");
        bytes.extend_from_slice(&[0xE7, 0xFF, 0x00]);

        let err = demuxer.feed(&bytes, &mut out).unwrap_err();
        assert!(matches!(err, AudioError::MalformedContainer(_)));
        assert_eq!(out, vec![Bytes::from_static(b"kept")]);
        assert_eq!(demuxer.buffered(), 0);
        assert_eq!(demuxer.resyncs(), 1);

        // A block found while resynchronizing is confirmed by the next one.
        demuxer.feed(&simple_block(b"again"), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        demuxer.feed(&simple_block(b"more"), &mut out).unwrap();
        assert_eq!(
            out,
            vec![
                Bytes::from_static(b"kept"),
                Bytes::from_static(b"again"),
                Bytes::from_static(b"more")
            ]
        );
    }

    #[test]
    fn test_oversized_block_resyncs_within_chunk() {
        let mut bytes = stream(&[b"one"]);
        // SimpleBlock claiming 2 MiB.
        bytes.extend_from_slice(&[0xA3, 0x10, 0x20, 0x00, 0x00]);
        bytes.extend(simple_block(b"two"));
        bytes.extend(simple_block(b"three"));

        let mut out = Vec::new();
        let mut demuxer = BlockDemuxer::new();
        assert!(demuxer.feed(&bytes, &mut out).is_err());
        assert_eq!(
            out,
            vec![
                Bytes::from_static(b"one"),
                Bytes::from_static(b"two"),
                Bytes::from_static(b"three")
            ]
        );
    }

    #[test]
    fn test_lost_chunk_recovers_following_blocks() {
        let mut bytes = stream(&[]);
        let mut starts = Vec::new();
        for i in 0..40u8 {
            starts.push(bytes.len());
            bytes.extend(simple_block(&[i; 34]));
        }
        let block_len = 40;
        let (gap_start, gap_end) = (500, 550);

        let mut demuxer = BlockDemuxer::new();
        let mut out = Vec::new();
        for (index, chunk) in bytes.chunks(50).enumerate() {
            if index == 10 {
                demuxer.resync();
                continue;
            }
            demuxer.feed(chunk, &mut out).unwrap();
        }

        let expected: Vec<Bytes> = (0..40u8)
            .filter(|&i| {
                let start = starts[usize::from(i)];
                start + block_len <= gap_start || start >= gap_end
            })
            .map(|i| Bytes::from(vec![i; 34]))
            .collect();
        assert_eq!(out, expected);
        assert_eq!(demuxer.resyncs(), 1);
    }

    #[test]
    fn test_vint() {
        assert_eq!(read_vint(&[0x81], false).unwrap(), Some((1, 1)));
        assert_eq!(read_vint(&[0x40, 0x02], false).unwrap(), Some((2, 2)));
        assert_eq!(read_vint(&[0x1A, 0x45, 0xDF, 0xA3], true).unwrap(), Some((0x1A45_DFA3, 4)));
        assert_eq!(read_vint(&[0x40], false).unwrap(), None);
        assert!(read_vint(&[0x00], false).is_err());

        let unknown = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(read_vint(&unknown, false).unwrap(), Some((0x00FF_FFFF_FFFF_FFFF, 8)));
        let known = [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00];
        assert_eq!(read_vint(&known, false).unwrap(), Some((0x100, 8)));

        assert!(is_unknown_size(0x7F, 1));
        assert!(is_unknown_size(0x00FF_FFFF_FFFF_FFFF, 8));
        assert!(!is_unknown_size(0x100, 8));
    }
}
