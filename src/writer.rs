//! The rewriting engine: replays an analyzed transport stream through the current slice list,
//! dropping cut regions, rewriting PCR/PTS/DTS to keep both clocks continuous, and renumbering
//! continuity counters per PID so the result decodes as if the cuts had never existed.

use crate::analyzer::{self, NULL_PID};
use crate::bits::{self, PesOptionalHeader};
use crate::index::{FrameInfo, TS_INVALID};
use crate::pidinfo::{PidInfo, PidInfoManager, StreamType};
use crate::slice::{Slice, SliceList};
use std::collections::{HashMap, HashSet};

/// Where a packet's payload is sent once `write()` decides to keep it.
///
/// Implemented for `FnMut(&[u8]) -> bool` closures; returning `false` aborts the write with
/// [`crate::error::SnipperError::SinkFailure`].
pub trait Sink {
    /// Consume a chunk of output bytes (always a multiple of 188). Return `false` to abort.
    fn write(&mut self, bytes: &[u8]) -> bool;
}

impl<F: FnMut(&[u8]) -> bool> Sink for F {
    fn write(&mut self, bytes: &[u8]) -> bool {
        self(bytes)
    }
}

const FLUSH_THRESHOLD: usize = 188 * 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    IgnoreUntilUnitStart,
    Write,
    WriteUntilUnitStart,
    Ignore,
}

struct PidState {
    action: Action,
    continuity: u8,
    pts_last: u64,
}

/// Per-packet rewriting engine driving one `write()` pass.
///
/// Owns no I/O: the caller ([`crate::snipper::Snipper`]) feeds it packets in increasing byte
/// order and flushes the buffered output through a [`Sink`].
pub struct RewriteEngine {
    working_slices: Vec<Slice>,
    active_idx: usize,
    was_in_slice: bool,
    pid_state: HashMap<u16, PidState>,
    pcr_delta: i64,
    pcr_delta_accumulator: i64,
    pts_cut: Option<u64>,
    pts_delta_tolerance: i64,
    have_pat: bool,
    have_pmt: bool,
    pmt_pid: Option<u16>,
    first_pcr: u64,
    first_pts: u64,
    disabled_pids: HashSet<u16>,
    buffer: Vec<u8>,
}

impl RewriteEngine {
    /// Build the engine for one `write()` pass over a file of `file_size` bytes.
    ///
    /// `frames` is the full I-frame index from analyze; `pmt_pid` is the PMT PID discovered
    /// there (used for the PAT/PMT keep guarantee); `disabled_pids` is the project's disabled set.
    pub fn new(
        slices: &SliceList,
        frames: &[FrameInfo],
        file_size: u64,
        pmt_pid: Option<u16>,
        disabled_pids: HashSet<u16>,
    ) -> Self {
        let first_pcr = frames.first().map(|f| f.pcr).filter(|&v| v != TS_INVALID).unwrap_or(0);
        let first_pts = frames.first().map(|f| f.pts).filter(|&v| v != TS_INVALID).unwrap_or(0);
        Self {
            working_slices: slices.with_write_guards(frames, file_size),
            active_idx: 0,
            was_in_slice: false,
            pid_state: HashMap::new(),
            pcr_delta: 0,
            pcr_delta_accumulator: 0,
            pts_cut: None,
            pts_delta_tolerance: 0,
            have_pat: false,
            have_pmt: false,
            pmt_pid,
            first_pcr,
            first_pts,
            disabled_pids,
            buffer: Vec::with_capacity(FLUSH_THRESHOLD + 188),
        }
    }

    fn active_slice(&self) -> Option<&Slice> {
        self.working_slices.get(self.active_idx)
    }

    fn advance(&mut self, offset: u64) -> bool {
        while self
            .working_slices
            .get(self.active_idx)
            .is_some_and(|s| s.end <= offset)
        {
            self.active_idx += 1;
        }
        self.active_slice()
            .is_some_and(|s| s.begin <= offset && offset < s.end)
    }

    fn handle_boundary(&mut self, in_slice: bool) {
        if in_slice == self.was_in_slice {
            return;
        }
        if self.was_in_slice {
            for state in self.pid_state.values_mut() {
                state.action = Action::IgnoreUntilUnitStart;
            }
            self.pcr_delta += self.pcr_delta_accumulator;
        } else {
            for state in self.pid_state.values_mut() {
                state.action = Action::WriteUntilUnitStart;
            }
            let active = self.active_slice().expect("in_slice implies an active slice");
            self.pts_cut = active.pts_end;
            let pcr_begin = active.pcr_begin.unwrap_or(self.first_pcr);
            let pcr_end = active.pcr_end.unwrap_or(pcr_begin);
            self.pcr_delta_accumulator = pcr_end as i64 - pcr_begin as i64;
            let pts_begin = active.pts_begin.unwrap_or(self.first_pts);
            let pts_end = active.pts_end.unwrap_or(pts_begin);
            self.pts_delta_tolerance =
                (pts_end as i64 - pts_begin as i64) - self.pcr_delta_accumulator / 300;
        }
        self.was_in_slice = in_slice;
    }

    /// Process one input packet at byte offset `offset`, feeding rewritten output into `sink`.
    ///
    /// Returns `false` if `sink` aborted the write.
    pub fn process_packet(
        &mut self,
        pids: &PidInfoManager,
        packet: &[u8; 188],
        offset: u64,
        sink: &mut dyn Sink,
    ) -> bool {
        let in_slice = self.advance(offset);
        self.handle_boundary(in_slice);

        let (header, payload_start) = match analyzer::packet_header_and_payload(packet) {
            Ok(v) => v,
            Err(_) => return self.maybe_flush(sink),
        };
        let pid = header.pid();
        let pid_info = pids.get(pid);
        let disabled = self.disabled_pids.contains(&pid);
        let is_video = matches!(
            pid_info.and_then(PidInfo::stream_type),
            Some(StreamType::Video(_))
        );
        let unit_start = header.pusi();
        let payload = if header.has_payload() && payload_start <= packet.len() {
            Some(&packet[payload_start..])
        } else {
            None
        };
        let packet_pts = payload.filter(|_| unit_start).and_then(|p| peek_pts(p));

        let initial_action = if in_slice {
            Action::Ignore
        } else {
            Action::IgnoreUntilUnitStart
        };
        let state = self.pid_state.entry(pid).or_insert_with(|| PidState {
            action: initial_action,
            // The first write below unconditionally pre-increments before emitting, so seed one
            // behind the packet's own CC to reproduce it exactly when nothing has been cut yet.
            continuity: header.continuity_counter().wrapping_sub(1) & 0x0F,
            pts_last: TS_INVALID,
        });

        // Packets without their own PTS (most packets on a PID) fall back to the last PTS seen on
        // that PID, so the drift heuristic still tracks audio/subtitle frames between unit starts.
        let effective_pts =
            packet_pts.or_else(|| (state.pts_last != TS_INVALID).then_some(state.pts_last));

        let mut write_decision = if !in_slice {
            if state.action == Action::IgnoreUntilUnitStart && unit_start {
                state.action = Action::Write;
            }
            if let (Some(cut), Some(pts)) = (self.pts_cut, effective_pts) {
                let behind = cut as i64 - pts as i64;
                let limit = if is_video { 0 } else { self.pts_delta_tolerance.max(0) };
                if behind > limit {
                    state.action = Action::IgnoreUntilUnitStart;
                }
            }
            state.action == Action::Write || pid == NULL_PID
        } else {
            if state.action == Action::WriteUntilUnitStart && unit_start {
                state.action = Action::Ignore;
            }
            if !is_video {
                if let Some(pts) = effective_pts {
                    let active = self.active_slice();
                    let begin = active
                        .and_then(|s| s.pts_begin)
                        .unwrap_or(self.first_pts);
                    let end = active.and_then(|s| s.pts_end);
                    let outside = pts < begin || end.is_some_and(|e| pts >= e);
                    if outside {
                        state.action = Action::WriteUntilUnitStart;
                    }
                }
            }
            !(state.action == Action::Ignore || pid == NULL_PID)
        };

        if disabled {
            write_decision = false;
        }

        if pid == 0 && !self.have_pat {
            self.have_pat = true;
            write_decision = true;
        } else if Some(pid) == self.pmt_pid && !self.have_pmt {
            self.have_pmt = true;
            write_decision = true;
        }

        if let Some(pts) = packet_pts {
            state.pts_last = pts;
        }

        if !write_decision {
            return self.maybe_flush(sink);
        }

        let mut out = *packet;
        if header.has_payload() {
            state.continuity = (state.continuity + 1) & 0x0F;
        }
        out[3] = (out[3] & 0xF0) | state.continuity;
        rewrite_timestamps(&mut out, header.has_adaptation_field(), payload_start, self.pcr_delta);

        self.buffer.extend_from_slice(&out);
        self.maybe_flush(sink)
    }

    fn maybe_flush(&mut self, sink: &mut dyn Sink) -> bool {
        if self.buffer.len() >= FLUSH_THRESHOLD {
            if !sink.write(&self.buffer) {
                return false;
            }
            self.buffer.clear();
        }
        true
    }

    /// Flush any buffered output at end of stream.
    pub fn finish(&mut self, sink: &mut dyn Sink) -> bool {
        if self.buffer.is_empty() {
            return true;
        }
        let ok = sink.write(&self.buffer);
        self.buffer.clear();
        ok
    }
}

fn peek_pts(payload: &[u8]) -> Option<u64> {
    if payload.len() < 9 {
        return None;
    }
    let prefix: [u8; 3] = payload[0..3].try_into().ok()?;
    if !bits::is_start_code(&prefix) {
        return None;
    }
    let opt = PesOptionalHeader::from_bytes([payload[6], payload[7], payload[8]]);
    if !opt.has_pts() || payload.len() < 14 {
        return None;
    }
    let bytes: [u8; 5] = payload[9..14].try_into().ok()?;
    Some(bits::parse_timestamp(&bytes))
}

fn rewrite_timestamps(packet: &mut [u8; 188], has_adaptation: bool, payload_start: usize, pcr_delta: i64) {
    if pcr_delta == 0 {
        return;
    }
    if has_adaptation && packet[4] > 0 {
        let afh = bits::AdaptationFieldHeader::from_bytes([packet[4], packet[5]]);
        if afh.has_pcr() && packet.len() >= 12 {
            let mut pcr_bytes = [0u8; 6];
            pcr_bytes.copy_from_slice(&packet[6..12]);
            let pcr = bits::parse_pcr(&pcr_bytes).as_27mhz();
            let new_pcr = (pcr as i64 - pcr_delta).max(0) as u64;
            let mut out = pcr_bytes;
            bits::encode_pcr_into(&mut out, bits::PcrTimestamp::from_27mhz(new_pcr));
            packet[6..12].copy_from_slice(&out);
        }
    }
    if payload_start + 14 > packet.len() {
        return;
    }
    let payload = &packet[payload_start..];
    if payload.len() < 9 || !bits::is_start_code(&[payload[0], payload[1], payload[2]]) {
        return;
    }
    let opt = PesOptionalHeader::from_bytes([payload[6], payload[7], payload[8]]);
    let pts_delta = pcr_delta / 300;
    if opt.has_pts() {
        let off = payload_start + 9;
        rewrite_one_timestamp(packet, off, pts_delta);
    }
    if opt.has_dts() {
        let off = payload_start + 14;
        if off + 5 <= packet.len() {
            rewrite_one_timestamp(packet, off, pts_delta);
        }
    }
}

fn rewrite_one_timestamp(packet: &mut [u8; 188], off: usize, delta: i64) {
    let mut bytes = [0u8; 5];
    bytes.copy_from_slice(&packet[off..off + 5]);
    let ts = bits::parse_timestamp(&bytes) & ((1u64 << 33) - 1);
    let new_ts = ((ts as i64 - delta).max(0) as u64) & ((1u64 << 33) - 1);
    bits::encode_timestamp_into(&mut bytes, new_ts);
    packet[off..off + 5].copy_from_slice(&bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FrameCodec;
    use crate::pidinfo::{PidInfoManager, StreamType, VideoCodec};

    fn frame(n: u32, start: u64, end: u64, dangling: u64, pts: u64, pcr: u64) -> FrameInfo {
        FrameInfo {
            frame_num: n,
            stream_offset_start: start,
            stream_offset_end: end,
            stream_offset_dangling_bframe: dangling,
            pts,
            dts: pts,
            pcr,
            codec: FrameCodec::Mpeg2,
        }
    }

    fn packet(pid: u16, pusi: bool, has_adaptation: bool, cc: u8) -> [u8; 188] {
        use crate::bits::PacketHeader;
        let header = PacketHeader::new()
            .with_sync_byte(0x47)
            .with_pusi(pusi)
            .with_pid(pid)
            .with_has_adaptation_field(has_adaptation)
            .with_has_payload(true)
            .with_continuity_counter(cc);
        let mut packet = [0xFFu8; 188];
        packet[0..4].copy_from_slice(&header.into_bytes());
        if has_adaptation {
            packet[4] = 183;
        }
        packet
    }

    #[test]
    fn no_slices_reproduces_input_continuity_byte_for_byte() {
        let frames = vec![
            frame(0, 0, 1880, 0, 0, 0),
            frame(1, 1880, 3760, 1880, 90_000, 27_000_000),
        ];
        let slices = SliceList::new();
        let mut engine = RewriteEngine::new(&slices, &frames, 3760, Some(0x100), HashSet::new());
        let pids = PidInfoManager::new();

        let mut out = Vec::new();
        let mut sink = |bytes: &[u8]| {
            out.extend_from_slice(bytes);
            true
        };

        let p0 = packet(0x100, true, false, 5);
        assert!(engine.process_packet(&pids, &p0, 0, &mut sink));
        let p1 = packet(0x100, false, false, 6);
        assert!(engine.process_packet(&pids, &p1, 188, &mut sink));
        engine.finish(&mut sink);

        assert_eq!(out.len(), 376);
        assert_eq!(out[3] & 0x0F, 5);
        assert_eq!(out[188 + 3] & 0x0F, 6);
    }

    #[test]
    fn cut_region_is_dropped() {
        let frames = vec![
            frame(0, 0, 188, 0, 0, 0),
            frame(1, 188, 376, 188, 90_000, 27_000_000),
            frame(2, 376, 564, 376, 180_000, 54_000_000),
        ];
        let mut slices = SliceList::new();
        slices.add_slice(&frames, 564, 1, 2);
        let mut engine = RewriteEngine::new(&slices, &frames, 564, Some(0x100), HashSet::new());
        let pids = PidInfoManager::new();

        let mut out = Vec::new();
        let mut sink = |bytes: &[u8]| {
            out.extend_from_slice(bytes);
            true
        };

        let p_mid = packet(0x100, true, false, 1);
        assert!(engine.process_packet(&pids, &p_mid, 188, &mut sink));
        engine.finish(&mut sink);

        assert!(out.is_empty());
    }

    /// A video packet carrying a real adaptation-field PCR and a PES PTS, for the delta-rewrite
    /// tests below. Layout: 4-byte header, 7-byte adaptation field (flags + PCR), 14-byte PES
    /// header with a lone PTS.
    fn video_packet(pid: u16, cc: u8, pts: u64, pcr: u64) -> [u8; 188] {
        use crate::bits::PacketHeader;
        let header = PacketHeader::new()
            .with_sync_byte(0x47)
            .with_pusi(true)
            .with_pid(pid)
            .with_has_adaptation_field(true)
            .with_has_payload(true)
            .with_continuity_counter(cc);
        let mut packet = [0u8; 188];
        packet[0..4].copy_from_slice(&header.into_bytes());
        packet[4] = 7;
        packet[5] = 0x10; // has_pcr
        let mut pcr_bytes = [0u8; 6];
        bits::encode_pcr_into(&mut pcr_bytes, bits::PcrTimestamp::from_27mhz(pcr));
        packet[6..12].copy_from_slice(&pcr_bytes);

        packet[12..15].copy_from_slice(&[0x00, 0x00, 0x01]);
        packet[15] = 0xE0; // video stream_id
        packet[18] = 0x80; // marker_bits '10'
        packet[19] = 0x80; // has_pts
        packet[20] = 5; // additional_header_length
        let mut ts_bytes = [0x21, 0x00, 0x01, 0x00, 0x01];
        bits::encode_timestamp_into(&mut ts_bytes, pts);
        packet[21..26].copy_from_slice(&ts_bytes);
        packet
    }

    fn read_pts(packet: &[u8; 188]) -> u64 {
        let bytes: [u8; 5] = packet[21..26].try_into().unwrap();
        bits::parse_timestamp(&bytes)
    }

    fn read_pcr(packet: &[u8; 188]) -> u64 {
        let bytes: [u8; 6] = packet[6..12].try_into().unwrap();
        bits::parse_pcr(&bytes).as_27mhz()
    }

    #[test]
    fn cut_rewrites_pcr_and_pts_by_the_removed_span() {
        let frames = vec![
            frame(0, 0, 188, 0, 0, 0),
            frame(1, 188, 376, 188, 90_000, 27_000_000),
            frame(2, 376, 564, 376, 180_000, 54_000_000),
            frame(3, 564, 752, 564, 270_000, 81_000_000),
        ];
        let mut slices = SliceList::new();
        slices.add_slice(&frames, 752, 1, 3);
        let mut engine = RewriteEngine::new(&slices, &frames, 752, Some(0x100), HashSet::new());
        let mut pids = PidInfoManager::new();
        pids.assign_stream_type(0x100, StreamType::Video(VideoCodec::Mpeg2));

        let mut out = Vec::new();
        let mut sink = |bytes: &[u8]| {
            out.extend_from_slice(bytes);
            true
        };

        let p0 = video_packet(0x100, 0, 0, 0);
        assert!(engine.process_packet(&pids, &p0, 0, &mut sink));
        let p_cut = video_packet(0x100, 1, 90_000, 27_000_000);
        assert!(engine.process_packet(&pids, &p_cut, 188, &mut sink));
        let p_after = video_packet(0x100, 2, 270_000, 81_000_000);
        assert!(engine.process_packet(&pids, &p_after, 564, &mut sink));
        engine.finish(&mut sink);

        // Only the two packets outside the cut frames [1, 3) survive.
        assert_eq!(out.len(), 376);
        let kept: &[u8; 188] = out[188..376].try_into().unwrap();

        // The resumed frame's PTS/PCR land exactly where frame 1's did: the rewritten value is
        // the original minus the removed span (frame 3's clock minus frame 1's), i.e. frame 1's
        // own clock value, so playback continues with no gap.
        assert_eq!(read_pts(kept), 90_000);
        assert_eq!(read_pcr(kept), 27_000_000);
    }
}
