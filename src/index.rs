//! I-frame indexer: the PES reassembler wired up to the MPEG-2/H.264 picture scans, dangling-B
//! bookkeeping, and the incremental content hash — the core work done during `analyze`.

use crate::analyzer::{self, PacketHandler};
use crate::pes::{scan_h264_idr, scan_mpeg2_picture_type, PesReassembler, PictureCodingType};
use crate::pidinfo::{ClientId, PidInfo, StreamType, VideoCodec};
use sha1::{Digest, Sha1};

/// Sentinel for "no frame"; see [`crate::FRAME_ID_INVALID`].
pub const FRAME_ID_INVALID: u32 = u32::MAX;
/// Sentinel for "unknown timestamp"; see [`crate::TS_INVALID`].
pub const TS_INVALID: u64 = u64::MAX;

/// Which picture coding this [`FrameInfo`] was indexed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCodec {
    /// ISO/IEC 13818-2.
    Mpeg2,
    /// ISO/IEC 14496-10.
    H264,
}

/// One indexed I-frame (MPEG-2) or IDR (H.264) on the chosen video PID.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    /// Ascending frame number, starting at 0.
    pub frame_num: u32,
    /// Byte offset of the unit-start packet that began this frame's PES unit.
    pub stream_offset_start: u64,
    /// Byte offset one past the last packet of this frame's PES unit.
    pub stream_offset_end: u64,
    /// Byte offset a cut of this frame must actually begin at: either this frame's own start, or
    /// an earlier dangling B-frame's start if one preceded it undischarged.
    pub stream_offset_dangling_bframe: u64,
    /// Presentation timestamp, or [`TS_INVALID`] if the unit carried none.
    pub pts: u64,
    /// Decode timestamp, or [`TS_INVALID`] if the unit carried none.
    pub dts: u64,
    /// PCR sampled from the unit-start packet's adaptation field (27MHz units), or
    /// [`TS_INVALID`] if absent.
    pub pcr: u64,
    /// Which scan produced this entry.
    pub codec: FrameCodec,
}

/// Wires a [`PesReassembler`] on the first-seen video PID to the picture scans and produces the
/// ordered [`FrameInfo`] list, while hashing every packet for drift detection.
pub struct FrameIndexer {
    client: ClientId,
    video_pid: Option<u16>,
    video_codec: Option<VideoCodec>,
    reassembler: PesReassembler,
    dangling_bframe_start: Option<u64>,
    frames: Vec<FrameInfo>,
    hasher: Sha1,
}

impl FrameIndexer {
    /// Create an indexer. `client` is the [`ClientId`] reserved for analyze-time private state
    /// (unused today, kept so future per-PID analyze state has a slot to land in).
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            video_pid: None,
            video_codec: None,
            reassembler: PesReassembler::new(),
            dangling_bframe_start: None,
            frames: Vec::new(),
            hasher: Sha1::new(),
        }
    }

    /// The [`ClientId`] this indexer was constructed with.
    pub fn client_id(&self) -> ClientId {
        self.client
    }

    /// Indexed frames so far, in ascending `frame_num` order.
    pub fn frames(&self) -> &[FrameInfo] {
        &self.frames
    }

    /// The PID chosen as "the" video stream (first video PID seen), if any.
    pub fn video_pid(&self) -> Option<u16> {
        self.video_pid
    }

    /// Hex-encoded SHA-1 over every packet seen so far, without consuming the running hash.
    pub fn sha1_hex(&self) -> String {
        hex_encode(&self.hasher.clone().finalize())
    }

    /// Close out any PES unit still pending at end of stream.
    pub fn finish(&mut self, end_offset: u64) {
        if self.video_pid.is_none() {
            return;
        }
        let codec = self.video_codec;
        let frames = &mut self.frames;
        let dangling = &mut self.dangling_bframe_start;
        self.reassembler.finish(end_offset, |unit| {
            classify_and_push(codec.expect("video_codec set with video_pid"), unit, dangling, frames);
        });
    }

    fn handle_video_packet(&mut self, packet: &[u8; 188], offset: u64) {
        let (header, payload_start) = match analyzer::packet_header_and_payload(packet) {
            Ok(v) => v,
            Err(_) => return,
        };
        if !header.has_payload() || payload_start > packet.len() {
            return;
        }
        let pcr = analyzer::packet_pcr(packet).ok().flatten();
        let payload = &packet[payload_start..];
        let codec = self.video_codec.expect("video_codec set alongside video_pid");
        let frames = &mut self.frames;
        let dangling = &mut self.dangling_bframe_start;
        let _ = self
            .reassembler
            .push(header.pusi(), offset, pcr, payload, |unit| {
                classify_and_push(codec, unit, dangling, frames);
            });
    }
}

fn classify_and_push(
    codec: VideoCodec,
    unit: &crate::pes::PesUnit,
    dangling: &mut Option<u64>,
    frames: &mut Vec<FrameInfo>,
) {
    match codec {
        VideoCodec::Mpeg2 => match scan_mpeg2_picture_type(&unit.data) {
            Some(PictureCodingType::I) => {
                let dangling_start = dangling.take().unwrap_or(unit.packet_start);
                push_frame(frames, unit, dangling_start, FrameCodec::Mpeg2);
            }
            Some(PictureCodingType::P) => {
                *dangling = None;
            }
            Some(PictureCodingType::B) => {
                if dangling.is_none() {
                    *dangling = Some(unit.packet_start);
                }
            }
            Some(PictureCodingType::Other(_)) | None => {}
        },
        VideoCodec::H264 => {
            // The H.264 path does not classify P/B slices, so the dangling-B pointer is never
            // populated here; a cut always begins exactly at the IDR's own start.
            if scan_h264_idr(&unit.data) {
                push_frame(frames, unit, unit.packet_start, FrameCodec::H264);
            }
        }
    }
}

fn push_frame(
    frames: &mut Vec<FrameInfo>,
    unit: &crate::pes::PesUnit,
    dangling_start: u64,
    codec: FrameCodec,
) {
    frames.push(FrameInfo {
        frame_num: frames.len() as u32,
        stream_offset_start: unit.packet_start,
        stream_offset_end: unit.packet_end,
        stream_offset_dangling_bframe: dangling_start,
        pts: unit.pts.unwrap_or(TS_INVALID),
        dts: unit.dts.unwrap_or(TS_INVALID),
        pcr: unit.pcr.unwrap_or(TS_INVALID),
        codec,
    });
}

impl PacketHandler for FrameIndexer {
    fn handle_packet(&mut self, pid_info: &PidInfo, packet: &[u8; 188], offset: u64) -> bool {
        self.hasher.update(packet);

        if self.video_pid.is_none() {
            if let Some(StreamType::Video(codec)) = pid_info.stream_type() {
                self.video_pid = Some(pid_info.pid());
                self.video_codec = Some(codec);
            }
        }

        if Some(pid_info.pid()) == self.video_pid {
            self.handle_video_packet(packet, offset);
        }

        true
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{:02x}", b).unwrap();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pidinfo::PidInfoManager;

    fn mpeg2_video_packet(pusi: bool, cc: u8, body: &[u8]) -> [u8; 188] {
        use crate::bits::PacketHeader;
        let mut packet = [0xFFu8; 188];
        let header = PacketHeader::new()
            .with_sync_byte(0x47)
            .with_pusi(pusi)
            .with_pid(0x101)
            .with_has_payload(true)
            .with_continuity_counter(cc);
        packet[0..4].copy_from_slice(&header.into_bytes());
        packet[4..4 + body.len()].copy_from_slice(body);
        packet
    }

    fn pes_start(pic_type_byte: u8) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x00, 0x00];
        v.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x00, pic_type_byte]);
        v
    }

    #[test]
    fn indexes_i_frame_and_tracks_pid() {
        let mut pids = PidInfoManager::new();
        pids.assign_stream_type(0x101, StreamType::Video(VideoCodec::Mpeg2));

        let mut indexer = FrameIndexer::new(pids.register_client());
        let body = pes_start(0x08); // picture_coding_type = 1 (I)
        let packet = mpeg2_video_packet(true, 0, &body);
        let info = pids.get(0x101).unwrap();
        indexer.handle_packet(info, &packet, 0);
        indexer.finish(188);

        assert_eq!(indexer.video_pid(), Some(0x101));
        assert_eq!(indexer.frames().len(), 1);
        assert_eq!(indexer.frames()[0].codec, FrameCodec::Mpeg2);
    }

    #[test]
    fn dangling_b_is_attributed_to_next_i_frame() {
        let mut pids = PidInfoManager::new();
        pids.assign_stream_type(0x101, StreamType::Video(VideoCodec::Mpeg2));
        let mut indexer = FrameIndexer::new(pids.register_client());

        let b_body = pes_start(0x18); // coding_type = (0x18>>3)&7 = 3 (B)
        let b_packet = mpeg2_video_packet(true, 0, &b_body);
        let info = pids.get(0x101).unwrap();
        indexer.handle_packet(info, &b_packet, 0);

        let i_body = pes_start(0x08); // coding_type 1 (I)
        let i_packet = mpeg2_video_packet(true, 1, &i_body);
        let info = pids.get(0x101).unwrap();
        indexer.handle_packet(info, &i_packet, 188);
        indexer.finish(376);

        assert_eq!(indexer.frames().len(), 1);
        assert_eq!(indexer.frames()[0].stream_offset_dangling_bframe, 0);
        assert_eq!(indexer.frames()[0].stream_offset_start, 188);
    }
}
