//! Transport-level packet analyzer: resynchronizes a raw byte stream onto 188-byte packet
//! boundaries, keeps the PID registry's stream types current from PAT/PMT, and dispatches every
//! packet to a caller-supplied handler.

use crate::bits::PacketHeader;
use crate::error::{ParseErrorDetails, ParseResult};
use crate::pidinfo::{ClientId, PidInfo, PidInfoManager, StreamType};
use crate::psi::{PsiData, PsiReassembler};
use crate::read_bitfield;
use crate::slice_reader::SliceReader;
use log::warn;

/// Receives every packet the analyzer decodes, in increasing byte-offset order.
///
/// Returning `false` stops the analyzer's current [`TransportAnalyzer::push_buffer`] call (and,
/// if propagated by the caller's read loop, the whole pass) without processing further packets —
/// used by the random-access I-frame fetch to short-circuit once it has what it needs.
pub trait PacketHandler {
    /// Handle one packet. Return `false` to stop the pass.
    fn handle_packet(&mut self, pid_info: &PidInfo, packet: &[u8; 188], offset: u64) -> bool;
}

impl<F: FnMut(&PidInfo, &[u8; 188], u64) -> bool> PacketHandler for F {
    fn handle_packet(&mut self, pid_info: &PidInfo, packet: &[u8; 188], offset: u64) -> bool {
        self(pid_info, packet, offset)
    }
}

/// PID 0x1FFF carries no payload of interest; reserved for null/stuffing packets.
pub const NULL_PID: u16 = 0x1FFF;

/// Resynchronizing, PAT/PMT-aware transport-stream packet analyzer.
///
/// Operates on a [`PidInfoManager`] owned elsewhere (the [`crate::snipper::Snipper`]) so that
/// multiple analyzer instances — the main analyze pass and the random-access fetch — can share
/// one registry and its accumulated stream types.
pub struct TransportAnalyzer {
    psi_client: ClientId,
    pmt_pid: Option<u16>,
    buffer: Vec<u8>,
    offset: u64,
}

impl TransportAnalyzer {
    /// Create a fresh analyzer. `psi_client` is the [`ClientId`] this analyzer uses to stash its
    /// PAT/PMT reassembly state as PID-registry private data.
    pub fn new(psi_client: ClientId) -> Self {
        Self {
            psi_client,
            pmt_pid: None,
            buffer: Vec::new(),
            offset: 0,
        }
    }

    /// Running byte offset of the next packet this analyzer will hand to its handler.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// PMT PID discovered from the PAT so far, if any.
    pub fn pmt_pid(&self) -> Option<u16> {
        self.pmt_pid
    }

    /// Feed raw bytes (of any length/alignment) into the analyzer. Returns `false` if the
    /// handler requested a stop.
    pub fn push_buffer(
        &mut self,
        pids: &mut PidInfoManager,
        bytes: &[u8],
        handler: &mut dyn PacketHandler,
    ) -> bool {
        self.buffer.extend_from_slice(bytes);
        self.process(pids, handler)
    }

    fn process(&mut self, pids: &mut PidInfoManager, handler: &mut dyn PacketHandler) -> bool {
        loop {
            if self.buffer.len() < 188 {
                return true;
            }
            if self.buffer[0] != 0x47 {
                match self.buffer[1..].iter().position(|&b| b == 0x47) {
                    Some(rel) => {
                        warn!("lost sync, dropping {} bytes", rel + 1);
                        self.buffer.drain(0..rel + 1);
                        continue;
                    }
                    None => {
                        self.buffer.clear();
                        return true;
                    }
                }
            }
            // Require a second sync byte 188 later when enough data is buffered, to reject a
            // coincidental 0x47 inside garbage data.
            if self.buffer.len() >= 189 && self.buffer[188] != 0x47 {
                self.buffer.drain(0..1);
                continue;
            }

            let mut packet = [0u8; 188];
            packet.copy_from_slice(&self.buffer[0..188]);
            self.buffer.drain(0..188);
            let offset = self.offset;
            self.offset += 188;

            if !self.process_packet(pids, &packet, offset, handler) {
                return false;
            }
        }
    }

    fn process_packet(
        &mut self,
        pids: &mut PidInfoManager,
        packet: &[u8; 188],
        offset: u64,
        handler: &mut dyn PacketHandler,
    ) -> bool {
        match header_and_payload_start(packet) {
            Ok((header, payload_start)) => {
                let pid = header.pid();
                pids.get_or_create(pid);

                if header.has_payload() && payload_start <= packet.len() {
                    let payload = &packet[payload_start..];
                    if pid == 0 {
                        self.handle_pat(pids, header.pusi(), payload);
                    } else if self.pmt_pid == Some(pid) {
                        self.handle_pmt(pids, header.pusi(), payload);
                    }
                }

                let info = pids.get(pid).expect("just created above");
                handler.handle_packet(info, packet, offset)
            }
            Err(e) => {
                warn!("packet parse error at offset {}: {:?}", offset, e);
                true
            }
        }
    }

    fn handle_pat(&mut self, pids: &mut PidInfoManager, pusi: bool, payload: &[u8]) {
        let reassembler =
            pids.get_private_or_insert_with(0, self.psi_client, PsiReassembler::new);
        match reassembler.push(pusi, payload) {
            Ok(Some(psi)) => {
                if let PsiData::Pat(entries) = psi.data {
                    if let Some(entry) = entries.iter().find(|e| e.program_num() != 0) {
                        self.pmt_pid = Some(entry.program_map_pid());
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!("malformed PAT: {:?}", e),
        }
        pids.assign_stream_type(0, StreamType::Pat);
    }

    fn handle_pmt(&mut self, pids: &mut PidInfoManager, pusi: bool, payload: &[u8]) {
        let pmt_pid = match self.pmt_pid {
            Some(p) => p,
            None => return,
        };
        let reassembler =
            pids.get_private_or_insert_with(pmt_pid, self.psi_client, PsiReassembler::new);
        match reassembler.push(pusi, payload) {
            Ok(Some(psi)) => {
                if let PsiData::Pmt(pmt) = psi.data {
                    for es in &pmt.es_infos {
                        let has_teletext = es.has_teletext_descriptor();
                        let stream_type =
                            StreamType::from_pmt(es.header.stream_type(), has_teletext);
                        pids.assign_stream_type(es.header.elementary_pid(), stream_type);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!("malformed PMT: {:?}", e),
        }
        pids.assign_stream_type(pmt_pid, StreamType::Pmt);
    }
}

/// Parse the link-layer header and compute the payload's starting offset within `packet`.
pub fn packet_header_and_payload(packet: &[u8; 188]) -> ParseResult<(PacketHeader, usize)> {
    header_and_payload_start(packet)
}

fn header_and_payload_start(packet: &[u8; 188]) -> ParseResult<(PacketHeader, usize)> {
    let mut reader = SliceReader::new(packet);
    let header: PacketHeader = read_bitfield!(reader, PacketHeader);
    if header.sync_byte() != 0x47 {
        return Err(reader.make_error(ParseErrorDetails::LostSync));
    }
    let mut payload_start = 4;
    if header.has_adaptation_field() {
        if packet.len() < 5 {
            return Err(reader.make_error(ParseErrorDetails::BadAdaptationHeader));
        }
        let length = packet[4] as usize;
        payload_start = 5 + length;
        if payload_start > packet.len() {
            return Err(reader.make_error(ParseErrorDetails::BadAdaptationHeader));
        }
    }
    Ok((header, payload_start))
}

/// Extract the adaptation field's PCR (27MHz units), if the packet has one.
pub fn packet_pcr(packet: &[u8; 188]) -> ParseResult<Option<u64>> {
    let (header, _) = header_and_payload_start(packet)?;
    if !header.has_adaptation_field() || packet[4] == 0 {
        return Ok(None);
    }
    let afh = crate::bits::AdaptationFieldHeader::from_bytes([packet[4], packet[5]]);
    if !afh.has_pcr() || packet.len() < 12 {
        return Ok(None);
    }
    let mut pcr_bytes = [0u8; 6];
    pcr_bytes.copy_from_slice(&packet[6..12]);
    Ok(Some(crate::bits::parse_pcr(&pcr_bytes).as_27mhz()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_header_bytes(pid: u16, pusi: bool, cc: u8) -> [u8; 188] {
        let mut packet = [0xFFu8; 188];
        let header = PacketHeader::new()
            .with_sync_byte(0x47)
            .with_pusi(pusi)
            .with_pid(pid)
            .with_has_payload(true)
            .with_continuity_counter(cc);
        packet[0..4].copy_from_slice(&header.into_bytes());
        packet
    }

    #[test]
    fn resyncs_past_garbage_prefix() {
        let mut pids = PidInfoManager::new();
        let mut analyzer = TransportAnalyzer::new(pids.register_client());
        let mut garbage = vec![0xAAu8; 5];
        garbage.extend_from_slice(&packet_header_bytes(0x100, true, 0));
        garbage.extend_from_slice(&packet_header_bytes(0x100, false, 1));

        let mut seen = Vec::new();
        analyzer.push_buffer(&mut pids, &garbage, &mut |info: &PidInfo, _: &[u8; 188], off: u64| {
            seen.push((info.pid(), off));
            true
        });
        assert_eq!(seen, vec![(0x100, 0), (0x100, 188)]);
    }

    #[test]
    fn handler_stop_halts_processing() {
        let mut pids = PidInfoManager::new();
        let mut analyzer = TransportAnalyzer::new(pids.register_client());
        let mut buf = packet_header_bytes(0x100, true, 0).to_vec();
        buf.extend_from_slice(&packet_header_bytes(0x100, false, 1));

        let mut count = 0;
        let cont = analyzer.push_buffer(&mut pids, &buf, &mut |_: &PidInfo, _: &[u8; 188], _: u64| {
            count += 1;
            false
        });
        assert!(!cont);
        assert_eq!(count, 1);
    }
}
