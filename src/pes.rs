//! PES (Packetized Elementary Stream) reassembly and the picture-level scans the I-frame indexer
//! runs over a completed unit.

use crate::bits::{self, PesHeader, PesOptionalHeader};
use crate::error::ParseResult;
use crate::read_bitfield;
use crate::slice_reader::SliceReader;

/// One reassembled PES unit: every packet on a PID between two unit-starts.
#[derive(Debug, Clone, Default)]
pub struct PesUnit {
    /// Byte offset of the unit-start packet that began this unit.
    pub packet_start: u64,
    /// Byte offset one past the last packet belonging to this unit.
    pub packet_end: u64,
    /// Presentation timestamp read from the PES optional header, if present.
    pub pts: Option<u64>,
    /// Decode timestamp read from the PES optional header, if present.
    pub dts: Option<u64>,
    /// PCR (27MHz units, `base*300+ext`) sampled from the unit-start packet's adaptation field.
    pub pcr: Option<u64>,
    /// Reassembled elementary-stream payload (PES header stripped).
    pub data: Vec<u8>,
    /// Set once a following unit-start (or end of stream) closes this unit out.
    pub complete: bool,
}

impl PesUnit {
    fn reset(&mut self, packet_start: u64, pcr: Option<u64>) {
        self.packet_start = packet_start;
        self.packet_end = packet_start;
        self.pts = None;
        self.dts = None;
        self.pcr = pcr;
        self.data.clear();
        self.complete = false;
    }
}

fn parse_pes_optional(reader: &mut SliceReader, unit: &mut PesUnit) -> ParseResult<usize> {
    let pes_optional: PesOptionalHeader = read_bitfield!(reader, PesOptionalHeader);
    let additional_length = pes_optional.additional_header_length() as usize;
    let mut o_reader = reader.new_sub_reader(additional_length)?;

    if pes_optional.has_pts() && o_reader.remaining_len() >= 5 {
        unit.pts = Some(bits::parse_timestamp(o_reader.read_array_ref::<5>()?));
    }
    if pes_optional.has_dts() && o_reader.remaining_len() >= 5 {
        unit.dts = Some(bits::parse_timestamp(o_reader.read_array_ref::<5>()?));
    }
    Ok(3 + additional_length)
}

/// Reassembles one PID's PES units from a sequence of packet payloads, invoking a callback with
/// every unit as soon as the following unit-start (or [`PesReassembler::finish`]) closes it out.
///
/// The payload buffer is cleared and reused across units rather than reallocated, since hundreds
/// of thousands of units are typical for one recording.
#[derive(Debug, Default)]
pub struct PesReassembler {
    unit: PesUnit,
    have_start: bool,
}

impl PesReassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet's post-adaptation-field payload.
    ///
    /// `pcr`, if given, is the 27MHz PCR sampled from this packet's adaptation field; it is only
    /// retained when the packet also carries unit-start.
    pub fn push<F: FnMut(&PesUnit)>(
        &mut self,
        pusi: bool,
        offset: u64,
        pcr: Option<u64>,
        payload: &[u8],
        mut on_complete: F,
    ) -> ParseResult<()> {
        if pusi {
            if self.have_start {
                self.unit.packet_end = offset;
                self.unit.complete = true;
                on_complete(&self.unit);
            }
            self.unit.reset(offset, pcr);
            self.have_start = true;

            let mut reader = SliceReader::new(payload);
            if reader.remaining_len() >= 6 && bits::is_start_code(reader.peek_array_ref::<3>()?) {
                let pes_header: PesHeader = read_bitfield!(reader, PesHeader);
                let pes_length = pes_header.packet_length() as usize;
                if pes_length >= 3 && pes_header.stream_id() != 0xBF && reader.remaining_len() >= 3
                {
                    parse_pes_optional(&mut reader, &mut self.unit)?;
                }
                self.unit.data.extend_from_slice(reader.read_to_end()?);
            } else {
                self.unit.data.extend_from_slice(payload);
            }
        } else if self.have_start {
            self.unit.data.extend_from_slice(payload);
        }
        Ok(())
    }

    /// Close out any pending unit at end of stream.
    pub fn finish<F: FnOnce(&PesUnit)>(&mut self, end_offset: u64, on_complete: F) {
        if self.have_start {
            self.unit.packet_end = end_offset;
            self.unit.complete = true;
            on_complete(&self.unit);
            self.have_start = false;
        }
    }
}

/// MPEG-2 `picture_coding_type` (ISO/IEC 13818-2 6.2.3), classifying one coded picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureCodingType {
    /// Intra-coded.
    I,
    /// Predictive-coded.
    P,
    /// Bidirectionally predictive-coded.
    B,
    /// Reserved or D-picture values, not used by the indexer.
    Other(u8),
}

impl From<u8> for PictureCodingType {
    fn from(v: u8) -> Self {
        match v {
            1 => PictureCodingType::I,
            2 => PictureCodingType::P,
            3 => PictureCodingType::B,
            other => PictureCodingType::Other(other),
        }
    }
}

fn find_start_code_with_id(data: &[u8], start: usize, id: u8) -> Option<usize> {
    if data.len() < start + 4 {
        return None;
    }
    data[start..]
        .windows(4)
        .position(|w| w[0] == 0 && w[1] == 0 && w[2] == 1 && w[3] == id)
        .map(|i| start + i)
}

/// Scan an MPEG-2 video PES payload for its first picture_start_code (`00 00 01 00`) and return
/// the picture's coding type, if found.
pub fn scan_mpeg2_picture_type(data: &[u8]) -> Option<PictureCodingType> {
    let offset = find_start_code_with_id(data, 0, 0x00)?;
    let byte5 = *data.get(offset + 5)?;
    Some(PictureCodingType::from((byte5 >> 3) & 0x07))
}

/// Scan an H.264 video PES payload for a NAL unit whose `nal_unit_type` (low 5 bits of the byte
/// following the start code) is 5 (IDR slice).
pub fn scan_h264_idr(data: &[u8]) -> bool {
    let mut pos = 0;
    while pos + 4 <= data.len() {
        match data[pos..]
            .windows(3)
            .position(|w| w[0] == 0 && w[1] == 0 && w[2] == 1)
        {
            Some(rel) => {
                let start = pos + rel;
                if let Some(&nal_byte) = data.get(start + 3) {
                    if nal_byte & 0x1f == 5 {
                        return true;
                    }
                }
                pos = start + 3;
            }
            None => break,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pes_packet(stream_id: u8, pts: Option<u64>, payload: &[u8]) -> Vec<u8> {
        let mut optional_len = 0;
        let mut optional = Vec::new();
        let mut flags = PesOptionalHeader::new().with_marker_bits(0b10);
        if let Some(pts) = pts {
            flags = flags.with_has_pts(true);
            let mut bytes = [0x21, 0, 0x01, 0, 0x01];
            bits::encode_timestamp_into(&mut bytes, pts);
            optional.extend_from_slice(&bytes);
        }
        flags = flags.with_additional_header_length(optional.len() as u8);
        optional_len += 3 + optional.len();

        let header = PesHeader::new()
            .with_start_code(1)
            .with_stream_id(stream_id)
            .with_packet_length((optional_len + payload.len()) as u16);

        let mut out = Vec::new();
        out.extend_from_slice(&header.into_bytes());
        out.extend_from_slice(&flags.into_bytes());
        out.extend_from_slice(&optional);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn reassembles_unit_across_two_packets() {
        let mpeg2_i_picture = [0x00, 0x00, 0x01, 0x00, 0x00, 0x08]; // coding_type = (0x08>>3)&7 = 1
        let packet = pes_packet(0xE0, Some(90_000), &mpeg2_i_picture);
        let (first, second) = packet.split_at(packet.len() / 2);

        let mut reassembler = PesReassembler::new();
        let mut completed = Vec::new();
        reassembler
            .push(true, 0, Some(27_000_000), first, |u| completed.push(u.clone()))
            .unwrap();
        reassembler.push(false, 188, None, second, |u| completed.push(u.clone())).unwrap();
        assert!(completed.is_empty());

        reassembler.finish(376, |u| completed.push(u.clone()));
        assert_eq!(completed.len(), 1);
        let unit = &completed[0];
        assert_eq!(unit.pts, Some(90_000));
        assert_eq!(unit.pcr, Some(27_000_000));
        assert_eq!(scan_mpeg2_picture_type(&unit.data), Some(PictureCodingType::I));
    }

    #[test]
    fn closes_previous_unit_on_next_unit_start() {
        let payload_a = pes_packet(0xE0, None, &[0x00, 0x00, 0x01, 0x00, 0, 0x08]);
        let payload_b = pes_packet(0xE0, None, &[0x00, 0x00, 0x01, 0x00, 0, 0x10]);

        let mut reassembler = PesReassembler::new();
        let mut completed = Vec::new();
        reassembler.push(true, 0, None, &payload_a, |u| completed.push(u.clone())).unwrap();
        reassembler.push(true, 188, None, &payload_b, |u| completed.push(u.clone())).unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].packet_start, 0);
        assert_eq!(completed[0].packet_end, 188);
    }

    #[test]
    fn detects_h264_idr() {
        let data = [0x00, 0x00, 0x01, 0x65, 0xAA];
        assert!(scan_h264_idr(&data));
        let data_non_idr = [0x00, 0x00, 0x01, 0x61, 0xAA];
        assert!(!scan_h264_idr(&data_non_idr));
    }
}
