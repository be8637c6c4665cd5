//! PAT/PMT (Program Specific Information) parsing, with CRC32 validation and reassembly across
//! packet boundaries.

use crate::error::{ParseErrorDetails, ParseResult};
use crate::read_bitfield;
use crate::slice_reader::SliceReader;
use crc::{Crc, Digest, CRC_32_MPEG_2};
use log::warn;
use modular_bitfield_msb::prelude::*;
use smallvec::SmallVec;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);
type CrcDigest = Digest<'static, u32>;

/// Table id for the Program Association Table.
pub const TABLE_ID_PAT: u8 = 0x00;
/// Table id for the Program Map Table.
pub const TABLE_ID_PMT: u8 = 0x02;

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PsiHeader {
    pub table_id: B8,
    pub section_syntax_indicator: bool,
    pub private_bit: bool,
    pub reserved_bits: B2,
    #[skip]
    pub unused_bits: B2,
    pub section_length: B10,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PsiTableSyntax {
    pub table_id_extension: B16,
    pub reserved_bits: B2,
    pub version: B5,
    pub current_next_indicator: bool,
    pub section_num: B8,
    pub last_section_num: B8,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PatEntry {
    pub program_num: B16,
    pub reserved: B3,
    pub program_map_pid: B13,
}

/// A single TLV descriptor found in a PMT's program or elementary-stream descriptor loop.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Descriptor tag, see ISO/IEC 13818-1 Table 2-45 and the DVB SI specification for assigned
    /// values (e.g. `0x56` for the DVB teletext descriptor).
    pub tag: u8,
    /// Raw descriptor payload.
    pub data: SmallVec<[u8; 8]>,
}

impl Descriptor {
    fn new_from_reader(reader: &mut SliceReader) -> ParseResult<Self> {
        let tag_len = reader.read_array_ref::<2>()?;
        let mut data = SmallVec::<[u8; 8]>::new();
        data.extend_from_slice(reader.read(tag_len[1] as usize)?);
        Ok(Self {
            tag: tag_len[0],
            data,
        })
    }

    /// DVB teletext descriptor tag (ETSI EN 300 468).
    pub const TELETEXT_TAG: u8 = 0x56;
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PmtHeader {
    pub reserved: B3,
    pub pcr_pid: B13,
    pub reserved2: B4,
    #[skip]
    pub unused_bits: B2,
    pub program_info_length: B10,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct ElementaryStreamInfoHeader {
    pub stream_type: B8,
    pub reserved: B3,
    pub elementary_pid: B13,
    pub reserved2: B4,
    #[skip]
    pub unused_bits: B2,
    pub es_info_length: B10,
}

/// One entry in a PMT's elementary stream loop.
#[derive(Debug, Clone)]
pub struct ElementaryStreamInfo {
    /// Stream type and PID.
    pub header: ElementaryStreamInfoHeader,
    /// Descriptors attached to this stream (e.g. the teletext descriptor).
    pub es_descriptors: SmallVec<[Descriptor; 4]>,
}

impl ElementaryStreamInfo {
    /// True if a DVB teletext descriptor is attached to this stream.
    pub fn has_teletext_descriptor(&self) -> bool {
        self.es_descriptors
            .iter()
            .any(|d| d.tag == Descriptor::TELETEXT_TAG)
    }
}

/// Parsed Program Map Table.
#[derive(Debug, Clone)]
pub struct Pmt {
    /// PCR PID and program descriptor loop length.
    pub header: PmtHeader,
    /// Program-level descriptors.
    pub program_descriptors: Vec<Descriptor>,
    /// One entry per elementary stream carried by the program.
    pub es_infos: Vec<ElementaryStreamInfo>,
}

/// Table-specific content of a parsed PSI section.
#[derive(Debug, Clone)]
pub enum PsiData {
    /// Unrecognized table id; section payload kept verbatim (CRC already validated).
    Raw(Vec<u8>),
    /// Program Association Table: `(program_num, program_map_pid)` pairs via [`PatEntry`].
    Pat(Vec<PatEntry>),
    /// Program Map Table.
    Pmt(Pmt),
}

/// One fully reassembled and CRC-validated PSI section.
#[derive(Debug, Clone)]
pub struct Psi {
    /// Common section header.
    pub header: PsiHeader,
    /// Extended syntax header, present whenever `header.section_syntax_indicator()`.
    pub table_syntax: Option<PsiTableSyntax>,
    /// Table-specific payload.
    pub data: PsiData,
}

struct PendingSection {
    header: PsiHeader,
    table_syntax: Option<PsiTableSyntax>,
    hasher: CrcDigest,
    data: Vec<u8>,
    remaining: usize,
}

/// Reassembles PAT/PMT sections from a sequence of packet payloads on one PID.
///
/// Feed it every packet's payload (with the adaptation field already stripped) in packet order
/// via [`PsiReassembler::push`]; it returns `Some(Psi)` once a complete, CRC-valid section has
/// accumulated.
#[derive(Default)]
pub struct PsiReassembler {
    pending: Option<PendingSection>,
}

impl PsiReassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet's payload. `pusi` must be the packet header's payload-unit-start flag.
    pub fn push(&mut self, pusi: bool, payload: &[u8]) -> ParseResult<Option<Psi>> {
        if pusi {
            self.pending = None;
            let mut reader = SliceReader::new(payload);
            if reader.remaining_len() < 1 {
                warn!("short read of PSI pointer field");
                return Err(reader.make_error(ParseErrorDetails::BadPsiHeader));
            }
            let pointer_field = reader.read_u8()?;
            if reader.remaining_len() < pointer_field as usize {
                warn!("short read of PSI pointer filler");
                return Err(reader.make_error(ParseErrorDetails::BadPsiHeader));
            }
            reader.skip(pointer_field as usize)?;
            self.start_section(&mut reader)
        } else if let Some(pending) = &mut self.pending {
            let take = payload.len().min(pending.remaining);
            pending.hasher.update(&payload[..take]);
            pending.data.extend_from_slice(&payload[..take]);
            pending.remaining -= take;
            if pending.remaining == 0 {
                let pending = self.pending.take().unwrap();
                Ok(Some(Self::finish_section(pending)?))
            } else {
                Ok(None)
            }
        } else {
            /* Continuation packet with no pending section; likely resynchronized mid-stream. */
            Ok(None)
        }
    }

    fn start_section(&mut self, reader: &mut SliceReader) -> ParseResult<Option<Psi>> {
        if reader.remaining_len() < 3 {
            warn!("short read of PSI header");
            return Err(reader.make_error(ParseErrorDetails::BadPsiHeader));
        }
        let mut hasher = CRC.digest();
        let header_bytes = reader.read_array_ref::<3>()?;
        hasher.update(header_bytes);
        let header = PsiHeader::from_bytes(*header_bytes);
        let section_length = header.section_length() as usize;

        if section_length == 0 {
            return Ok(None);
        }

        let table_syntax = if header.section_syntax_indicator() {
            if reader.remaining_len() < 5 || section_length < 5 {
                warn!("short read of PSI table syntax");
                return Err(reader.make_error(ParseErrorDetails::BadPsiHeader));
            }
            let syntax_bytes = reader.read_array_ref::<5>()?;
            hasher.update(syntax_bytes);
            Some(PsiTableSyntax::from_bytes(*syntax_bytes))
        } else {
            None
        };

        let body_length = if table_syntax.is_some() {
            section_length - 5
        } else {
            section_length
        };
        if body_length < 4 {
            /* Must have room for at least the trailing CRC32. */
            warn!("PSI section too short for CRC32");
            return Err(reader.make_error(ParseErrorDetails::BadPsiHeader));
        }

        let mut pending = PendingSection {
            header,
            table_syntax,
            hasher,
            data: Vec::with_capacity(body_length),
            remaining: body_length,
        };
        let available = reader.remaining_len().min(pending.remaining);
        let chunk = reader.read(available)?;
        pending.hasher.update(chunk);
        pending.data.extend_from_slice(chunk);
        pending.remaining -= available;

        if pending.remaining == 0 {
            Ok(Some(Self::finish_section(pending)?))
        } else {
            self.pending = Some(pending);
            Ok(None)
        }
    }

    fn finish_section(mut pending: PendingSection) -> ParseResult<Psi> {
        let len_minus_crc = pending.data.len() - 4;
        // The CRC bytes were folded into the running hash above; recompute over the body only.
        let mut hasher = CRC.digest();
        hasher.update(&pending.data[..len_minus_crc]);
        let actual = hasher.finalize();
        let expected =
            u32::from_be_bytes(*SliceReader::new(&pending.data[len_minus_crc..]).read_array_ref::<4>()?);
        if expected != actual {
            warn!("PSI CRC32 mismatch (table_id {:#x})", pending.header.table_id());
            return Err(crate::error::ParseError {
                location: 0,
                details: ParseErrorDetails::PsiCrcMismatch,
            });
        }
        pending.data.truncate(len_minus_crc);

        let data = match pending.header.table_id() {
            TABLE_ID_PAT => {
                let mut reader = SliceReader::new(&pending.data);
                let mut entries = Vec::with_capacity(reader.remaining_len() / 4);
                while reader.remaining_len() >= 4 {
                    entries.push(PatEntry::from_bytes(*reader.read_array_ref::<4>()?));
                }
                PsiData::Pat(entries)
            }
            TABLE_ID_PMT => {
                let mut reader = SliceReader::new(&pending.data);
                let header = read_bitfield!(reader, PmtHeader);
                let mut pmt = Pmt {
                    header,
                    program_descriptors: Vec::new(),
                    es_infos: Vec::new(),
                };
                let mut info_reader =
                    reader.new_sub_reader(pmt.header.program_info_length() as usize)?;
                while info_reader.remaining_len() > 0 {
                    pmt.program_descriptors
                        .push(Descriptor::new_from_reader(&mut info_reader)?);
                }
                while reader.remaining_len() > 0 {
                    let es_header = read_bitfield!(reader, ElementaryStreamInfoHeader);
                    let mut es_info = ElementaryStreamInfo {
                        header: es_header,
                        es_descriptors: SmallVec::new(),
                    };
                    let mut es_reader =
                        reader.new_sub_reader(es_info.header.es_info_length() as usize)?;
                    while es_reader.remaining_len() > 0 {
                        es_info
                            .es_descriptors
                            .push(Descriptor::new_from_reader(&mut es_reader)?);
                    }
                    pmt.es_infos.push(es_info);
                }
                PsiData::Pmt(pmt)
            }
            _ => PsiData::Raw(pending.data),
        };

        Ok(Psi {
            header: pending.header,
            table_syntax: pending.table_syntax,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_pat_section(entries: &[(u16, u16)]) -> Vec<u8> {
        let mut body = Vec::new();
        let syntax = PsiTableSyntax::new()
            .with_table_id_extension(1)
            .with_version(0)
            .with_current_next_indicator(true)
            .with_section_num(0)
            .with_last_section_num(0);
        body.extend_from_slice(&syntax.into_bytes());
        for (program_num, pmt_pid) in entries {
            let entry = PatEntry::new()
                .with_program_num(*program_num)
                .with_program_map_pid(*pmt_pid);
            body.extend_from_slice(&entry.into_bytes());
        }
        let section_length = (body.len() + 4) as u16;
        let header = PsiHeader::new()
            .with_table_id(TABLE_ID_PAT)
            .with_section_syntax_indicator(true)
            .with_section_length(section_length);

        let mut section = Vec::new();
        section.extend_from_slice(&header.into_bytes());
        section.extend_from_slice(&body);
        let crc = CRC.checksum(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    #[test]
    fn parses_pat_in_single_packet() {
        let section = build_pat_section(&[(1, 0x100)]);
        let mut payload = vec![0u8]; // pointer field
        payload.extend_from_slice(&section);

        let mut reassembler = PsiReassembler::new();
        let psi = reassembler.push(true, &payload).unwrap().unwrap();
        match psi.data {
            PsiData::Pat(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].program_num(), 1);
                assert_eq!(entries[0].program_map_pid(), 0x100);
            }
            _ => panic!("expected PAT"),
        }
    }

    #[test]
    fn rejects_corrupted_crc() {
        let mut section = build_pat_section(&[(1, 0x100)]);
        let last = section.len() - 1;
        section[last] ^= 0xFF;
        let mut payload = vec![0u8];
        payload.extend_from_slice(&section);

        let mut reassembler = PsiReassembler::new();
        let err = reassembler.push(true, &payload).unwrap_err();
        assert_eq!(err.details, ParseErrorDetails::PsiCrcMismatch);
    }

    #[test]
    fn reassembles_section_split_across_packets() {
        let section = build_pat_section(&[(1, 0x100), (2, 0x200), (3, 0x300)]);
        let mut payload = vec![0u8];
        payload.extend_from_slice(&section);

        let split = payload.len() / 2;
        let (first, second) = payload.split_at(split);

        let mut reassembler = PsiReassembler::new();
        assert!(reassembler.push(true, first).unwrap().is_none());
        let psi = reassembler.push(false, second).unwrap().unwrap();
        match psi.data {
            PsiData::Pat(entries) => assert_eq!(entries.len(), 3),
            _ => panic!("expected PAT"),
        }
    }
}
