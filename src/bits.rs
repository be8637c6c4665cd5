//! Wire-format bitfields and timestamp codecs shared by the PSI, PES, and rewriting layers.
//!
//! The packet and adaptation-field headers are read with [`crate::read_bitfield`] against a
//! [`crate::SliceReader`]; PCR/PTS/DTS use hand-rolled bit math (matching how these irregular,
//! non-byte-aligned fields are actually laid out) rather than a bitfield struct.

use modular_bitfield_msb::prelude::*;

/// TSC information used in a packet's payload.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BitfieldSpecifier)]
#[bits = 2]
pub enum TransportScramblingControl {
    /// Not scrambled.
    NotScrambled,
    /// Do not use.
    Reserved,
    /// Scrambled with even key.
    ScrambledEvenKey,
    /// Scrambled with odd key.
    ScrambledOddKey,
}

/// Link-layer header found at the start of every 188-byte MPEG-TS packet.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub sync_byte: B8,
    pub tei: bool,
    pub pusi: bool,
    pub priority: bool,
    pub pid: B13,
    pub tsc: TransportScramblingControl,
    pub has_adaptation_field: bool,
    pub has_payload: bool,
    pub continuity_counter: B4,
}

/// Packets may contain adaptation meta data in addition or in lieu of payload data. This header
/// specifies the particular type(s) of meta-data contained.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct AdaptationFieldHeader {
    pub length: B8,
    pub discontinuity: bool,
    pub random_access: bool,
    pub priority: bool,
    pub has_pcr: bool,
    pub has_opcr: bool,
    pub has_splice_countdown: bool,
    pub has_transport_private_data: bool,
    pub has_adaptation_field_extension: bool,
}

/// Fixed 6-byte header at the start of every PES packet.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PesHeader {
    pub start_code: B24,
    pub stream_id: B8,
    pub packet_length: B16,
}

/// Optional 3-byte header following [`PesHeader`] for all stream ids except padding/private
/// stream 2.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PesOptionalHeader {
    pub marker_bits: B2,
    pub scrambling_control: B2,
    pub priority: bool,
    pub data_alignment_indicator: bool,
    pub copyright: bool,
    pub original: bool,
    pub has_pts: bool,
    pub has_dts: bool,
    pub escr: bool,
    pub es_rate: bool,
    pub dsm_trick_mode: bool,
    pub has_additional_copy_info: bool,
    pub has_crc: bool,
    pub has_extension: bool,
    pub additional_header_length: B8,
}

/// Expands to [`format_args`] for a 90kHz timestamp of any integer type.
///
/// Format is <hours>:<minutes>:<seconds>:<90kHz-ticks>
#[macro_export]
macro_rules! pts_format_args {
    ($pts:expr) => {
        format_args!(
            "{}:{}:{}:{}",
            $pts / (90000 * 60 * 60),
            $pts / (90000 * 60) % 60,
            $pts / 90000 % 60,
            $pts % 90000
        )
    };
}

/// Program clock reference: a 33-bit 90kHz base plus a 9-bit 27MHz extension rolling over every
/// 300 counts to the base.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct PcrTimestamp {
    /// 33-bit 90kHz base clock.
    pub base: u64,
    /// 9-bit 27MHz extension.
    pub extension: u16,
}

impl PcrTimestamp {
    /// Full 27MHz value: `base * 300 + extension`.
    pub fn as_27mhz(&self) -> u64 {
        self.base * 300 + self.extension as u64
    }

    /// Build from a full 27MHz value, per `base = v / 300`, `extension = v % 300`.
    pub fn from_27mhz(v: u64) -> Self {
        Self {
            base: (v / 300) & ((1u64 << 33) - 1),
            extension: (v % 300) as u16,
        }
    }
}

/// Parse the 6-byte PCR (or OPCR) field of an adaptation field.
///
/// The 6 reserved bits between the base and the extension are ignored on read and left
/// untouched on write by [`encode_pcr_into`].
pub fn parse_pcr(b: &[u8; 6]) -> PcrTimestamp {
    let mut base: u64 = (b[0] as u64) << 25;
    base |= (b[1] as u64) << 17;
    base |= (b[2] as u64) << 9;
    base |= (b[3] as u64) << 1;
    base |= (b[4] as u64) >> 7;

    let mut extension: u16 = ((b[4] & 0x1) as u16) << 8;
    extension |= b[5] as u16;
    PcrTimestamp { base, extension }
}

/// Re-encode a PCR/OPCR into `out`, preserving the 6 reserved bits already present in `out[4]`.
pub fn encode_pcr_into(out: &mut [u8; 6], pcr: PcrTimestamp) {
    let reserved = out[4] & 0x7E;
    out[0] = (pcr.base >> 25) as u8;
    out[1] = (pcr.base >> 17) as u8;
    out[2] = (pcr.base >> 9) as u8;
    out[3] = (pcr.base >> 1) as u8;
    out[4] = (((pcr.base & 0x1) as u8) << 7) | reserved | (((pcr.extension >> 8) & 0x1) as u8);
    out[5] = (pcr.extension & 0xFF) as u8;
}

/// Parse a 33-bit 90kHz PTS or DTS from its 5-byte wire encoding.
pub fn parse_timestamp(b: &[u8; 5]) -> u64 {
    let mut ts: u64 = ((b[0] & 0x0E) as u64) << 29;
    ts |= (b[1] as u64) << 22;
    ts |= ((b[2] & 0xFE) as u64) << 14;
    ts |= (b[3] as u64) << 7;
    ts |= ((b[4] & 0xFE) as u64) >> 1;
    ts
}

/// Re-encode a 33-bit 90kHz PTS or DTS into `out`, preserving the 4-bit prefix nibble in `out[0]`
/// (`0010` for a lone PTS, `0011`/`0001` for a PTS/DTS pair) and the marker bits already present
/// at the low bit of `out[0]`, `out[2]`, and `out[4]`.
pub fn encode_timestamp_into(out: &mut [u8; 5], ts: u64) {
    let m0 = out[0] & 0x01;
    let m2 = out[2] & 0x01;
    let m4 = out[4] & 0x01;
    out[0] = (out[0] & 0xF0) | (((ts >> 30) as u8 & 0x07) << 1) | m0;
    out[1] = (ts >> 22) as u8;
    out[2] = (((ts >> 15) as u8 & 0x7F) << 1) | m2;
    out[3] = (ts >> 7) as u8;
    out[4] = (((ts & 0x7F) as u8) << 1) | m4;
}

/// True if `b` is a start code prefix (`00 00 01`), as used by both PES packets and H.264 NAL
/// units.
pub fn is_start_code(b: &[u8; 3]) -> bool {
    b[0] == 0 && b[1] == 0 && b[2] == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_header_round_trips() {
        let header = PacketHeader::new()
            .with_sync_byte(0x47)
            .with_pusi(true)
            .with_pid(0x100)
            .with_tsc(TransportScramblingControl::NotScrambled)
            .with_has_payload(true)
            .with_continuity_counter(5);
        let bytes = header.into_bytes();
        let back = PacketHeader::from_bytes(bytes);
        assert_eq!(back.sync_byte(), 0x47);
        assert!(back.pusi());
        assert_eq!(back.pid(), 0x100);
        assert_eq!(back.continuity_counter(), 5);
    }

    #[test]
    fn pcr_round_trips() {
        let pcr = PcrTimestamp {
            base: 0x1_FFFF_FFFF,
            extension: 0x1AB,
        };
        let mut bytes = [0u8; 6];
        encode_pcr_into(&mut bytes, pcr);
        assert_eq!(parse_pcr(&bytes), pcr);
    }

    #[test]
    fn pcr_preserves_reserved_bits() {
        let mut bytes = [0u8, 0, 0, 0, 0x7E, 0];
        encode_pcr_into(&mut bytes, PcrTimestamp { base: 0, extension: 0 });
        assert_eq!(bytes[4] & 0x7E, 0x7E);
    }

    #[test]
    fn timestamp_round_trips_and_preserves_markers() {
        let mut bytes = [0x21, 0x00, 0x01, 0x00, 0x01];
        let ts = 12_345_678_u64 & ((1 << 33) - 1);
        encode_timestamp_into(&mut bytes, ts);
        assert_eq!(parse_timestamp(&bytes), ts);
        assert_eq!(bytes[0] & 0xF0, 0x20);
        assert_eq!(bytes[0] & 0x01, 1);
        assert_eq!(bytes[2] & 0x01, 1);
        assert_eq!(bytes[4] & 0x01, 1);
    }

    #[test]
    fn as_27mhz_round_trip() {
        let pcr = PcrTimestamp::from_27mhz(27_000_299);
        assert_eq!(pcr.base, 90_000);
        assert_eq!(pcr.extension, 299);
        assert_eq!(pcr.as_27mhz(), 27_000_299);
    }
}
