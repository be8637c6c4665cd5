//! Lossless, frame-accurate cutting of MPEG-2 transport stream recordings.
//!
//! # Usage
//! Simply add this crate as a dependency in your `Cargo.toml`.
//!
//! ```toml
//! [dependencies]
//! ts-snip = "~0.1.0"
//! ```
//!
//! Open a recording, analyze it to build the I-frame index, cut out a range of frames, and
//! write the result:
//!
//! ```no_run
//! use ts_snip::Snipper;
//! use std::fs::File;
//! use std::io::Write;
//!
//! let snipper = Snipper::open("recording.ts").expect("open");
//! snipper.analyze(|| true).expect("analyze");
//! snipper.add_slice(100, 200);
//!
//! let mut out = File::create("trimmed.ts").expect("create");
//! let mut sink = |bytes: &[u8]| out.write_all(bytes).is_ok();
//! snipper.write(&mut sink).expect("write");
//! ```

#![deny(missing_docs, unsafe_code)]

mod slice_reader;
pub use slice_reader::SliceReader;

mod bits;
pub use bits::{
    AdaptationFieldHeader, PacketHeader, PcrTimestamp, PesHeader, PesOptionalHeader,
    TransportScramblingControl,
};

mod pidinfo;
pub use pidinfo::{AudioCodec, ClientId, PidInfo, PidInfoManager, StreamType, VideoCodec};

mod psi;
pub use psi::{
    Descriptor, ElementaryStreamInfo, ElementaryStreamInfoHeader, PatEntry, Pmt, PmtHeader, Psi,
    PsiData, PsiHeader, PsiTableSyntax,
};

mod pes;
pub use pes::{PesReassembler, PesUnit, PictureCodingType};

mod analyzer;
pub use analyzer::{packet_header_and_payload, PacketHandler, TransportAnalyzer, NULL_PID};

mod index;
pub use index::{FrameCodec, FrameIndexer, FrameInfo, FRAME_ID_INVALID, TS_INVALID};

mod slice;
pub use slice::{Slice, SliceList, SLICE_ID_INVALID};

mod writer;
pub use writer::{RewriteEngine, Sink};

mod snipper;
pub use snipper::{Snipper, State};

mod project;
pub use project::Project;

pub mod error;
pub use error::{Result, SnipperError};

// `pts_format_args!` is defined and `#[macro_export]`-ed from `bits`, landing at the crate root
// as `ts_snip::pts_format_args!`.
