//! Project store: a JSON document tying an input file's slices and disabled PIDs to a
//! [`Snipper`] instance, so editing sessions can be saved and resumed.

use crate::error::{Result, SnipperError};
use crate::snipper::Snipper;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
struct InputDocument {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha1: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProjectDocument {
    version: String,
    input: InputDocument,
    slices: Vec<(u32, u32)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    piddisable: Vec<u16>,
}

/// An editing session: the `Snipper` it was built from, plus the slice/PID-disable state that
/// gets round-tripped through the on-disk JSON document.
///
/// Holds a shared reference to its `Snipper` so the caller (e.g. a GUI) can keep its own clone
/// alive independently of the project's own lifetime.
pub struct Project {
    snipper: Arc<Snipper>,
    input_path: PathBuf,
    input_sha1: Option<String>,
    pending_slices: Vec<(u32, u32)>,
}

impl Project {
    /// Wrap an already-open `Snipper` as a fresh project with no saved slices.
    pub fn new(snipper: Arc<Snipper>) -> Self {
        let input_path = PathBuf::from(snipper.filename());
        Self {
            snipper,
            input_path,
            input_sha1: None,
            pending_slices: Vec::new(),
        }
    }

    /// Load a project document from `project_file`, opening the input file it names.
    ///
    /// The stored slice ranges are not applied yet — call [`Project::apply_slices`] after
    /// `analyze()` has populated the frame index.
    pub fn new_from_file(project_file: impl AsRef<Path>) -> Result<Self> {
        let project_file = project_file.as_ref();
        let text = std::fs::read_to_string(project_file)
            .map_err(|e| SnipperError::io(project_file.to_string_lossy(), e))?;
        let doc: ProjectDocument = serde_json::from_str(&text)?;

        let snipper = Arc::new(Snipper::open(&doc.input.path)?);
        for pid in &doc.piddisable {
            snipper.disable_pid(*pid);
        }

        Ok(Self {
            snipper,
            input_path: PathBuf::from(doc.input.path),
            input_sha1: doc.input.sha1,
            pending_slices: doc.slices,
        })
    }

    /// The `Snipper` this project is tracking.
    pub fn snipper(&self) -> &Arc<Snipper> {
        &self.snipper
    }

    /// Replace the tracked `Snipper`, discarding any slices read from a project file but not yet
    /// applied (mirrors re-pointing a project at a different already-open recording).
    pub fn set_snipper(&mut self, snipper: Arc<Snipper>) {
        self.input_path = PathBuf::from(snipper.filename());
        self.input_sha1 = None;
        self.pending_slices.clear();
        self.snipper = snipper;
    }

    /// `true` if no content hash was recorded, or it matches the `Snipper`'s computed SHA-1.
    pub fn validate(&self) -> bool {
        match (&self.input_sha1, self.snipper.sha1()) {
            (Some(saved), Some(current)) => *saved == current,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    /// Apply the slice ranges loaded from a project file onto the `Snipper`. Must be called after
    /// `analyze()` has run; a no-op once the pending list has been applied.
    pub fn apply_slices(&mut self) {
        for (begin, end) in self.pending_slices.drain(..) {
            self.snipper.add_slice(begin, end);
        }
    }

    /// Serialize the `Snipper`'s current slice list, disabled PIDs, and content hash to
    /// `project_file`.
    pub fn write(&self, project_file: impl AsRef<Path>) -> Result<()> {
        let project_file = project_file.as_ref();
        let mut slices = Vec::new();
        self.snipper.enum_slices(|s| slices.push((s.begin_frame, s.end_frame)));

        let doc = ProjectDocument {
            version: SCHEMA_VERSION.to_string(),
            input: InputDocument {
                path: self.input_path.to_string_lossy().into_owned(),
                sha1: self.snipper.sha1(),
            },
            slices,
            piddisable: {
                let mut pids: Vec<u16> = self.snipper.disabled_pids().into_iter().collect();
                pids.sort_unstable();
                pids
            },
        };

        let text = serde_json::to_string_pretty(&doc)?;
        std::fs::write(project_file, text)
            .map_err(|e| SnipperError::io(project_file.to_string_lossy(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn mpeg2_i_frame_packet(pusi: bool, pid: u16, cc: u8, pts: u64) -> [u8; 188] {
        use crate::bits::{self, PesHeader, PesOptionalHeader};
        let mut packet = [0xFFu8; 188];
        let header = crate::bits::PacketHeader::new()
            .with_sync_byte(0x47)
            .with_pusi(pusi)
            .with_pid(pid)
            .with_has_payload(true)
            .with_continuity_counter(cc);
        packet[0..4].copy_from_slice(&header.into_bytes());
        if !pusi {
            return packet;
        }
        let mut pts_bytes = [0x21, 0, 0x01, 0, 0x01];
        bits::encode_timestamp_into(&mut pts_bytes, pts);
        let optional = PesOptionalHeader::new()
            .with_marker_bits(0b10)
            .with_has_pts(true)
            .with_additional_header_length(5);
        let picture = [0x00, 0x00, 0x01, 0x00, 0x00, 0x08];
        let pes_header = PesHeader::new()
            .with_start_code(1)
            .with_stream_id(0xE0)
            .with_packet_length((3 + 5 + picture.len()) as u16);
        let mut payload = Vec::new();
        payload.extend_from_slice(&pes_header.into_bytes());
        payload.extend_from_slice(&optional.into_bytes());
        payload.extend_from_slice(&pts_bytes);
        payload.extend_from_slice(&picture);
        packet[4..4 + payload.len()].copy_from_slice(&payload);
        packet
    }

    fn sample_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&mpeg2_i_frame_packet(true, 0x101, 0, 0)).unwrap();
        file.write_all(&mpeg2_i_frame_packet(true, 0x101, 1, 90_000)).unwrap();
        file.write_all(&mpeg2_i_frame_packet(true, 0x101, 2, 180_000)).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn round_trip_through_a_saved_project_file() {
        let input = sample_file();
        let snipper = Arc::new(Snipper::open(input.path()).unwrap());
        snipper.analyze(|| true).unwrap();
        snipper.add_slice(1, 2);
        snipper.disable_pid(0x1FFF);

        let project = Project::new(snipper);
        let project_file = tempfile::NamedTempFile::new().unwrap();
        project.write(project_file.path()).unwrap();

        let mut reloaded = Project::new_from_file(project_file.path()).unwrap();
        assert!(reloaded.snipper().disabled_pids().contains(&0x1FFF));
        reloaded.snipper().analyze(|| true).unwrap();
        reloaded.apply_slices();

        let mut ranges = Vec::new();
        reloaded.snipper().enum_slices(|s| ranges.push((s.begin_frame, s.end_frame)));
        assert_eq!(ranges, vec![(1, 2)]);
        assert!(reloaded.validate());
    }

    #[test]
    fn validate_fails_when_input_has_changed() {
        let input = sample_file();
        let snipper = Arc::new(Snipper::open(input.path()).unwrap());
        snipper.analyze(|| true).unwrap();
        let mut project = Project::new(snipper);
        project.input_sha1 = Some("0".repeat(40));
        assert!(!project.validate());
    }
}
