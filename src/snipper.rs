//! `Snipper`: the lifecycle state machine and public API tying the analyzer, frame index, slice
//! list, and rewriting engine together over one open file.

use crate::analyzer::TransportAnalyzer;
use crate::error::{Result, SnipperError};
use crate::index::{FrameIndexer, FrameInfo, FRAME_ID_INVALID};
use crate::pes::PesReassembler;
use crate::pidinfo::{ClientId, PidInfo, PidInfoManager};
use crate::slice::{Slice, SliceList, SLICE_ID_INVALID};
use crate::writer::{RewriteEngine, Sink};
use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// Lifecycle state of a [`Snipper`], per the transitions a caller may drive it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No file is open yet. Never observed once [`Snipper::open`] returns.
    Uninitialized,
    /// File is open; no analyze pass has completed.
    Initialized,
    /// An `analyze` call is in progress.
    Analyzing,
    /// Analyze completed; slices and PID enable state may be edited, `write` may be called.
    Ready,
    /// A `write` call is in progress.
    Writing,
}

struct SnipperData {
    state: State,
    frames: Vec<FrameInfo>,
    slices: SliceList,
    sha1: Option<String>,
    video_pid: Option<u16>,
    pmt_pid: Option<u16>,
    disabled_pids: HashSet<u16>,
}

/// The file handle and PID registry: touched only by whichever of analyze/random-access-fetch/
/// write currently holds `file_lock`, so exactly one pass is ever reading the file at a time.
struct FileState {
    file: File,
    pid_manager: PidInfoManager,
    analyzer_client: ClientId,
    random_access_client: ClientId,
    // Reserved for future per-PID writer-side private state; the rewriting engine keeps its own
    // state today (see `writer::PidState`), but the registry still carries this third client id
    // to match the PID manager's three-client contract.
    _writer_client: ClientId,
}

impl FileState {
    fn new(file: File) -> Self {
        let mut pid_manager = PidInfoManager::new();
        let analyzer_client = pid_manager.register_client();
        let random_access_client = pid_manager.register_client();
        let _writer_client = pid_manager.register_client();
        Self {
            file,
            pid_manager,
            analyzer_client,
            random_access_client,
            _writer_client,
        }
    }

    /// Reset PSI/PID state for a fresh analyze pass, preserving the registered client ids.
    fn reset_for_reanalyze(&mut self) {
        self.pid_manager = PidInfoManager::new();
        self.analyzer_client = self.pid_manager.register_client();
        self.random_access_client = self.pid_manager.register_client();
        self._writer_client = self.pid_manager.register_client();
    }
}

/// Opens one transport-stream file and drives it through analyze, slice editing, and write.
///
/// Two locks guard the mutable state: `file_lock` serializes the three passes that touch the
/// open file (analyze, the random-access I-frame fetch, write); `data` guards everything else
/// (lifecycle state, frame index, slice list, disabled-PID set). Status counters are plain
/// atomics so a poller on another thread never blocks behind either lock.
pub struct Snipper {
    filename: String,
    file_size: u64,
    file_state: Mutex<FileState>,
    data: RwLock<SnipperData>,
    status_analyze_read: AtomicU64,
    status_analyze_total: AtomicU64,
    status_write_read: AtomicU64,
    status_write_total: AtomicU64,
}

impl Snipper {
    /// Open `path` for analysis. Does not read the file contents; only stats it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let filename = path.to_string_lossy().into_owned();
        let file = File::open(path).map_err(|e| SnipperError::io(filename.clone(), e))?;
        let file_size = file
            .metadata()
            .map_err(|e| SnipperError::io(filename.clone(), e))?
            .len();

        Ok(Self {
            filename,
            file_size,
            file_state: Mutex::new(FileState::new(file)),
            data: RwLock::new(SnipperData {
                state: State::Initialized,
                frames: Vec::new(),
                slices: SliceList::new(),
                sha1: None,
                video_pid: None,
                pmt_pid: None,
                disabled_pids: HashSet::new(),
            }),
            status_analyze_read: AtomicU64::new(0),
            status_analyze_total: AtomicU64::new(0),
            status_write_read: AtomicU64::new(0),
            status_write_total: AtomicU64::new(0),
        })
    }

    /// The path this `Snipper` was opened from.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Size of the underlying file in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.data.read().unwrap().state
    }

    /// Hex-encoded SHA-1 of the file as hashed during the last `analyze`, if one has completed.
    pub fn sha1(&self) -> Option<String> {
        self.data.read().unwrap().sha1.clone()
    }

    /// Bytes read so far / total bytes, for the most recent or in-progress `analyze` pass.
    pub fn status_analyze(&self) -> (u64, u64) {
        (
            self.status_analyze_read.load(Ordering::SeqCst),
            self.status_analyze_total.load(Ordering::SeqCst),
        )
    }

    /// Bytes read so far / total bytes, for the most recent or in-progress `write` pass.
    pub fn status_write(&self) -> (u64, u64) {
        (
            self.status_write_read.load(Ordering::SeqCst),
            self.status_write_total.load(Ordering::SeqCst),
        )
    }

    /// Scan the whole file once, building the I-frame index. Idempotent: calling it again from
    /// `Ready` clears the previous index and rebuilds from byte 0.
    ///
    /// `resume` is polled after every buffer read; returning `false` cancels the pass and leaves
    /// the `Snipper` in `Initialized` (the prior index, if any, is discarded).
    pub fn analyze(&self, mut resume: impl FnMut() -> bool) -> Result<()> {
        {
            let mut data = self.data.write().unwrap();
            if data.state != State::Initialized && data.state != State::Ready {
                return Err(SnipperError::StateViolation(
                    "analyze requires Initialized or Ready state",
                ));
            }
            data.state = State::Analyzing;
        }

        self.status_analyze_total.store(self.file_size, Ordering::SeqCst);
        self.status_analyze_read.store(0, Ordering::SeqCst);

        let result = self.analyze_inner(&mut resume);

        let mut data = self.data.write().unwrap();
        match result {
            Ok((frames, sha1, video_pid, pmt_pid)) => {
                data.frames = frames;
                data.sha1 = Some(sha1);
                data.video_pid = video_pid;
                data.pmt_pid = pmt_pid;
                data.state = State::Ready;
                Ok(())
            }
            Err(e) => {
                data.state = State::Initialized;
                Err(e)
            }
        }
    }

    fn analyze_inner(
        &self,
        resume: &mut impl FnMut() -> bool,
    ) -> Result<(Vec<FrameInfo>, String, Option<u16>, Option<u16>)> {
        let mut fs = self.file_state.lock().unwrap();
        fs.reset_for_reanalyze();
        fs.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| SnipperError::io(&self.filename, e))?;

        let mut analyzer = TransportAnalyzer::new(fs.analyzer_client);
        let mut indexer = FrameIndexer::new(fs.analyzer_client);
        let mut buf = vec![0u8; 188 * 1024];

        loop {
            if !resume() {
                return Err(SnipperError::Cancelled);
            }
            let n = fs
                .file
                .read(&mut buf)
                .map_err(|e| SnipperError::io(&self.filename, e))?;
            if n == 0 {
                break;
            }
            analyzer.push_buffer(&mut fs.pid_manager, &buf[..n], &mut indexer);
            self.status_analyze_read
                .fetch_add(n as u64, Ordering::SeqCst);
        }

        indexer.finish(analyzer.offset());
        Ok((
            indexer.frames().to_vec(),
            indexer.sha1_hex(),
            indexer.video_pid(),
            analyzer.pmt_pid(),
        ))
    }

    /// Number of indexed I-frames. Zero until `analyze` has completed.
    pub fn iframe_count(&self) -> u32 {
        self.data.read().unwrap().frames.len() as u32
    }

    /// Metadata for one indexed frame.
    pub fn iframe_info(&self, frame_id: u32) -> Option<FrameInfo> {
        self.data.read().unwrap().frames.get(frame_id as usize).copied()
    }

    /// PMT-driven stream type observed for every PID seen during the last `analyze`, sorted by
    /// PID.
    pub fn pid_table(&self) -> Vec<(u16, Option<crate::pidinfo::StreamType>)> {
        let fs = self.file_state.lock().unwrap();
        let mut table: Vec<_> = fs
            .pid_manager
            .iter()
            .map(|info| (info.pid(), info.stream_type()))
            .collect();
        table.sort_unstable_by_key(|(pid, _)| *pid);
        table
    }

    /// Fetch the raw elementary-stream bytes of one indexed frame by seeking directly to it and
    /// reassembling just that one PES unit, without rescanning the whole file.
    pub fn iframe_bytes(&self, frame_id: u32) -> Result<Vec<u8>> {
        let (start, video_pid) = {
            let data = self.data.read().unwrap();
            if data.state != State::Ready {
                return Err(SnipperError::StateViolation(
                    "iframe_bytes requires Ready state",
                ));
            }
            match data.frames.get(frame_id as usize) {
                Some(f) => (f.stream_offset_start, data.video_pid),
                None => return Err(SnipperError::IndexMiss(frame_id)),
            }
        };
        let video_pid = match video_pid {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };

        let mut fs = self.file_state.lock().unwrap();
        fs.file
            .seek(SeekFrom::Start(start))
            .map_err(|e| SnipperError::io(&self.filename, e))?;

        let mut analyzer = TransportAnalyzer::new(fs.random_access_client);
        let mut reassembler = PesReassembler::new();
        let mut captured: Option<Vec<u8>> = None;
        let mut buf = vec![0u8; 188 * 256];

        'read: loop {
            let n = fs
                .file
                .read(&mut buf)
                .map_err(|e| SnipperError::io(&self.filename, e))?;
            if n == 0 {
                break;
            }
            let mut handler = |pid_info: &PidInfo, packet: &[u8; 188], offset: u64| -> bool {
                if pid_info.pid() != video_pid {
                    return true;
                }
                let (header, payload_start) = match crate::analyzer::packet_header_and_payload(packet) {
                    Ok(v) => v,
                    Err(_) => return true,
                };
                if !header.has_payload() || payload_start > packet.len() {
                    return true;
                }
                let payload = &packet[payload_start..];
                let mut done = false;
                let _ = reassembler.push(header.pusi(), offset, None, payload, |unit| {
                    if captured.is_none() {
                        captured = Some(unit.data.clone());
                        done = true;
                    }
                });
                !done
            };
            let cont = analyzer.push_buffer(&mut fs.pid_manager, &buf[..n], &mut handler);
            if !cont || captured.is_some() {
                break 'read;
            }
        }

        Ok(captured.unwrap_or_default())
    }

    /// Add a slice spanning `[begin_frame, end_frame)`. `FRAME_ID_INVALID` may be used for either
    /// end to mean "from the start of the file" / "to the end of the file". Returns the new
    /// slice's id, or `SLICE_ID_INVALID` if the range is invalid.
    pub fn add_slice(&self, begin_frame: u32, end_frame: u32) -> u32 {
        let mut data = self.data.write().unwrap();
        if data.state != State::Ready {
            return SLICE_ID_INVALID;
        }
        data.slices.add_slice(&data.frames, self.file_size, begin_frame, end_frame)
    }

    /// Find the slice (if any) covering `frame_id`.
    pub fn find_slice(&self, frame_id: u32, include_end: bool) -> Option<Slice> {
        self.data
            .read()
            .unwrap()
            .slices
            .find_slice_for_frame(frame_id, include_end)
            .copied()
    }

    /// Remove a slice by id. A no-op if the id is unknown.
    pub fn delete_slice(&self, id: u32) {
        self.data.write().unwrap().slices.delete_slice(id);
    }

    /// Visit every current slice in ascending `begin` order. The data lock is released between
    /// each call to `visitor`, so the callback may itself call back into the `Snipper`.
    pub fn enum_slices(&self, mut visitor: impl FnMut(Slice)) {
        let slices: Vec<Slice> = {
            let data = self.data.read().unwrap();
            data.slices.iter().copied().collect()
        };
        for slice in slices {
            visitor(slice);
        }
    }

    /// Mark a PID to be dropped entirely from the written output.
    pub fn disable_pid(&self, pid: u16) {
        self.data.write().unwrap().disabled_pids.insert(pid);
    }

    /// Undo a prior [`Snipper::disable_pid`].
    pub fn enable_pid(&self, pid: u16) {
        self.data.write().unwrap().disabled_pids.remove(&pid);
    }

    /// PIDs currently marked disabled.
    pub fn disabled_pids(&self) -> HashSet<u16> {
        self.data.read().unwrap().disabled_pids.clone()
    }

    /// Replay the file through the current slice list, feeding rewritten output to `sink`.
    pub fn write(&self, sink: &mut dyn Sink) -> Result<()> {
        {
            let mut data = self.data.write().unwrap();
            if data.state != State::Ready {
                return Err(SnipperError::StateViolation("write requires Ready state"));
            }
            data.state = State::Writing;
        }

        self.status_write_total.store(self.file_size, Ordering::SeqCst);
        self.status_write_read.store(0, Ordering::SeqCst);

        let result = self.write_inner(sink);

        let mut data = self.data.write().unwrap();
        data.state = State::Ready;
        result
    }

    fn write_inner(&self, sink: &mut dyn Sink) -> Result<()> {
        let (frames, slices, pmt_pid, disabled) = {
            let data = self.data.read().unwrap();
            (
                data.frames.clone(),
                data.slices.clone(),
                data.pmt_pid,
                data.disabled_pids.clone(),
            )
        };

        let mut fs = self.file_state.lock().unwrap();
        fs.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| SnipperError::io(&self.filename, e))?;

        let mut engine = RewriteEngine::new(&slices, &frames, self.file_size, pmt_pid, disabled);
        let mut packet = [0u8; 188];
        let mut offset = 0u64;
        loop {
            let filled = read_packet(&mut fs.file, &mut packet)
                .map_err(|e| SnipperError::io(&self.filename, e))?;
            if filled == 0 {
                break;
            }
            if filled != 188 {
                break; // truncated trailing partial packet
            }
            if !engine.process_packet(&fs.pid_manager, &packet, offset, sink) {
                return Err(SnipperError::SinkFailure(offset));
            }
            offset += 188;
            self.status_write_read.store(offset, Ordering::SeqCst);
        }
        if !engine.finish(sink) {
            return Err(SnipperError::SinkFailure(offset));
        }
        Ok(())
    }
}

fn read_packet(file: &mut File, buf: &mut [u8; 188]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
