//! The slice model: user-requested cut ranges, kept sorted and merged on insert.

use crate::index::{FrameInfo, FRAME_ID_INVALID, TS_INVALID};

/// Sentinel returned by [`SliceList::add_slice`] when the requested frame ids don't name a
/// known I-frame (or either of the two sentinels).
pub const SLICE_ID_INVALID: u32 = u32::MAX;

/// One cut: a half-open byte range `[begin, end)`, plus the frame ids and timestamps it was
/// resolved from at insertion time.
#[derive(Debug, Clone, Copy)]
pub struct Slice {
    /// Stable until a merge absorbs this slice into a neighbor.
    pub id: u32,
    /// First byte removed.
    pub begin: u64,
    /// One past the last byte removed.
    pub end: u64,
    /// Frame id this slice's `begin` was resolved from (`FRAME_ID_INVALID` for "start of file").
    pub begin_frame: u32,
    /// Frame id this slice's `end` was resolved from (`FRAME_ID_INVALID` for "end of file").
    pub end_frame: u32,
    /// PTS of `begin_frame`, if it names a real frame.
    pub pts_begin: Option<u64>,
    /// PTS of `end_frame`, if it names a real frame.
    pub pts_end: Option<u64>,
    /// PCR of `begin_frame`, if it names a real frame.
    pub pcr_begin: Option<u64>,
    /// PCR of `end_frame`, if it names a real frame.
    pub pcr_end: Option<u64>,
}

/// Sorted, overlap-merging collection of [`Slice`]s.
#[derive(Default, Clone)]
pub struct SliceList {
    slices: Vec<Slice>,
    next_id: u32,
}

fn none_if_invalid(ts: u64) -> Option<u64> {
    if ts == TS_INVALID {
        None
    } else {
        Some(ts)
    }
}

/// Byte offset of the virtual boundary at `idx` when used as a cut's *end* (or as the "just
/// past the last I-frame" meaning of `idx == frames.len()`).
fn boundary_byte(frames: &[FrameInfo], file_size: u64, idx: u32) -> u64 {
    let len = frames.len() as u32;
    if idx == FRAME_ID_INVALID {
        file_size
    } else if idx < len {
        frames[idx as usize].stream_offset_start
    } else if len > 0 {
        frames[(len - 1) as usize].stream_offset_end
    } else {
        0
    }
}

/// Byte offset of the virtual boundary at `idx` when used as a cut's *begin*: identical to
/// [`boundary_byte`] except a real frame index resolves to its dangling-B-inclusive start.
fn begin_boundary_byte(frames: &[FrameInfo], file_size: u64, idx: u32) -> u64 {
    let len = frames.len() as u32;
    if idx == FRAME_ID_INVALID {
        0
    } else if idx < len {
        frames[idx as usize].stream_offset_dangling_bframe
    } else {
        boundary_byte(frames, file_size, idx)
    }
}

fn frame_pts(frames: &[FrameInfo], idx: u32) -> Option<u64> {
    (idx != FRAME_ID_INVALID)
        .then(|| frames.get(idx as usize))
        .flatten()
        .and_then(|f| none_if_invalid(f.pts))
}

fn frame_pcr(frames: &[FrameInfo], idx: u32) -> Option<u64> {
    (idx != FRAME_ID_INVALID)
        .then(|| frames.get(idx as usize))
        .flatten()
        .and_then(|f| none_if_invalid(f.pcr))
}

fn merge_sorted(mut slices: Vec<Slice>) -> Vec<Slice> {
    slices.sort_by_key(|s| s.begin);
    let mut merged: Vec<Slice> = Vec::with_capacity(slices.len());
    for s in slices {
        match merged.last_mut() {
            Some(last) if s.begin <= last.end => {
                if s.end > last.end {
                    last.end = s.end;
                    last.end_frame = s.end_frame;
                    last.pts_end = s.pts_end;
                    last.pcr_end = s.pcr_end;
                }
            }
            _ => merged.push(s),
        }
    }
    merged
}

impl SliceList {
    /// Create an empty slice list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a slice spanning `[begin_frame, end_frame)`. `FRAME_ID_INVALID` means "from the start
    /// of the file" (for `begin_frame`) or "to the end of the file" (for `end_frame`); both
    /// parameters also accept `frames.len()` itself, meaning "just past the last I-frame".
    ///
    /// Returns the new slice's id, or [`SLICE_ID_INVALID`] if either id is out of range or the
    /// resulting range would be inverted.
    pub fn add_slice(
        &mut self,
        frames: &[FrameInfo],
        file_size: u64,
        begin_frame: u32,
        end_frame: u32,
    ) -> u32 {
        let n = frames.len() as u32;
        let begin_ok = begin_frame == FRAME_ID_INVALID || begin_frame <= n;
        let end_ok = end_frame == FRAME_ID_INVALID || end_frame <= n;
        if !begin_ok || !end_ok {
            return SLICE_ID_INVALID;
        }

        let begin = begin_boundary_byte(frames, file_size, begin_frame);
        let end = boundary_byte(frames, file_size, end_frame);
        if begin > end {
            return SLICE_ID_INVALID;
        }

        let id = self.next_id;
        self.next_id += 1;
        let slice = Slice {
            id,
            begin,
            end,
            begin_frame,
            end_frame,
            pts_begin: frame_pts(frames, begin_frame),
            pts_end: frame_pts(frames, end_frame),
            pcr_begin: frame_pcr(frames, begin_frame),
            pcr_end: frame_pcr(frames, end_frame),
        };
        self.slices.push(slice);
        self.merge();
        id
    }

    fn merge(&mut self) {
        self.slices = merge_sorted(std::mem::take(&mut self.slices));
    }

    /// Build the working list the rewriting engine iterates over: the current slices plus a
    /// temporary head guard (`[0, frame 0)`) and tail guard (`[just past the last I-frame, end of
    /// file)`), merged together. Guard ids are [`SLICE_ID_INVALID`]; they are never looked up by
    /// id and are discarded once `write()` finishes.
    pub fn with_write_guards(&self, frames: &[FrameInfo], file_size: u64) -> Vec<Slice> {
        let n = frames.len() as u32;
        let mut all = self.slices.clone();
        all.push(Slice {
            id: SLICE_ID_INVALID,
            begin: begin_boundary_byte(frames, file_size, FRAME_ID_INVALID),
            end: boundary_byte(frames, file_size, 0),
            begin_frame: FRAME_ID_INVALID,
            end_frame: 0,
            pts_begin: frame_pts(frames, FRAME_ID_INVALID),
            pts_end: frame_pts(frames, 0),
            pcr_begin: frame_pcr(frames, FRAME_ID_INVALID),
            pcr_end: frame_pcr(frames, 0),
        });
        all.push(Slice {
            id: SLICE_ID_INVALID,
            begin: begin_boundary_byte(frames, file_size, n),
            end: boundary_byte(frames, file_size, FRAME_ID_INVALID),
            begin_frame: n,
            end_frame: FRAME_ID_INVALID,
            pts_begin: frame_pts(frames, n),
            pts_end: frame_pts(frames, FRAME_ID_INVALID),
            pcr_begin: frame_pcr(frames, n),
            pcr_end: frame_pcr(frames, FRAME_ID_INVALID),
        });
        merge_sorted(all)
    }

    /// Remove a slice by id. A no-op if the id is unknown (already merged away, or never
    /// existed).
    pub fn delete_slice(&mut self, id: u32) {
        self.slices.retain(|s| s.id != id);
    }

    /// Find the slice (if any) covering `frame_id`. `include_end` controls whether a frame
    /// exactly equal to a slice's `end_frame` counts as covered.
    pub fn find_slice_for_frame(&self, frame_id: u32, include_end: bool) -> Option<&Slice> {
        self.slices.iter().find(|s| {
            let above_begin = s.begin_frame == FRAME_ID_INVALID || frame_id >= s.begin_frame;
            let below_end = if s.end_frame == FRAME_ID_INVALID {
                true
            } else if include_end {
                frame_id <= s.end_frame
            } else {
                frame_id < s.end_frame
            };
            above_begin && below_end
        })
    }

    /// Visit every slice in ascending `begin` order.
    pub fn enum_slices(&self, mut visitor: impl FnMut(&Slice)) {
        for s in &self.slices {
            visitor(s);
        }
    }

    /// Slices in ascending `begin` order.
    pub fn iter(&self) -> impl Iterator<Item = &Slice> {
        self.slices.iter()
    }

    /// Number of slices currently held (after merging).
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// True if no slices are held.
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FrameCodec;

    fn frame(n: u32, start: u64, end: u64, dangling: u64, pts: u64) -> FrameInfo {
        FrameInfo {
            frame_num: n,
            stream_offset_start: start,
            stream_offset_end: end,
            stream_offset_dangling_bframe: dangling,
            pts,
            dts: pts,
            pcr: pts,
            codec: FrameCodec::Mpeg2,
        }
    }

    fn sample_frames() -> Vec<FrameInfo> {
        vec![
            frame(0, 0, 1880, 0, 0),
            frame(1, 1880, 3760, 1880, 90_000),
            frame(2, 3760, 5640, 3760, 180_000),
            frame(3, 5640, 7520, 5640, 270_000),
        ]
    }

    #[test]
    fn add_slice_rejects_out_of_range() {
        let frames = sample_frames();
        let mut list = SliceList::new();
        assert_eq!(list.add_slice(&frames, 10_000, 0, 99), SLICE_ID_INVALID);
    }

    #[test]
    fn overlapping_slices_merge() {
        let frames = sample_frames();
        let mut list = SliceList::new();
        list.add_slice(&frames, 10_000, 0, 2);
        list.add_slice(&frames, 10_000, 1, 3);
        assert_eq!(list.len(), 1);
        let merged = list.iter().next().unwrap();
        assert_eq!(merged.begin_frame, 0);
        assert_eq!(merged.end_frame, 3);
        assert_eq!(merged.end, 5640);
    }

    #[test]
    fn delete_is_idempotent_and_id_stable_until_merge() {
        let frames = sample_frames();
        let mut list = SliceList::new();
        let id = list.add_slice(&frames, 10_000, 0, 1);
        list.delete_slice(id);
        assert!(list.is_empty());
        list.delete_slice(id); // no-op, doesn't panic
    }

    #[test]
    fn find_slice_for_frame_respects_include_end() {
        let frames = sample_frames();
        let mut list = SliceList::new();
        list.add_slice(&frames, 10_000, 1, 3);
        assert!(list.find_slice_for_frame(3, false).is_none());
        assert!(list.find_slice_for_frame(3, true).is_some());
        assert!(list.find_slice_for_frame(1, true).is_some());
        assert!(list.find_slice_for_frame(0, true).is_none());
    }

    #[test]
    fn from_start_of_file_uses_dangling_start() {
        let frames = sample_frames();
        let mut list = SliceList::new();
        let id = list.add_slice(&frames, 10_000, FRAME_ID_INVALID, 1);
        assert_ne!(id, SLICE_ID_INVALID);
        let s = list.iter().next().unwrap();
        assert_eq!(s.begin, 0);
        assert_eq!(s.end, 1880);
    }

    #[test]
    fn write_guards_bracket_the_whole_file() {
        let frames = sample_frames();
        let mut list = SliceList::new();
        list.add_slice(&frames, 10_000, 1, 2);
        let working = list.with_write_guards(&frames, 10_000);
        assert_eq!(working.first().unwrap().begin, 0);
        assert_eq!(working.last().unwrap().end, 10_000);
    }

    #[test]
    fn just_past_last_frame_to_eof() {
        let frames = sample_frames();
        let mut list = SliceList::new();
        let n = frames.len() as u32;
        let id = list.add_slice(&frames, 10_000, n, FRAME_ID_INVALID);
        assert_ne!(id, SLICE_ID_INVALID);
        let s = list.iter().next().unwrap();
        assert_eq!(s.begin, 7520);
        assert_eq!(s.end, 10_000);
    }
}
