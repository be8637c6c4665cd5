//! PID registry: maps 13-bit PIDs to stream types and per-client private state.
//!
//! Generalizes what, in any language, is "polymorphic extension state" attached to a PID: the
//! analyzer, the random-access fetch, and the rewriting engine each register as a distinct
//! client and get disjoint private slots on every [`PidInfo`], so their per-PID bookkeeping
//! (PES reassembly buffers, writer action state, ...) never collides.

use std::any::Any;
use std::collections::HashMap;

/// MPEG-1/2 video coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    /// ISO/IEC 13818-2 video.
    Mpeg2,
    /// ISO/IEC 14496-10 (H.264/AVC) video.
    H264,
}

/// Elementary audio coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    /// ISO/IEC 11172-3 (MPEG-1) audio.
    Mpeg1,
    /// ISO/IEC 13818-3 (MPEG-2) audio.
    Mpeg2,
    /// ADTS-framed AAC.
    Aac,
}

/// Stream type assigned to a PID, known either structurally (PAT/PMT) or from the PMT's
/// `stream_type` byte (ISO/IEC 13818-1 Table 2-34) plus a DVB teletext descriptor check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// Program Association Table, always PID 0.
    Pat,
    /// Program Map Table for the (first, and only supported) program.
    Pmt,
    /// Video elementary stream.
    Video(VideoCodec),
    /// Audio elementary stream.
    Audio(AudioCodec),
    /// DVB teletext subtitle/OSD stream.
    Teletext,
    /// Anything else: private data, subtitles, unrecognized `stream_type`.
    Other(u8),
}

impl StreamType {
    /// Map a PMT `stream_type` byte (and whether a DVB teletext descriptor was attached to the
    /// elementary stream) to a [`StreamType`].
    pub fn from_pmt(stream_type: u8, has_teletext_descriptor: bool) -> Self {
        match stream_type {
            0x01 => StreamType::Video(VideoCodec::Mpeg1).normalize_mpeg1_video(),
            0x02 => StreamType::Video(VideoCodec::Mpeg2),
            0x03 => StreamType::Audio(AudioCodec::Mpeg1),
            0x04 => StreamType::Audio(AudioCodec::Mpeg2),
            0x06 if has_teletext_descriptor => StreamType::Teletext,
            0x0f | 0x11 => StreamType::Audio(AudioCodec::Aac),
            0x1b => StreamType::Video(VideoCodec::H264),
            other => StreamType::Other(other),
        }
    }

    fn normalize_mpeg1_video(self) -> Self {
        // MPEG-1 video (0x01) is treated identically to MPEG-2 video by the indexer: both use
        // the same picture_start_code / picture_coding_type scan (§4.4).
        StreamType::Video(VideoCodec::Mpeg2)
    }

    /// True if this stream type is a video elementary stream the I-frame indexer understands.
    pub fn is_indexable_video(self) -> bool {
        matches!(self, StreamType::Video(_))
    }
}

/// A stable handle identifying one registered client of the [`PidInfoManager`].
///
/// Distinct clients (the analyzer, the random-access fetch, the writer) never observe each
/// other's private data on a shared [`PidInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(usize);

/// Per-PID state: its assigned stream type and one private slot per registered client.
pub struct PidInfo {
    pid: u16,
    stream_type: Option<StreamType>,
    private: Vec<Option<Box<dyn Any>>>,
}

impl std::fmt::Debug for PidInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidInfo")
            .field("pid", &self.pid)
            .field("stream_type", &self.stream_type)
            .finish()
    }
}

impl PidInfo {
    fn new(pid: u16, slots: usize) -> Self {
        let mut private = Vec::with_capacity(slots);
        private.resize_with(slots, || None);
        Self {
            pid,
            stream_type: None,
            private,
        }
    }

    /// The 13-bit PID this descriptor describes.
    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// The stream type assigned on first PAT/PMT sighting, if any.
    pub fn stream_type(&self) -> Option<StreamType> {
        self.stream_type
    }

    fn ensure_slot(&mut self, client: ClientId) {
        if self.private.len() <= client.0 {
            self.private.resize_with(client.0 + 1, || None);
        }
    }
}

/// Mapping from PID to [`PidInfo`], with a stable client-id allocator.
///
/// A `PidInfo` exists at most once per PID, created lazily on first sighting (either a raw
/// packet on that PID, or a PAT/PMT entry naming it).
#[derive(Default)]
pub struct PidInfoManager {
    pids: HashMap<u16, PidInfo>,
    client_count: usize,
}

impl PidInfoManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new stable client id. Clients receive disjoint per-PID private slots.
    pub fn register_client(&mut self) -> ClientId {
        let id = ClientId(self.client_count);
        self.client_count += 1;
        id
    }

    /// Look up a PID's descriptor, if it has been seen.
    pub fn get(&self, pid: u16) -> Option<&PidInfo> {
        self.pids.get(&pid)
    }

    /// Look up or lazily create a PID's descriptor.
    pub fn get_or_create(&mut self, pid: u16) -> &mut PidInfo {
        self.pids
            .entry(pid)
            .or_insert_with(|| PidInfo::new(pid, self.client_count))
    }

    /// Assign a stream type to a PID, if it doesn't have one yet. First-seen wins: a later PMT
    /// update naming the same PID retains the PidInfo (and therefore its clients' private data)
    /// untouched.
    pub fn assign_stream_type(&mut self, pid: u16, stream_type: StreamType) {
        let info = self.get_or_create(pid);
        if info.stream_type.is_none() {
            info.stream_type = Some(stream_type);
        }
    }

    /// Number of distinct PIDs observed so far.
    pub fn pid_count(&self) -> usize {
        self.pids.len()
    }

    /// Iterate over every observed PID's descriptor, in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &PidInfo> {
        self.pids.values()
    }

    /// Fetch a client's private payload for a PID, downcast to `T`.
    pub fn get_private<T: 'static>(&self, pid: u16, client: ClientId) -> Option<&T> {
        self.pids
            .get(&pid)?
            .private
            .get(client.0)?
            .as_ref()?
            .downcast_ref::<T>()
    }

    /// Mutably fetch a client's private payload for a PID, downcast to `T`.
    pub fn get_private_mut<T: 'static>(&mut self, pid: u16, client: ClientId) -> Option<&mut T> {
        self.pids
            .get_mut(&pid)?
            .private
            .get_mut(client.0)?
            .as_mut()?
            .downcast_mut::<T>()
    }

    /// Install (overwriting any prior value) a client's private payload for a PID.
    ///
    /// The previous payload, if any, is dropped in place — its `Drop` impl is the "registered
    /// release action"; there is no separate destroy-notify callback to wire up.
    pub fn set_private<T: 'static>(&mut self, pid: u16, client: ClientId, payload: T) {
        let info = self.get_or_create(pid);
        info.ensure_slot(client);
        info.private[client.0] = Some(Box::new(payload));
    }

    /// Get-or-insert a client's private payload for a PID.
    pub fn get_private_or_insert_with<T: 'static, F: FnOnce() -> T>(
        &mut self,
        pid: u16,
        client: ClientId,
        default: F,
    ) -> &mut T {
        let info = self.get_or_create(pid);
        info.ensure_slot(client);
        info.private[client.0]
            .get_or_insert_with(|| Box::new(default()))
            .downcast_mut::<T>()
            .expect("private slot type mismatch")
    }

    /// Drop a client's private payload for a PID, if any.
    pub fn clear_private(&mut self, pid: u16, client: ClientId) {
        if let Some(info) = self.pids.get_mut(&pid) {
            if let Some(slot) = info.private.get_mut(client.0) {
                *slot = None;
            }
        }
    }

    /// Drop a client's private payload across every known PID.
    pub fn clear_all_for_client(&mut self, client: ClientId) {
        for info in self.pids.values_mut() {
            if let Some(slot) = info.private.get_mut(client.0) {
                *slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clients_have_disjoint_private_slots() {
        let mut mgr = PidInfoManager::new();
        let a = mgr.register_client();
        let b = mgr.register_client();

        mgr.set_private(0x100, a, 42_i32);
        mgr.set_private(0x100, b, "hello".to_string());

        assert_eq!(mgr.get_private::<i32>(0x100, a), Some(&42));
        assert_eq!(mgr.get_private::<String>(0x100, b).map(String::as_str), Some("hello"));
        assert_eq!(mgr.get_private::<String>(0x100, a), None);
    }

    #[test]
    fn first_seen_stream_type_wins() {
        let mut mgr = PidInfoManager::new();
        mgr.assign_stream_type(0x200, StreamType::Video(VideoCodec::H264));
        mgr.assign_stream_type(0x200, StreamType::Audio(AudioCodec::Aac));
        assert_eq!(
            mgr.get(0x200).unwrap().stream_type(),
            Some(StreamType::Video(VideoCodec::H264))
        );
    }

    #[test]
    fn clear_all_for_client_only_touches_that_client() {
        let mut mgr = PidInfoManager::new();
        let a = mgr.register_client();
        let b = mgr.register_client();
        mgr.set_private(0x10, a, 1_i32);
        mgr.set_private(0x10, b, 2_i32);
        mgr.set_private(0x20, a, 3_i32);

        mgr.clear_all_for_client(a);

        assert_eq!(mgr.get_private::<i32>(0x10, a), None);
        assert_eq!(mgr.get_private::<i32>(0x10, b), Some(&2));
        assert_eq!(mgr.get_private::<i32>(0x20, a), None);
    }
}
