use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::data_channel::DataChannelImpl;
use crate::error::{Error, Result};
use crate::track::TrackImpl;

/// Maps stream ids to data channels and mids to tracks.
///
/// The peer connection owns its channels and tracks through this registry;
/// children address the parent by key instead of holding back-pointers, so
/// there are no reference cycles to break. The registry is emptied before
/// the peer connection reaches `Closed`.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    channels: Mutex<HashMap<u16, Arc<DataChannelImpl>>>,
    /// Channels created before the SCTP transport exists; they get a
    /// stream id once it connects.
    pending_channels: Mutex<Vec<Arc<DataChannelImpl>>>,
    tracks: Mutex<HashMap<String, Arc<TrackImpl>>>,
}

impl ChannelRegistry {
    /// Registers a channel under its stream id. A stream id maps to at
    /// most one channel at a time.
    pub(crate) fn register_channel(&self, stream: u16, channel: Arc<DataChannelImpl>) -> Result<()> {
        let mut channels = self.channels.lock().unwrap();
        if channels.contains_key(&stream) {
            return Err(Error::ErrStreamInUse(stream));
        }
        channels.insert(stream, channel);
        Ok(())
    }

    pub(crate) fn channel(&self, stream: u16) -> Option<Arc<DataChannelImpl>> {
        self.channels.lock().unwrap().get(&stream).cloned()
    }

    pub(crate) fn remove_channel(&self, stream: u16) -> Option<Arc<DataChannelImpl>> {
        self.channels.lock().unwrap().remove(&stream)
    }

    pub(crate) fn add_pending_channel(&self, channel: Arc<DataChannelImpl>) {
        self.pending_channels.lock().unwrap().push(channel);
    }

    pub(crate) fn take_pending_channels(&self) -> Vec<Arc<DataChannelImpl>> {
        self.pending_channels.lock().unwrap().drain(..).collect()
    }

    pub(crate) fn has_pending_channels(&self) -> bool {
        !self.pending_channels.lock().unwrap().is_empty()
    }

    /// First unused stream id of the given parity (even for the DTLS
    /// client, odd for the server).
    pub(crate) fn find_free_stream(&self, even: bool, max: u16) -> Result<u16> {
        let channels = self.channels.lock().unwrap();
        let mut id: u16 = if even { 0 } else { 1 };
        while id < max - 1 {
            if !channels.contains_key(&id) {
                return Ok(id);
            }
            id += 2;
        }
        Err(Error::ErrMaxStreamId)
    }

    pub(crate) fn register_track(&self, track: Arc<TrackImpl>) -> Result<()> {
        let mut tracks = self.tracks.lock().unwrap();
        let mid = track.mid().to_string();
        if tracks.contains_key(&mid) {
            return Err(Error::ErrInvalidArgument(format!("duplicate track mid: {mid}")));
        }
        tracks.insert(mid, track);
        Ok(())
    }

    pub(crate) fn track(&self, mid: &str) -> Option<Arc<TrackImpl>> {
        self.tracks.lock().unwrap().get(mid).cloned()
    }

    pub(crate) fn track_by_ssrc(&self, ssrc: u32) -> Option<Arc<TrackImpl>> {
        let tracks = self.tracks.lock().unwrap();
        tracks
            .values()
            .find(|track| track.ssrcs().contains(&ssrc))
            .cloned()
    }

    /// The only track, if exactly one exists: the routing fallback for
    /// packets with an unknown SSRC.
    pub(crate) fn single_track(&self) -> Option<Arc<TrackImpl>> {
        let tracks = self.tracks.lock().unwrap();
        if tracks.len() == 1 {
            tracks.values().next().cloned()
        } else {
            None
        }
    }

    pub(crate) fn channels_snapshot(&self) -> Vec<Arc<DataChannelImpl>> {
        self.channels.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn tracks_snapshot(&self) -> Vec<Arc<TrackImpl>> {
        self.tracks.lock().unwrap().values().cloned().collect()
    }

    /// Tears every registration down, returning the former members so the
    /// caller can close them.
    pub(crate) fn clear(&self) -> (Vec<Arc<DataChannelImpl>>, Vec<Arc<TrackImpl>>) {
        let channels: Vec<_> = self.channels.lock().unwrap().drain().map(|(_, c)| c).collect();
        let mut all = channels;
        all.extend(self.pending_channels.lock().unwrap().drain(..));
        let tracks: Vec<_> = self.tracks.lock().unwrap().drain().map(|(_, t)| t).collect();
        (all, tracks)
    }
}
