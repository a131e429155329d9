use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, trace, warn};

use crate::backend::{Backend, IceParameters, IceRole, SelectedCandidatePair};
use crate::callback::{Callback, CallbackSlot};
use crate::certificate::Certificate;
use crate::configuration::Configuration;
use crate::data_channel::dcep::DcepMessage;
use crate::data_channel::{DataChannel, DataChannelImpl, DataChannelInit};
use crate::error::{Error, Result};
use crate::internal::{
    DEFAULT_LOCAL_MAX_MESSAGE_SIZE, DEFAULT_MTU, DEFAULT_REMOTE_MAX_MESSAGE_SIZE,
    DEFAULT_SCTP_PORT,
};
use crate::media::rtcp::{RTCP_PT_PSFB, RTCP_PT_RTPFB, RTCP_PT_SENDER_REPORT};
use crate::message::{Message, MessageType};
use crate::peer_connection::registry::ChannelRegistry;
use crate::runtime::{Processor, Runtime};
use crate::sdp::{
    Description, IceCandidate, MediaSection, SdpType, SectionKind, SetupRole,
};
use crate::track::{Track, TrackImpl};
use crate::transport::demux::is_rtcp;
use crate::transport::dtls::DtlsTransport;
use crate::transport::dtls_srtp::DtlsSrtpTransport;
use crate::transport::ice::{GatheringState, IceTransport};
use crate::transport::sctp::{Ports, SctpTransport};
use crate::transport::{State, Transport};

pub(crate) mod registry;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum PeerConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<u8> for PeerConnectionState {
    fn from(v: u8) -> Self {
        match v {
            0 => PeerConnectionState::New,
            1 => PeerConnectionState::Connecting,
            2 => PeerConnectionState::Connected,
            3 => PeerConnectionState::Disconnected,
            4 => PeerConnectionState::Failed,
            _ => PeerConnectionState::Closed,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

impl From<u8> for SignalingState {
    fn from(v: u8) -> Self {
        match v {
            1 => SignalingState::HaveLocalOffer,
            2 => SignalingState::HaveRemoteOffer,
            _ => SignalingState::Stable,
        }
    }
}

struct Callbacks {
    local_description: CallbackSlot<Description>,
    local_candidate: CallbackSlot<IceCandidate>,
    state_change: CallbackSlot<PeerConnectionState>,
    signaling_state_change: CallbackSlot<SignalingState>,
    gathering_state_change: CallbackSlot<GatheringState>,
    data_channel: CallbackSlot<DataChannel>,
    track: CallbackSlot<Track>,
    error: CallbackSlot<Error>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            local_description: CallbackSlot::default(),
            local_candidate: CallbackSlot::default(),
            state_change: CallbackSlot::default(),
            signaling_state_change: CallbackSlot::default(),
            gathering_state_change: CallbackSlot::default(),
            data_channel: CallbackSlot::default(),
            track: CallbackSlot::default(),
            error: CallbackSlot::default(),
        }
    }
}

pub(crate) struct PeerConnectionImpl {
    config: Configuration,
    backend: Arc<dyn Backend>,
    runtime: Arc<Runtime>,
    processor: Processor,
    certificate: Arc<Certificate>,
    state: AtomicU8,
    signaling_state: AtomicU8,
    negotiation_needed: AtomicBool,
    /// True when this side produced the current offer; drives the ICE role.
    is_offerer: AtomicBool,
    closed: AtomicBool,
    local_description: Mutex<Option<Description>>,
    remote_description: Mutex<Option<Description>>,
    ice: Mutex<Option<Arc<IceTransport>>>,
    dtls: Mutex<Option<Arc<DtlsTransport>>>,
    dtls_srtp: Mutex<Option<Arc<DtlsSrtpTransport>>>,
    sctp: Mutex<Option<Arc<SctpTransport>>>,
    registry: ChannelRegistry,
    callbacks: Callbacks,
}

/// Top-level orchestrator: owns the transport pipeline, negotiates SDP
/// offer/answer, and multiplexes data channels and media tracks over it.
pub struct PeerConnection {
    inner: Arc<PeerConnectionImpl>,
}

impl PeerConnection {
    pub fn new(config: Configuration) -> Result<Self> {
        trace!("Creating PeerConnection");

        if config.port_range_end > 0 && config.port_range_begin > config.port_range_end {
            return Err(Error::ErrInvalidArgument("invalid port range".to_string()));
        }
        if let Some(mtu) = config.mtu {
            if mtu < 576 {
                // Min MTU for IPv4
                return Err(Error::ErrInvalidArgument("invalid MTU value".to_string()));
            }
            if mtu > 1500 {
                // Standard Ethernet
                warn!("MTU set to {mtu}");
            } else {
                trace!("MTU set to {mtu}");
            }
        }

        let certificate = match (&config.certificate_pem, &config.key_pem) {
            (Some(certificate_pem), Some(key_pem)) => {
                Certificate::from_pem(certificate_pem, key_pem)?
            }
            (None, None) => Certificate::generate(config.certificate_type)?,
            _ => {
                return Err(Error::ErrInvalidArgument(
                    "either none or both certificate and key PEM must be specified".to_string(),
                ))
            }
        };

        let backend = config
            .backend
            .clone()
            .ok_or_else(|| Error::ErrInvalidArgument("no backend configured".to_string()))?;

        Ok(Self {
            inner: Arc::new(PeerConnectionImpl {
                config,
                backend,
                runtime: Runtime::init(),
                processor: Processor::new(),
                certificate: Arc::new(certificate),
                state: AtomicU8::new(PeerConnectionState::New as u8),
                signaling_state: AtomicU8::new(SignalingState::Stable as u8),
                negotiation_needed: AtomicBool::new(false),
                is_offerer: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                local_description: Mutex::new(None),
                remote_description: Mutex::new(None),
                ice: Mutex::new(None),
                dtls: Mutex::new(None),
                dtls_srtp: Mutex::new(None),
                sctp: Mutex::new(None),
                registry: ChannelRegistry::default(),
                callbacks: Callbacks::default(),
            }),
        })
    }

    pub fn state(&self) -> PeerConnectionState {
        self.inner.state.load(Ordering::SeqCst).into()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.inner.signaling_state.load(Ordering::SeqCst).into()
    }

    pub fn gathering_state(&self) -> GatheringState {
        self.inner
            .ice
            .lock()
            .unwrap()
            .as_ref()
            .map(|ice| ice.gathering_state())
            .unwrap_or_default()
    }

    pub fn local_description(&self) -> Option<Description> {
        self.inner.local_description.lock().unwrap().clone()
    }

    pub fn remote_description(&self) -> Option<Description> {
        self.inner.remote_description.lock().unwrap().clone()
    }

    /// The certificate fingerprint advertised in local descriptions.
    pub fn fingerprint(&self) -> String {
        self.inner.certificate.fingerprint().to_string()
    }

    /// The nominated candidate pair, once ICE selected one.
    pub fn selected_candidate_pair(&self) -> Option<SelectedCandidatePair> {
        self.inner
            .ice
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|ice| ice.selected_pair())
    }

    pub fn rtt(&self) -> Option<Duration> {
        let sctp_rtt = self
            .inner
            .sctp
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|sctp| sctp.rtt());
        sctp_rtt.or_else(|| {
            self.inner
                .ice
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|ice| ice.rtt())
        })
    }

    pub fn bytes_sent(&self) -> usize {
        self.inner
            .sctp
            .lock()
            .unwrap()
            .as_ref()
            .map(|sctp| sctp.bytes_sent())
            .unwrap_or(0)
    }

    pub fn bytes_received(&self) -> usize {
        self.inner
            .sctp
            .lock()
            .unwrap()
            .as_ref()
            .map(|sctp| sctp.bytes_received())
            .unwrap_or(0)
    }

    /// Maximum SCTP message size usable towards the peer, RFC 8841.
    pub fn remote_max_message_size(&self) -> usize {
        let local_max = self
            .inner
            .config
            .max_message_size
            .unwrap_or(DEFAULT_LOCAL_MAX_MESSAGE_SIZE);
        let remote_max = self
            .inner
            .remote_description
            .lock()
            .unwrap()
            .as_ref()
            .map(|remote| remote.remote_max_message_size(DEFAULT_REMOTE_MAX_MESSAGE_SIZE))
            .unwrap_or(DEFAULT_REMOTE_MAX_MESSAGE_SIZE);
        local_max.min(remote_max)
    }

    pub fn on_local_description(&self, callback: Option<Callback<Description>>) {
        self.inner.callbacks.local_description.set(callback);
    }

    pub fn on_local_candidate(&self, callback: Option<Callback<IceCandidate>>) {
        self.inner.callbacks.local_candidate.set(callback);
    }

    pub fn on_state_change(&self, callback: Option<Callback<PeerConnectionState>>) {
        self.inner.callbacks.state_change.set(callback);
    }

    pub fn on_signaling_state_change(&self, callback: Option<Callback<SignalingState>>) {
        self.inner.callbacks.signaling_state_change.set(callback);
    }

    pub fn on_gathering_state_change(&self, callback: Option<Callback<GatheringState>>) {
        self.inner.callbacks.gathering_state_change.set(callback);
    }

    /// A channel opened by the remote peer.
    pub fn on_data_channel(&self, callback: Option<Callback<DataChannel>>) {
        self.inner.callbacks.data_channel.set(callback);
    }

    /// A media track announced by the remote peer.
    pub fn on_track(&self, callback: Option<Callback<Track>>) {
        self.inner.callbacks.track.set(callback);
    }

    pub fn on_error(&self, callback: Option<Callback<Error>>) {
        self.inner.callbacks.error.set(callback);
    }

    /// Creates a data channel. Unless auto negotiation is disabled, a fresh
    /// offer is scheduled, debounced until the end of the current task.
    pub fn create_data_channel(
        &self,
        label: impl Into<String>,
        init: Option<DataChannelInit>,
    ) -> Result<DataChannel> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrClosed);
        }
        let init = init.unwrap_or_default();
        if init.negotiated && init.stream.is_none() {
            return Err(Error::ErrInvalidArgument(
                "negotiated channels need a stream id".to_string(),
            ));
        }
        let channel = DataChannelImpl::new(label.into(), init, true);
        debug!("Creating data channel \"{}\"", channel.label());

        let sctp = self.inner.sctp.lock().unwrap().clone();
        match sctp {
            Some(sctp) if sctp.state() == State::Connected => {
                self.inner.open_channel(&sctp, &channel)?;
            }
            _ => self.inner.registry.add_pending_channel(Arc::clone(&channel)),
        }

        self.inner.schedule_renegotiation();
        Ok(DataChannel::new(channel))
    }

    /// Adds a media track described by the given section. Unless auto
    /// negotiation is disabled, a renegotiation offer is scheduled.
    pub fn add_track(&self, description: MediaSection) -> Result<Track> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrClosed);
        }
        if description.kind == SectionKind::Application {
            return Err(Error::ErrInvalidArgument(
                "tracks cannot use application sections".to_string(),
            ));
        }
        let track = TrackImpl::new(description);
        self.inner.registry.register_track(Arc::clone(&track))?;
        debug!("Added track {}", track.mid());

        if let Some(dtls_srtp) = self.inner.dtls_srtp.lock().unwrap().as_ref() {
            if dtls_srtp.state() == State::Connected {
                track.open(dtls_srtp);
            }
        }
        self.inner.schedule_renegotiation();
        Ok(Track::new(track))
    }

    /// Builds and applies a local description: an offer if none is pending,
    /// an answer after a remote offer. The serialized SDP is emitted
    /// through `on_local_description`.
    pub fn set_local_description(&self, sdp_type: Option<SdpType>) -> Result<()> {
        self.inner.set_local_description(sdp_type)
    }

    /// Applies the peer's description. `sdp_type` is the literal type
    /// string exchanged beside the blob.
    pub fn set_remote_description(&self, sdp: &str, sdp_type: &str) -> Result<()> {
        self.inner
            .set_remote_description(sdp, SdpType::from_str(sdp_type)?)
    }

    /// Adds a trickled remote candidate; valid any time after the remote
    /// description was set.
    pub fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
        if self.inner.remote_description.lock().unwrap().is_none() {
            return Err(Error::ErrNotAvailable);
        }
        let ice = self.inner.ice.lock().unwrap().clone();
        match ice {
            Some(ice) => ice.add_remote_candidate(candidate),
            None => Err(Error::ErrNotAvailable),
        }
    }

    /// Closes channels and tracks, tears the transports down and drops the
    /// callbacks.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for PeerConnectionImpl {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!("PeerConnection dropped without close()");
        }
    }
}

impl PeerConnectionImpl {
    fn signaling(&self) -> SignalingState {
        self.signaling_state.load(Ordering::SeqCst).into()
    }

    fn change_signaling_state(&self, state: SignalingState) {
        let old: SignalingState = self.signaling_state.swap(state as u8, Ordering::SeqCst).into();
        if old != state {
            trace!("Signaling state change: {:?} -> {:?}", old, state);
            self.callbacks.signaling_state_change.call(state);
        }
    }

    fn change_state(&self, state: PeerConnectionState) {
        let current: PeerConnectionState = self.state.load(Ordering::SeqCst).into();
        if current == state || current == PeerConnectionState::Closed {
            return;
        }
        if current == PeerConnectionState::Failed && state != PeerConnectionState::Closed {
            return;
        }
        self.state.store(state as u8, Ordering::SeqCst);
        debug!("PeerConnection state change: {:?} -> {:?}", current, state);
        self.callbacks.state_change.call(state);
    }

    /// Recomputes the aggregate state from the transports underneath.
    fn update_state(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let ice_state = self.ice.lock().unwrap().as_ref().map(|t| t.state());
        let dtls_state = self.dtls.lock().unwrap().as_ref().map(|t| t.state());
        let sctp_state = self.sctp.lock().unwrap().as_ref().map(|t| t.state());
        let states = [ice_state, dtls_state, sctp_state];

        if states.iter().flatten().any(|s| *s == State::Failed) {
            self.change_state(PeerConnectionState::Failed);
            return;
        }

        let ice_up = matches!(ice_state, Some(State::Connected) | Some(State::Completed));
        let dtls_up = dtls_state == Some(State::Connected);
        let sctp_up = sctp_state.is_none() || sctp_state == Some(State::Connected);
        if ice_up && dtls_up && sctp_up {
            self.change_state(PeerConnectionState::Connected);
            return;
        }

        let current: PeerConnectionState = self.state.load(Ordering::SeqCst).into();
        if current == PeerConnectionState::Connected
            && states.iter().flatten().any(|s| *s == State::Disconnected)
        {
            self.change_state(PeerConnectionState::Disconnected);
            return;
        }
        if states.iter().flatten().next().is_some() {
            self.change_state(PeerConnectionState::Connecting);
        }
    }

    fn fail(&self, err: Error) {
        self.callbacks.error.call(err);
        self.change_state(PeerConnectionState::Failed);
    }

    fn schedule_renegotiation(self: &Arc<Self>) {
        if self.config.disable_auto_negotiation || self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.negotiation_needed.swap(true, Ordering::SeqCst) {
            return; // already scheduled
        }
        let weak = Arc::downgrade(self);
        self.processor.enqueue(move || {
            let Some(pc) = weak.upgrade() else { return };
            if !pc.negotiation_needed.swap(false, Ordering::SeqCst) {
                return;
            }
            if pc.closed.load(Ordering::SeqCst) || pc.signaling() != SignalingState::Stable {
                return;
            }
            if let Err(err) = pc.set_local_description(Some(SdpType::Offer)) {
                error!("Renegotiation failed: {err}");
            }
        });
    }

    fn set_local_description(self: &Arc<Self>, sdp_type: Option<SdpType>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrClosed);
        }
        let signaling = self.signaling();
        let sdp_type = sdp_type.unwrap_or(match signaling {
            SignalingState::HaveRemoteOffer => SdpType::Answer,
            _ => SdpType::Offer,
        });
        match sdp_type {
            SdpType::Offer => {
                if signaling == SignalingState::HaveRemoteOffer {
                    return Err(Error::ErrInvalidArgument(
                        "cannot offer with a pending remote offer".to_string(),
                    ));
                }
            }
            SdpType::Answer | SdpType::Pranswer => {
                if signaling != SignalingState::HaveRemoteOffer {
                    return Err(Error::ErrInvalidArgument(
                        "answer without a remote offer".to_string(),
                    ));
                }
            }
            SdpType::Rollback => {
                if signaling == SignalingState::HaveLocalOffer {
                    self.change_signaling_state(SignalingState::Stable);
                }
                return Ok(());
            }
        }

        let ice = self.init_ice_transport()?;
        let description = self.build_local_description(sdp_type, &ice)?;
        *self.local_description.lock().unwrap() = Some(description.clone());

        match sdp_type {
            SdpType::Offer => {
                self.is_offerer.store(true, Ordering::SeqCst);
                self.change_signaling_state(SignalingState::HaveLocalOffer);
            }
            SdpType::Answer => {
                self.change_signaling_state(SignalingState::Stable);
                // both descriptions exist now, bring the upper layers up
                self.init_transports()?;
            }
            _ => {}
        }

        self.update_state();
        self.callbacks.local_description.call(description);
        Ok(())
    }

    fn build_local_description(
        &self,
        sdp_type: SdpType,
        ice: &Arc<IceTransport>,
    ) -> Result<Description> {
        let previous = self.local_description.lock().unwrap().clone();
        let session_id = previous
            .as_ref()
            .map(|d| d.session_id().to_string())
            .unwrap_or_else(|| format!("{}", rand::random::<u32>()));

        let mut description = Description::new(sdp_type, session_id);
        let parameters = ice.local_parameters();
        description.ice_ufrag = Some(parameters.username_fragment);
        description.ice_pwd = Some(parameters.password);
        description.fingerprint = Some(self.certificate.fingerprint().to_string());

        let remote = self.remote_description.lock().unwrap().clone();
        description.setup = match sdp_type {
            SdpType::Offer => SetupRole::ActPass,
            _ => match remote.as_ref().map(|r| r.setup).unwrap_or_default() {
                // remote active => we are the server side
                SetupRole::Active => SetupRole::Passive,
                SetupRole::Passive | SetupRole::ActPass => SetupRole::Active,
            },
        };

        let local_max_message_size = self
            .config
            .max_message_size
            .unwrap_or(DEFAULT_LOCAL_MAX_MESSAGE_SIZE);

        if sdp_type == SdpType::Offer {
            let mut used_mids: Vec<String> =
                self.registry.tracks_snapshot().iter().map(|t| t.mid().to_string()).collect();

            // the application m-line, when any channel exists
            let needs_application = self.registry.has_pending_channels()
                || !self.registry.channels_snapshot().is_empty()
                || previous.as_ref().map(|d| d.application().is_some()).unwrap_or(false);
            if needs_application {
                let mid = previous
                    .as_ref()
                    .and_then(|d| d.application().map(|a| a.mid.clone()))
                    .unwrap_or_else(|| allocate_mid(&used_mids));
                used_mids.push(mid.clone());
                description.push_media(MediaSection::application(
                    mid,
                    DEFAULT_SCTP_PORT,
                    local_max_message_size,
                ))?;
            }

            for track in self.registry.tracks_snapshot() {
                let mut section = track.description();
                if section.ssrcs.is_empty() {
                    // assign an SSRC so the media can be routed
                    section.add_ssrc(rand::random::<u32>(), Some(crate::utils::random_string(16)));
                    track.set_description(section.clone());
                }
                description.push_media(section)?;
            }
        } else {
            let remote = remote.ok_or(Error::ErrNotAvailable)?;
            // mirror the remote m-lines in order
            for remote_section in remote.media() {
                match remote_section.kind {
                    SectionKind::Application => {
                        description.push_media(MediaSection::application(
                            remote_section.mid.clone(),
                            DEFAULT_SCTP_PORT,
                            local_max_message_size,
                        ))?;
                    }
                    _ => {
                        let section = match self.registry.track(&remote_section.mid) {
                            Some(track) => track.description(),
                            None => {
                                let mut section = remote_section.clone();
                                section.direction = remote_section.direction.reversed();
                                section.ssrcs.clear();
                                section
                            }
                        };
                        description.push_media(section)?;
                    }
                }
            }
        }

        // carry over candidates gathered so far
        if let Some(previous) = previous {
            for candidate in previous.candidates {
                description.add_candidate(candidate);
            }
            description.end_of_candidates = previous.end_of_candidates;
        }

        Ok(description)
    }

    fn set_remote_description(self: &Arc<Self>, sdp: &str, sdp_type: SdpType) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrClosed);
        }
        let signaling = self.signaling();
        match sdp_type {
            SdpType::Offer => {
                if signaling != SignalingState::Stable {
                    return Err(Error::ErrInvalidArgument(format!(
                        "remote offer in signaling state {signaling:?}"
                    )));
                }
            }
            SdpType::Answer | SdpType::Pranswer => {
                if signaling != SignalingState::HaveLocalOffer {
                    return Err(Error::ErrInvalidArgument(format!(
                        "remote answer in signaling state {signaling:?}"
                    )));
                }
            }
            SdpType::Rollback => {
                if signaling == SignalingState::HaveRemoteOffer {
                    *self.remote_description.lock().unwrap() = None;
                    self.change_signaling_state(SignalingState::Stable);
                }
                return Ok(());
            }
        }

        let description = Description::parse(sdp, sdp_type)?;
        if description.fingerprint.is_none() {
            return Err(Error::ErrProtocol("remote description without fingerprint".to_string()));
        }
        let ice_ufrag = description
            .ice_ufrag
            .clone()
            .ok_or_else(|| Error::ErrProtocol("remote description without ice-ufrag".to_string()))?;
        let ice_pwd = description
            .ice_pwd
            .clone()
            .ok_or_else(|| Error::ErrProtocol("remote description without ice-pwd".to_string()))?;

        debug!("Applying remote {} description", sdp_type.as_str());
        let candidates = description.candidates.clone();
        *self.remote_description.lock().unwrap() = Some(description.clone());

        match sdp_type {
            SdpType::Offer => {
                self.is_offerer.store(false, Ordering::SeqCst);
                self.change_signaling_state(SignalingState::HaveRemoteOffer);
            }
            SdpType::Answer => self.change_signaling_state(SignalingState::Stable),
            _ => {}
        }

        let ice = self.init_ice_transport()?;
        let role = if self.is_offerer.load(Ordering::SeqCst) {
            IceRole::Controlling
        } else {
            IceRole::Controlled
        };
        ice.set_remote_parameters(
            IceParameters {
                username_fragment: ice_ufrag,
                password: ice_pwd,
            },
            role,
        )?;
        for candidate in &candidates {
            if let Err(err) = ice.add_remote_candidate(&candidate.candidate) {
                warn!("Rejected remote candidate: {err}");
            }
        }

        // surface remote media we don't know yet as incoming tracks
        for section in description.media() {
            if section.kind != SectionKind::Application
                && self.registry.track(&section.mid).is_none()
            {
                let mut incoming = section.clone();
                incoming.direction = section.direction.reversed();
                let track = TrackImpl::new(incoming);
                if self.registry.register_track(Arc::clone(&track)).is_ok() {
                    self.callbacks.track.call(Track::new(track));
                }
            }
        }

        match sdp_type {
            SdpType::Offer => {
                // answer automatically unless the application negotiates by
                // hand
                if !self.config.disable_auto_negotiation {
                    self.set_local_description(Some(SdpType::Answer))?;
                }
            }
            SdpType::Answer => self.init_transports()?,
            _ => {}
        }
        Ok(())
    }

    fn init_ice_transport(self: &Arc<Self>) -> Result<Arc<IceTransport>> {
        if let Some(ice) = self.ice.lock().unwrap().as_ref() {
            return Ok(Arc::clone(ice));
        }
        debug!("Starting ICE transport");
        let agent = self.backend.new_ice_agent(&self.config)?;
        let ice = IceTransport::new(agent);

        let weak = Arc::downgrade(self);
        ice.on_candidate(Some(Box::new(move |candidate| {
            if let Some(pc) = weak.upgrade() {
                pc.handle_local_candidate(candidate);
            }
        })));
        let weak = Arc::downgrade(self);
        ice.on_gathering_state_change(Some(Box::new(move |state| {
            if let Some(pc) = weak.upgrade() {
                if state == GatheringState::Complete {
                    if let Some(local) = pc.local_description.lock().unwrap().as_mut() {
                        local.end_of_candidates = true;
                    }
                }
                pc.callbacks.gathering_state_change.call(state);
            }
        })));
        let weak = Arc::downgrade(self);
        ice.on_state_change(Some(Box::new(move |_state| {
            if let Some(pc) = weak.upgrade() {
                pc.update_state();
            }
        })));

        Arc::clone(&ice).start()?;
        *self.ice.lock().unwrap() = Some(Arc::clone(&ice));
        self.change_state(PeerConnectionState::Connecting);
        Ok(ice)
    }

    fn handle_local_candidate(&self, candidate: String) {
        let mid = self
            .local_description
            .lock()
            .unwrap()
            .as_mut()
            .map(|local| {
                let mid = local
                    .media()
                    .first()
                    .map(|m| m.mid.clone())
                    .unwrap_or_else(|| "0".to_string());
                local.add_candidate(IceCandidate {
                    candidate: candidate.clone(),
                    mid: mid.clone(),
                });
                mid
            })
            .unwrap_or_else(|| "0".to_string());
        self.callbacks
            .local_candidate
            .call(IceCandidate { candidate, mid });
    }

    /// Brings up DTLS (and SCTP / SRTP as negotiated) once both
    /// descriptions are known.
    fn init_transports(self: &Arc<Self>) -> Result<()> {
        self.init_dtls_transport()?;
        self.init_sctp_transport()?;
        Ok(())
    }

    fn init_dtls_transport(self: &Arc<Self>) -> Result<()> {
        if self.dtls.lock().unwrap().is_some() {
            return Ok(());
        }
        let remote = self
            .remote_description
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::ErrNotAvailable)?;
        let remote_fingerprint = remote.fingerprint.clone().ok_or_else(|| {
            Error::ErrProtocol("remote description without fingerprint".to_string())
        })?;

        // a=setup of the remote side: active means we are the server
        let is_client = match remote.setup {
            SetupRole::Active => false,
            SetupRole::Passive | SetupRole::ActPass => true,
        };

        let has_media = remote
            .media()
            .iter()
            .any(|m| m.kind != SectionKind::Application)
            || !self.registry.tracks_snapshot().is_empty();

        let endpoint = self.backend.new_dtls_endpoint(crate::backend::DtlsConfig {
            is_client,
            certificate_der: self.certificate.certificate_der(),
            private_key_der: self.certificate.private_key_der(),
            mtu: self.config.mtu.unwrap_or(DEFAULT_MTU),
            export_srtp: has_media,
        })?;

        let ice = self
            .ice
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::ErrNotAvailable)?;
        let dtls = DtlsTransport::new(ice, endpoint, is_client, remote_fingerprint);

        let weak = Arc::downgrade(self);
        dtls.on_error(Some(Box::new(move |err| {
            if let Some(pc) = weak.upgrade() {
                pc.fail(err);
            }
        })));
        let weak = Arc::downgrade(self);
        dtls.on_state_change(Some(Box::new(move |state| {
            if let Some(pc) = weak.upgrade() {
                pc.dtls_state_changed(state);
            }
        })));

        if has_media {
            let dtls_srtp = DtlsSrtpTransport::new(Arc::clone(&dtls), Arc::clone(&self.backend));
            let weak = Arc::downgrade(self);
            dtls_srtp.on_media(Some(Box::new(move |message| {
                if let Some(pc) = weak.upgrade() {
                    pc.route_media(message);
                }
            })));
            *self.dtls_srtp.lock().unwrap() = Some(dtls_srtp);
        }

        *self.dtls.lock().unwrap() = Some(Arc::clone(&dtls));
        dtls.start()?;
        Ok(())
    }

    fn dtls_state_changed(self: &Arc<Self>, state: State) {
        match state {
            State::Connected => {
                // SCTP connects over the established DTLS transport
                let sctp = self.sctp.lock().unwrap().clone();
                if let Some(sctp) = sctp {
                    if sctp.state() == State::Disconnected {
                        if let Err(err) = Arc::clone(&sctp).start() {
                            error!("SCTP start failed: {err}");
                            self.fail(err);
                        }
                    }
                }
                // media tracks open with the secured transport
                let dtls_srtp = self.dtls_srtp.lock().unwrap().clone();
                if let Some(dtls_srtp) = dtls_srtp {
                    for track in self.registry.tracks_snapshot() {
                        if !track.is_open() {
                            track.open(&dtls_srtp);
                        }
                    }
                }
            }
            State::Failed | State::Disconnected => {}
            _ => {}
        }
        self.update_state();
    }

    fn init_sctp_transport(self: &Arc<Self>) -> Result<()> {
        if self.sctp.lock().unwrap().is_some() {
            return Ok(());
        }
        let remote = self
            .remote_description
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::ErrNotAvailable)?;
        let Some(application) = remote.application() else {
            return Ok(()); // media-only session
        };
        let remote_port = application.sctp_port.unwrap_or(DEFAULT_SCTP_PORT);
        let local_port = self
            .local_description
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|local| local.application().and_then(|a| a.sctp_port))
            .unwrap_or(DEFAULT_SCTP_PORT);

        let dtls = self
            .dtls
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::ErrNotAvailable)?;
        let association = self.backend.new_sctp_association()?;
        let sctp = SctpTransport::new(
            Arc::clone(&dtls) as Arc<dyn Transport>,
            association,
            Ports {
                local: local_port,
                remote: remote_port,
            },
            dtls.is_client(),
            remote.remote_max_message_size(DEFAULT_REMOTE_MAX_MESSAGE_SIZE),
        );

        let weak = Arc::downgrade(self);
        sctp.on_recv(Some(Box::new(move |message| {
            if let Some(pc) = weak.upgrade() {
                pc.forward_message(message);
            }
        })));
        let weak = Arc::downgrade(self);
        sctp.on_bytes_transmitted(Some(Box::new(move |(stream, amount)| {
            if let Some(pc) = weak.upgrade() {
                if let Some(channel) = pc.registry.channel(stream) {
                    channel.reduce_buffered_amount(amount);
                }
            }
        })));
        let weak = Arc::downgrade(self);
        sctp.on_state_change(Some(Box::new(move |state| {
            if let Some(pc) = weak.upgrade() {
                pc.sctp_state_changed(state);
            }
        })));

        *self.sctp.lock().unwrap() = Some(Arc::clone(&sctp));
        if dtls.state() == State::Connected {
            Arc::clone(&sctp).start()?;
        }
        Ok(())
    }

    fn sctp_state_changed(self: &Arc<Self>, state: State) {
        match state {
            State::Connected => self.open_pending_channels(),
            State::Disconnected | State::Failed => {
                for channel in self.registry.channels_snapshot() {
                    channel.remote_close();
                }
            }
            _ => {}
        }
        self.update_state();
    }

    fn open_pending_channels(self: &Arc<Self>) {
        let sctp = self.sctp.lock().unwrap().clone();
        let Some(sctp) = sctp else { return };
        for channel in self.registry.take_pending_channels() {
            if let Err(err) = self.open_channel(&sctp, &channel) {
                warn!("Failed to open data channel \"{}\": {err}", channel.label());
                channel.fail(err);
            }
        }
    }

    fn open_channel(
        &self,
        sctp: &Arc<SctpTransport>,
        channel: &Arc<DataChannelImpl>,
    ) -> Result<()> {
        let stream = match channel.stream() {
            Some(stream) => stream,
            None => {
                // even ids belong to the DTLS client, odd ids to the server
                let stream = self
                    .registry
                    .find_free_stream(sctp.is_client(), sctp.max_streams())?;
                channel.set_stream(stream);
                stream
            }
        };
        self.registry.register_channel(stream, Arc::clone(channel))?;
        channel.open(sctp)
    }

    /// Demultiplexes one message arriving from the SCTP transport.
    fn forward_message(self: &Arc<Self>, message: Message) {
        let stream = message.stream.unwrap_or(0);
        match message.message_type {
            MessageType::Control => self.forward_control(stream, &message.payload),
            MessageType::Binary | MessageType::String => {
                match self.registry.channel(stream) {
                    Some(channel) => channel.incoming(message),
                    None => trace!("Message on unknown stream {stream}, dropping"),
                }
            }
            MessageType::Reset => {
                if let Some(channel) = self.registry.remove_channel(stream) {
                    channel.remote_close();
                }
            }
        }
    }

    fn forward_control(self: &Arc<Self>, stream: u16, payload: &Bytes) {
        if let Some(channel) = self.registry.channel(stream) {
            channel.process_control(payload);
            return;
        }
        // an OPEN on a fresh stream announces a remote-initiated channel
        match DcepMessage::unmarshal(payload) {
            Ok(DcepMessage::Open(open)) => {
                let sctp = self.sctp.lock().unwrap().clone();
                let Some(sctp) = sctp else { return };
                let init = DataChannelInit {
                    reliability: open.reliability.clone(),
                    protocol: open.protocol.clone(),
                    negotiated: false,
                    stream: Some(stream),
                };
                let channel = DataChannelImpl::new(open.label.clone(), init, false);
                if let Err(err) = self.registry.register_channel(stream, Arc::clone(&channel)) {
                    warn!("Rejecting remote channel on stream {stream}: {err}");
                    return;
                }
                if let Err(err) = channel.open(&sctp) {
                    warn!("Failed to open remote channel: {err}");
                    return;
                }
                channel.process_control(payload);
                self.callbacks.data_channel.call(DataChannel::new(channel));
            }
            Ok(DcepMessage::Ack) => trace!("DCEP ACK on unknown stream {stream}"),
            Err(err) => warn!("Invalid DCEP message on stream {stream}: {err}"),
        }
    }

    /// Routes decrypted RTP/RTCP to a track by SSRC.
    fn route_media(&self, message: Message) {
        let ssrc = media_ssrc(&message.payload);
        let track = ssrc
            .and_then(|ssrc| self.registry.track_by_ssrc(ssrc))
            .or_else(|| self.registry.single_track());
        match track {
            Some(track) => track.incoming(message),
            None => trace!("Media for unknown SSRC {ssrc:?}, dropping"),
        }
    }

    fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing PeerConnection");
        self.negotiation_needed.store(false, Ordering::SeqCst);

        // registry teardown happens before the Closed state is visible
        let (channels, tracks) = self.registry.clear();
        for channel in channels {
            channel.close();
        }
        for track in tracks {
            track.close();
        }

        let close_timeout = self.runtime.close_timeout();
        let sctp = self.sctp.lock().unwrap().take();
        if let Some(sctp) = &sctp {
            sctp.shutdown(close_timeout);
            sctp.stop();
        }
        self.dtls_srtp.lock().unwrap().take();
        if let Some(dtls) = self.dtls.lock().unwrap().take() {
            dtls.stop();
        }
        if let Some(ice) = self.ice.lock().unwrap().take() {
            ice.stop();
        }

        if !self.processor.join_timeout(close_timeout) {
            warn!("Cleanup timed out after {close_timeout:?}, proceeding");
        }

        self.state
            .store(PeerConnectionState::Closed as u8, Ordering::SeqCst);
        self.callbacks.state_change.call(PeerConnectionState::Closed);

        self.callbacks.local_description.set(None);
        self.callbacks.local_candidate.set(None);
        self.callbacks.signaling_state_change.set(None);
        self.callbacks.gathering_state_change.set(None);
        self.callbacks.data_channel.set(None);
        self.callbacks.track.set(None);
        self.callbacks.error.set(None);
        self.callbacks.state_change.set(None);
    }
}

/// Media SSRC of an RTP packet or of the first routable packet in a
/// compound RTCP payload.
fn media_ssrc(payload: &[u8]) -> Option<u32> {
    if is_rtcp(payload) {
        let mut found = None;
        crate::media::rtcp::for_each_packet(payload, |header, packet| {
            if found.is_some() {
                return;
            }
            found = match header.payload_type {
                RTCP_PT_SENDER_REPORT if packet.len() >= 8 => {
                    Some(u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]))
                }
                RTCP_PT_RTPFB | RTCP_PT_PSFB if packet.len() >= 12 => {
                    Some(u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]))
                }
                _ => None,
            };
        });
        found
    } else {
        crate::media::rtp::RtpHeader::unmarshal(payload)
            .ok()
            .map(|(header, _)| header.ssrc)
    }
}

fn allocate_mid(used: &[String]) -> String {
    let mut index = 0usize;
    loop {
        let candidate = index.to_string();
        if !used.contains(&candidate) {
            return candidate;
        }
        index += 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_allocate_mid_skips_used() {
        assert_eq!(allocate_mid(&[]), "0");
        assert_eq!(allocate_mid(&["0".to_string(), "1".to_string()]), "2");
        assert_eq!(allocate_mid(&["video".to_string()]), "0");
    }

    #[test]
    fn test_media_ssrc_extraction() {
        use crate::media::rtcp::{Nack, SenderReport};
        use crate::media::rtp::RtpHeader;
        use bytes::BytesMut;

        let mut rtp = BytesMut::new();
        RtpHeader {
            marker: false,
            payload_type: 102,
            sequence_number: 1,
            timestamp: 0,
            ssrc: 42,
            csrc: vec![],
        }
        .marshal_to(&mut rtp);
        assert_eq!(media_ssrc(&rtp), Some(42));

        let sr = SenderReport {
            ssrc: 7,
            ntp_timestamp: 0,
            rtp_timestamp: 0,
            packet_count: 0,
            octet_count: 0,
        }
        .marshal();
        assert_eq!(media_ssrc(&sr), Some(7));

        let nack = Nack::from_sequence_numbers(1, 99, &[5]).marshal();
        assert_eq!(media_ssrc(&nack), Some(99));
    }
}
