use std::sync::Arc;

use crate::backend::Backend;

/// An ICE server to use for candidate gathering.
#[derive(Default, Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

/// Certificate algorithm requested for the generated DTLS identity.
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CertificateType {
    #[default]
    Ecdsa,
    Ed25519,
}

/// Local settings for a peer connection.
#[derive(Default, Clone)]
pub struct Configuration {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    /// First UDP port usable for gathering; 0 means any.
    pub port_range_begin: u16,
    /// Last UDP port usable for gathering; 0 means any.
    pub port_range_end: u16,
    pub enable_udp_mux: bool,
    pub enable_ice_tcp: bool,
    pub bind_address: Option<String>,
    pub mtu: Option<usize>,
    /// Local maximum SCTP message size advertised in the SDP.
    pub max_message_size: Option<usize>,
    /// When set, creating a track or data channel does not schedule a
    /// renegotiation offer.
    pub disable_auto_negotiation: bool,
    pub certificate_type: CertificateType,
    /// PEM certificate and key to reuse an existing DTLS identity. Either
    /// none or both must be set.
    pub certificate_pem: Option<String>,
    pub key_pem: Option<String>,
    /// Protocol engines for the out-of-scope collaborators (ICE agent, DTLS
    /// endpoint, SCTP stack, SRTP session).
    pub backend: Option<Arc<dyn Backend>>,
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("ice_servers", &self.ice_servers)
            .field("ice_transport_policy", &self.ice_transport_policy)
            .field("port_range_begin", &self.port_range_begin)
            .field("port_range_end", &self.port_range_end)
            .field("enable_udp_mux", &self.enable_udp_mux)
            .field("enable_ice_tcp", &self.enable_ice_tcp)
            .field("bind_address", &self.bind_address)
            .field("mtu", &self.mtu)
            .field("max_message_size", &self.max_message_size)
            .field("disable_auto_negotiation", &self.disable_auto_negotiation)
            .field("certificate_type", &self.certificate_type)
            .finish_non_exhaustive()
    }
}
