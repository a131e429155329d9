pub(crate) const DEFAULT_SCTP_PORT: u16 = 5000; // SCTP port to use by default

pub(crate) const MAX_SCTP_STREAMS_COUNT: u16 = 1024; // Max number of negotiated SCTP streams
                                                     // RFC 8831 recommends 65535 but SCTP stacks need a lot
                                                     // of memory, Chromium historically limits to 1024.

pub(crate) const DEFAULT_LOCAL_MAX_MESSAGE_SIZE: usize = 256 * 1024; // Default local max message size

pub(crate) const DEFAULT_REMOTE_MAX_MESSAGE_SIZE: usize = 65536; // Remote max message size if not in SDP

pub(crate) const DEFAULT_WS_MAX_MESSAGE_SIZE: usize = 256 * 1024; // Default max message size for WebSockets

pub(crate) const RECV_QUEUE_LIMIT: usize = 1024 * 1024; // Max per-channel queue amount (bytes)

pub(crate) const SEND_QUEUE_LIMIT: usize = 1024 * 1024; // Max SCTP outbound queue amount (bytes)

pub(crate) const MIN_THREADPOOL_SIZE: usize = 4; // Minimum number of threads in the global thread pool (>= 2)

pub(crate) const DEFAULT_MTU: usize = 1280; // IPv6 minimum guaranteed MTU

pub(crate) const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 10_000; // Graceful cleanup timeout
