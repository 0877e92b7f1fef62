use std::{net::IpAddr, time::Duration};

use crate::common::PROTOCOL_VERSION;

use super::{filter::RangeFilter, socket::udp::Udp};

/// Default port to listen on, falls back to a random port if it is taken.
pub const DEFAULT_PORT: u16 = 6881;
/// Default request timeout before abandoning an inflight request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Maximum number of concurrent transfers in each direction.
pub const DEFAULT_MAX_TRANSFERS: usize = 64;
/// How long a reader waits for a chunk before re-requesting.
pub const DEFAULT_READ_REREQUEST_DELAY: Duration = Duration::from_millis(5000);
/// How long a writer waits for an acknowledgement before resending.
pub const DEFAULT_WRITE_RESEND_DELAY: Duration = Duration::from_millis(12500);
/// Timeout for receiving an inbound write and writing back its reply.
pub const DEFAULT_WRITE_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Period of sampling alien traffic for reachability.
pub const DEFAULT_STATS_PERIOD: Duration = Duration::from_secs(60);
/// Reachability is only trusted after this warm-up period.
pub const DEFAULT_STATS_INIT_PERIOD: Duration = Duration::from_secs(15 * 60);

/// How long to wait for each contact asked about our external address.
pub const DEFAULT_ADDRESS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of addresses the bad-IP set is sized for.
pub const DEFAULT_BAD_IP_CAPACITY: usize = 32_000;
/// The bad-IP set is cleared once this fraction of its capacity is used.
pub const DEFAULT_BAD_IP_RESET_FRACTION: f64 = 0.1;

#[derive(Debug)]
/// Transport Configurations
pub struct Config {
    /// Explicit port to listen on.
    ///
    /// Defaults to None, where [DEFAULT_PORT] is tried first, then a random port.
    pub port: Option<u16>,
    /// A custom socket, for example an in-memory [super::udp::sim::UdpSocket] in tests.
    ///
    /// Overrides `port` if set.
    pub socket: Option<Box<dyn Udp>>,
    /// Protocol version advertised in outgoing packets.
    ///
    /// Defaults to [PROTOCOL_VERSION]
    pub protocol_version: u8,
    /// Request timeout duration; store requests get twice as long.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// A known external IP address for this node.
    ///
    /// Defaults to None, where the address is learned from the consensus
    /// of contacts in [crate::Transport::refresh_external_address].
    /// An unspecified address fails with [crate::Error::InvalidAddress].
    pub external_ip: Option<IpAddr>,
    /// Bootstrap nodes only answer find-node lookups of the requester's own Id.
    ///
    /// Defaults to false
    pub bootstrap_node: bool,

    /// Maximum number of concurrent transfers per direction.
    ///
    /// Defaults to [DEFAULT_MAX_TRANSFERS]
    pub max_transfers: usize,
    /// Defaults to [DEFAULT_READ_REREQUEST_DELAY]
    pub read_rerequest_delay: Duration,
    /// Defaults to [DEFAULT_WRITE_RESEND_DELAY]
    pub write_resend_delay: Duration,
    /// Defaults to [DEFAULT_WRITE_REPLY_TIMEOUT]
    pub write_reply_timeout: Duration,

    /// Defaults to [DEFAULT_STATS_PERIOD]
    pub stats_period: Duration,
    /// Defaults to [DEFAULT_STATS_INIT_PERIOD]
    pub stats_init_period: Duration,
    /// Assumed reachability until the first sample after `stats_init_period`.
    ///
    /// Defaults to false
    pub initial_reachability: bool,
    /// Defaults to [DEFAULT_ADDRESS_PROBE_TIMEOUT]
    pub address_probe_timeout: Duration,

    /// External range based IP filter, enables admission filtering when set.
    ///
    /// Defaults to None
    pub ip_filter: Option<Box<dyn RangeFilter>>,
    /// Defaults to [DEFAULT_BAD_IP_CAPACITY]
    pub bad_ip_capacity: usize,
    /// Defaults to [DEFAULT_BAD_IP_RESET_FRACTION]
    pub bad_ip_reset_fraction: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            socket: None,
            protocol_version: PROTOCOL_VERSION,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            external_ip: None,
            bootstrap_node: false,

            max_transfers: DEFAULT_MAX_TRANSFERS,
            read_rerequest_delay: DEFAULT_READ_REREQUEST_DELAY,
            write_resend_delay: DEFAULT_WRITE_RESEND_DELAY,
            write_reply_timeout: DEFAULT_WRITE_REPLY_TIMEOUT,

            stats_period: DEFAULT_STATS_PERIOD,
            stats_init_period: DEFAULT_STATS_INIT_PERIOD,
            initial_reachability: false,
            address_probe_timeout: DEFAULT_ADDRESS_PROBE_TIMEOUT,

            ip_filter: None,
            bad_ip_capacity: DEFAULT_BAD_IP_CAPACITY,
            bad_ip_reset_fraction: DEFAULT_BAD_IP_RESET_FRACTION,
        }
    }
}
