//! Server configuration.

use std::time::Duration;

/// Policy applied to every connect request where the caller owns one or
/// both endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelfConnectMode {
    /// Always permit.
    #[default]
    Allow,
    /// Reject when exactly one endpoint is the caller's own port.
    FailExternalOnly,
    /// Silently ignore when exactly one endpoint is the caller's own
    /// port.
    IgnoreExternalOnly,
    /// Reject when either endpoint is the caller's own port.
    FailAll,
    /// Silently ignore when either endpoint is the caller's own port.
    IgnoreAll,
}

impl SelfConnectMode {
    /// Parses the single-character CLI form. Unknown characters fall
    /// back to [`SelfConnectMode::Allow`].
    pub fn from_char(c: char) -> Self {
        match c {
            'E' => Self::FailExternalOnly,
            'e' => Self::IgnoreExternalOnly,
            'A' => Self::FailAll,
            'a' => Self::IgnoreAll,
            _ => Self::Allow,
        }
    }
}

/// Which monotonic clock feeds cycle timestamps.
///
/// All variants currently resolve to the platform monotonic clock; the
/// knob exists so command lines carrying it keep parsing, and for
/// platforms where a different source is wired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSource {
    /// The OS monotonic clock.
    #[default]
    System,
    /// High-precision event timer.
    Hpet,
    /// The CPU cycle counter.
    CycleCounter,
}

/// Server-wide settings.
///
/// Use [`ServerConfig::default()`] for sensible defaults, or customize
/// as needed.
///
/// # Example
///
/// ```
/// use graph_audio::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig {
///     name: "studio".to_string(),
///     client_timeout: Duration::from_millis(250),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server name, used to qualify logs and client-visible identity.
    /// Default: "default"
    pub name: String,

    /// Run the cycle thread with realtime scheduling.
    /// Default: true
    pub realtime: bool,

    /// Priority for the realtime cycle thread.
    /// Default: 10
    pub realtime_priority: i32,

    /// Exit when the last external client closes.
    /// Default: false
    pub temporary: bool,

    /// Size of the port table.
    /// Default: 128
    pub port_max: usize,

    /// How long the cycle waits for one client before marking it timed
    /// out. Close and activate waits derive from this.
    /// Default: 500ms
    pub client_timeout: Duration,

    /// Run the graph in synchronous mode (drivers wait for the full
    /// graph inside the period).
    /// Default: false
    pub sync: bool,

    /// Chattier request-path logging.
    /// Default: false
    pub verbose: bool,

    /// Take over a stale registration of the same server name.
    /// Default: false
    pub replace_registry: bool,

    /// Clock behind cycle timestamps.
    pub clock_source: ClockSource,

    /// Self-connect policy applied on every connect request.
    pub self_connect_mode: SelfConnectMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            realtime: true,
            realtime_priority: 10,
            temporary: false,
            port_max: 128,
            client_timeout: Duration::from_millis(500),
            sync: false,
            verbose: false,
            replace_registry: false,
            clock_source: ClockSource::default(),
            self_connect_mode: SelfConnectMode::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.name, "default");
        assert!(config.realtime);
        assert!(!config.temporary);
        assert_eq!(config.port_max, 128);
        assert_eq!(config.client_timeout, Duration::from_millis(500));
        assert_eq!(config.self_connect_mode, SelfConnectMode::Allow);
    }

    #[test]
    fn test_self_connect_mode_from_char() {
        assert_eq!(
            SelfConnectMode::from_char('E'),
            SelfConnectMode::FailExternalOnly
        );
        assert_eq!(
            SelfConnectMode::from_char('e'),
            SelfConnectMode::IgnoreExternalOnly
        );
        assert_eq!(SelfConnectMode::from_char('A'), SelfConnectMode::FailAll);
        assert_eq!(SelfConnectMode::from_char('a'), SelfConnectMode::IgnoreAll);
        assert_eq!(SelfConnectMode::from_char(' '), SelfConnectMode::Allow);
        assert_eq!(SelfConnectMode::from_char('z'), SelfConnectMode::Allow);
    }
}
