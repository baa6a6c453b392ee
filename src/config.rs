//! Server/client configuration. Every field has a default matching the
//! source config this was modeled on; construct via `Config::default()`
//! and override only what you need, or deserialize a whole bundle from
//! JSON with `serde_json`.

use std::time::Duration;

use serde::Deserialize;

fn default_tcp_addr() -> String {
    "127.0.0.1:6000".to_string()
}
fn default_ws_addr() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_udp_addr() -> String {
    "127.0.0.1:6001".to_string()
}
fn default_len_msg_len() -> u8 {
    2
}
fn default_tcp_min_msg_len() -> usize {
    1
}
fn default_tcp_max_msg_len() -> usize {
    4096
}
fn default_tcp_max_conn_num() -> usize {
    65536
}
fn default_tcp_timeout_secs() -> u64 {
    20
}
fn default_pending_write_num() -> usize {
    100
}
fn default_udp_max_conn_num() -> usize {
    65536
}
fn default_udp_timeout_secs() -> u64 {
    10
}
fn default_udp_min_msg_len() -> usize {
    1
}
fn default_udp_max_msg_len() -> usize {
    4096
}
fn default_connect_interval_secs() -> u64 {
    3
}
fn default_true() -> bool {
    true
}
fn default_channel_capacity() -> usize {
    1024
}
fn default_loop_tick_ms() -> u64 {
    30
}
fn default_reaper_interval_secs() -> u64 {
    10
}

/// TCP server/client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    #[serde(default = "default_tcp_addr")]
    pub addr: String,
    #[serde(default = "default_len_msg_len")]
    pub len_msg_len: u8,
    #[serde(default = "default_tcp_min_msg_len")]
    pub min_msg_len: usize,
    #[serde(default = "default_tcp_max_msg_len")]
    pub max_msg_len: usize,
    #[serde(default = "default_tcp_max_conn_num")]
    pub max_conn_num: usize,
    #[serde(default = "default_tcp_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_pending_write_num")]
    pub pending_write_num: usize,
    #[serde(default)]
    pub little_endian: bool,
    #[serde(default = "default_true")]
    pub reconnect: bool,
    #[serde(default = "default_connect_interval_secs")]
    pub connect_interval_secs: u64,
    #[serde(default = "default_true")]
    pub routine_safe: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            addr: default_tcp_addr(),
            len_msg_len: default_len_msg_len(),
            min_msg_len: default_tcp_min_msg_len(),
            max_msg_len: default_tcp_max_msg_len(),
            max_conn_num: default_tcp_max_conn_num(),
            timeout_secs: default_tcp_timeout_secs(),
            pending_write_num: default_pending_write_num(),
            little_endian: false,
            reconnect: true,
            connect_interval_secs: default_connect_interval_secs(),
            routine_safe: true,
        }
    }
}

impl TcpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_interval(&self) -> Duration {
        Duration::from_secs(self.connect_interval_secs)
    }
}

/// UDP server/client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    #[serde(default = "default_udp_addr")]
    pub addr: String,
    #[serde(default = "default_udp_max_conn_num")]
    pub max_conn_num: usize,
    #[serde(default = "default_udp_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_udp_min_msg_len")]
    pub min_msg_len: usize,
    #[serde(default = "default_udp_max_msg_len")]
    pub max_msg_len: usize,
    #[serde(default)]
    pub little_endian: bool,
    #[serde(default = "default_true")]
    pub reconnect: bool,
    #[serde(default = "default_connect_interval_secs")]
    pub connect_interval_secs: u64,
    #[serde(default = "default_true")]
    pub routine_safe: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            addr: default_udp_addr(),
            max_conn_num: default_udp_max_conn_num(),
            timeout_secs: default_udp_timeout_secs(),
            min_msg_len: default_udp_min_msg_len(),
            max_msg_len: default_udp_max_msg_len(),
            little_endian: false,
            reconnect: true,
            connect_interval_secs: default_connect_interval_secs(),
            routine_safe: true,
        }
    }
}

impl UdpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_interval(&self) -> Duration {
        Duration::from_secs(self.connect_interval_secs)
    }
}

/// WebSocket server/client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    #[serde(default = "default_ws_addr")]
    pub addr: String,
    #[serde(default = "default_tcp_max_msg_len")]
    pub max_msg_len: usize,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    #[serde(default = "default_true")]
    pub reconnect: bool,
    #[serde(default = "default_connect_interval_secs")]
    pub connect_interval_secs: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            addr: default_ws_addr(),
            max_msg_len: default_tcp_max_msg_len(),
            cert_file: None,
            key_file: None,
            reconnect: true,
            connect_interval_secs: default_connect_interval_secs(),
        }
    }
}

impl WsConfig {
    pub fn connect_interval(&self) -> Duration {
        Duration::from_secs(self.connect_interval_secs)
    }
}

/// Tunables for the dispatch loop; mirrors [`crate::dispatch::DispatchConfig`]
/// in a serializable shape so it can live in the same config bundle.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_loop_tick_ms")]
    pub loop_tick_ms: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            loop_tick_ms: default_loop_tick_ms(),
            reaper_interval_secs: default_reaper_interval_secs(),
        }
    }
}

impl From<DispatchSettings> for crate::dispatch::DispatchConfig {
    fn from(settings: DispatchSettings) -> Self {
        crate::dispatch::DispatchConfig {
            channel_capacity: settings.channel_capacity,
            loop_tick: Duration::from_millis(settings.loop_tick_ms),
            reaper_interval: Duration::from_secs(settings.reaper_interval_secs),
        }
    }
}

/// Which profiling dumps a process should write on shutdown, decoded
/// from a bitstring config value ("1111" = cpu, mem, block, goroutine,
/// low bit first). The crate only decodes the flags; it never calls a
/// profiling API itself — wiring an actual profiler to these bits is
/// the binary's job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorFlags {
    pub cpu: bool,
    pub mem: bool,
    pub block: bool,
    pub goroutine: bool,
}

impl MonitorFlags {
    pub fn parse(bits: &str) -> Self {
        let value = i32::from_str_radix(bits, 2).unwrap_or(0);
        Self {
            cpu: value & 0b0001 != 0,
            mem: value & 0b0010 != 0,
            block: value & 0b0100 != 0,
            goroutine: value & 0b1000 != 0,
        }
    }
}

fn default_monitor() -> String {
    "0".to_string()
}

/// Top-level configuration bundle. Deserializes from the same shape the
/// JSON config file this was modeled on used, with `tcp`/`udp`/`web`/
/// `dispatch` sections, all optional and independently defaulted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tcp: TcpConfig,
    pub udp: UdpConfig,
    pub web: WsConfig,
    pub dispatch: DispatchSettings,
    pub log_level: Option<String>,
    #[serde(default = "default_monitor")]
    pub monitor: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
            web: WsConfig::default(),
            dispatch: DispatchSettings::default(),
            log_level: None,
            monitor: default_monitor(),
        }
    }
}

impl Config {
    pub fn from_json(data: &str) -> crate::errors::Result<Self> {
        serde_json::from_str(data).map_err(|e| crate::errors::NetworkError::InvalidConfig(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_flags_decode_low_bit_first() {
        let flags = MonitorFlags::parse("1111");
        assert!(flags.cpu && flags.mem && flags.block && flags.goroutine);

        let flags = MonitorFlags::parse("0010");
        assert!(flags.mem);
        assert!(!flags.cpu && !flags.block && !flags.goroutine);

        assert_eq!(MonitorFlags::parse("0"), MonitorFlags::default());
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.tcp.addr, "127.0.0.1:6000");
        assert_eq!(config.tcp.max_conn_num, 65536);
        assert_eq!(config.udp.timeout_secs, 10);
        assert_eq!(config.dispatch.channel_capacity, 1024);
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let config = Config::from_json(r#"{"tcp": {"addr": "0.0.0.0:9000"}}"#).unwrap();
        assert_eq!(config.tcp.addr, "0.0.0.0:9000");
        assert_eq!(config.tcp.max_conn_num, 65536);
        assert_eq!(config.udp.addr, "127.0.0.1:6001");
    }
}
