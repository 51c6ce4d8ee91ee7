//! Engine tunables.
//!
//! All values have working defaults; deployments override them through the
//! service configuration file. Ring sizes affect memory use and backpressure
//! behavior: the outbound ring bounds in-flight transmissions per port, the
//! receive ring bounds undelivered messages per channel.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Channel-manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmConfig {
    /// Mailbox number used on every managed port.
    ///
    /// Default: 1
    #[serde(default = "default_mbox")]
    pub mbox: u8,

    /// First channel ID handed out by dynamic allocation. IDs below this
    /// are reserved for explicit requests.
    ///
    /// Default: 256
    #[serde(default = "default_chan_start")]
    pub chan_start: u16,

    /// Outbound ring size per port. Must be a power of two.
    ///
    /// Default: 128
    #[serde(default = "default_tx_ring_size")]
    pub tx_ring_size: usize,

    /// Receive ring size, used both for the per-port inbound buffer pool
    /// and the per-channel receive ring.
    ///
    /// Default: 128
    #[serde(default = "default_rx_ring_size")]
    pub rx_ring_size: usize,

    /// How long a connect waits for the remote accept, in milliseconds.
    ///
    /// Default: 3000
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_mbox() -> u8 {
    1
}

fn default_chan_start() -> u16 {
    256
}

fn default_tx_ring_size() -> usize {
    128
}

fn default_rx_ring_size() -> usize {
    128
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

impl Default for CmConfig {
    fn default() -> Self {
        Self {
            mbox: default_mbox(),
            chan_start: default_chan_start(),
            tx_ring_size: default_tx_ring_size(),
            rx_ring_size: default_rx_ring_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl CmConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.chan_start == 0 {
            return Err("chan_start must be at least 1".to_string());
        }
        if self.tx_ring_size == 0 || !self.tx_ring_size.is_power_of_two() {
            return Err(format!(
                "tx_ring_size must be a non-zero power of two, got {}",
                self.tx_ring_size
            ));
        }
        if self.rx_ring_size == 0 {
            return Err("rx_ring_size must be non-zero".to_string());
        }
        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be non-zero".to_string());
        }

        if self.rx_ring_size > 4096 {
            tracing::warn!(
                rx_ring_size = self.rx_ring_size,
                "rx_ring_size is very large, every channel pins this many buffers"
            );
        }

        Ok(())
    }

    /// Connect-response wait duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = CmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mbox, 1);
        assert_eq!(config.chan_start, 256);
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_tx_ring_must_be_power_of_two() {
        let config = CmConfig {
            tx_ring_size: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        for bad in [
            CmConfig {
                chan_start: 0,
                ..Default::default()
            },
            CmConfig {
                rx_ring_size: 0,
                ..Default::default()
            },
            CmConfig {
                connect_timeout_ms: 0,
                ..Default::default()
            },
        ] {
            assert!(bad.validate().is_err());
        }
    }
}
