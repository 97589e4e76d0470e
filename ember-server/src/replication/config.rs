use serde::{Deserialize, Serialize};

/// Replication configuration, shared by both roles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Address this replica announces to its primary (REPLCONF
    /// ip-address); defaults to the socket's own address
    pub announce_ip: Option<String>,
    /// Port this replica announces (REPLCONF listening-port)
    pub announce_port: Option<u16>,
    /// Secret sent via AUTH during the handshake, and required of
    /// inbound connections when set
    pub primary_auth: Option<String>,
    /// Replica tears down and reconnects when nothing arrives from
    /// the primary for this long
    pub replica_timeout_secs: u64,
    /// Backlog size that triggers rotation
    pub backlog_ceiling_bytes: u64,
    /// Primary housekeeping cadence (delta push, rotation check)
    pub cron_interval_ms: u64,
    /// Keepalive PING cadence on the replicated stream
    pub ping_interval_secs: u64,
    /// Replica-side delay between reconnect attempts
    pub reconnect_delay_ms: u64,
    /// Replica-side REPLCONF ACK cadence
    pub ack_interval_secs: u64,
    /// Optional "host:port" primary to follow from startup
    pub replica_of: Option<String>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            announce_ip: None,
            announce_port: None,
            primary_auth: None,
            replica_timeout_secs: 60,
            backlog_ceiling_bytes: 64 * 1024 * 1024,
            cron_interval_ms: 100,
            ping_interval_secs: 10,
            reconnect_delay_ms: 1000,
            ack_interval_secs: 1,
            replica_of: None,
        }
    }
}

impl ReplicationConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.cron_interval_ms == 0 {
            return Err("cron_interval_ms must be positive".to_string());
        }
        if self.replica_timeout_secs == 0 {
            return Err("replica_timeout_secs must be positive".to_string());
        }
        if let Some(target) = &self.replica_of {
            parse_host_port(target)?;
        }
        Ok(())
    }
}

/// Split a "host:port" target
pub fn parse_host_port(target: &str) -> Result<(String, u16), String> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| format!("expected host:port, got '{target}'"))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("bad port in '{target}'"))?;
    if host.is_empty() {
        return Err(format!("empty host in '{target}'"));
    }
    Ok((host.to_string(), port))
}
