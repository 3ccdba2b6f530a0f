//! Configuration management
//!
//! Defaults follow the RFC values. A TOML file and `SIPUA__`-prefixed
//! environment variables (`SIPUA__CALL__SESSION_EXPIRES=600`) override them.

use crate::domain::shared::EngineError;
use crate::infrastructure::protocols::sip::transaction::SipTimers;
use crate::infrastructure::protocols::sip::transport::TransportProtocol;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Route every out-of-dialog request through this URI
    pub outbound_proxy: Option<String>,
    pub local: LocalConfig,
    pub timers: TimerConfig,
    pub call: CallConfig,
    pub registration: RegistrationConfig,
    pub subscription: SubscriptionConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub bind_address: String,
    pub port: u16,
    pub transport: TransportProtocol,
    /// Host written into Via and Contact; defaults to the bind address
    pub host: Option<String>,
    /// User part of our Contact
    pub user: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
}

/// Who should refresh the session (RFC 4028)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefresherPreference {
    /// Leave the choice to the peer
    Any,
    Local,
    Remote,
}

/// Use of reliable provisional responses (RFC 3262)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReliableProvisional {
    Disabled,
    Supported,
    Required,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Requested Session-Expires in seconds, 0 disables session timers
    pub session_expires: u32,
    pub min_se: u32,
    pub refresher: RefresherPreference,
    pub reliable_provisional: ReliableProvisional,
    /// Require preconditions on outgoing INVITEs
    pub preconditions: bool,
    /// Retries of a (re-)INVITE answered 5xx with Retry-After
    pub max_invite_retries: u32,
    /// Retries of a re-INVITE answered 491
    pub max_glare_retries: u32,
    /// Answer incoming REFER with 202 without asking the application
    pub auto_accept_refer: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub expires: u32,
    /// Fraction of the granted expiry after which we refresh
    pub refresh_ratio: f64,
    /// OPTIONS keep-alive interval once NAT is detected, 0 disables
    pub keepalive_interval_secs: u32,
    /// Unanswered keep-alives before the connection is reset
    pub keepalive_max_failures: u32,
    pub nat_detection: bool,
    /// Delay before retrying a failed registration, 0 disables
    pub retry_interval_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub expires: u32,
    pub refresh_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Challenges answered per realm before giving up
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            outbound_proxy: None,
            local: LocalConfig::default(),
            timers: TimerConfig::default(),
            call: CallConfig::default(),
            registration: RegistrationConfig::default(),
            subscription: SubscriptionConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5060,
            transport: TransportProtocol::Udp,
            host: None,
            user: "sipua".to_string(),
            user_agent: format!("sipua/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t1_ms: 500,
            t2_ms: 4000,
            t4_ms: 5000,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            session_expires: 1800,
            min_se: 90,
            refresher: RefresherPreference::Any,
            reliable_provisional: ReliableProvisional::Supported,
            preconditions: false,
            max_invite_retries: 2,
            max_glare_retries: 3,
            auto_accept_refer: true,
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            expires: 3600,
            refresh_ratio: 0.9,
            keepalive_interval_secs: 30,
            keepalive_max_failures: 3,
            nat_detection: true,
            retry_interval_secs: 0,
        }
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            expires: 3600,
            refresh_ratio: 0.9,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { max_retries: 1 }
    }
}

impl TimerConfig {
    pub fn sip_timers(&self) -> SipTimers {
        SipTimers {
            t1: Duration::from_millis(self.t1_ms),
            t2: Duration::from_millis(self.t2_ms),
            t4: Duration::from_millis(self.t4_ms),
        }
    }
}

impl EngineConfig {
    /// Load defaults, then the optional TOML file, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        let defaults = config::Config::try_from(&EngineConfig::default())
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder
            .add_source(
                config::Environment::with_prefix("SIPUA")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, EngineError> {
        toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, EngineError> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Reject values the state machines cannot work with
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.timers.t1_ms == 0 || self.timers.t2_ms < self.timers.t1_ms {
            return Err(EngineError::Config("T2 must be at least T1 and T1 non-zero".to_string()));
        }
        if !(0.1..=1.0).contains(&self.registration.refresh_ratio)
            || !(0.1..=1.0).contains(&self.subscription.refresh_ratio)
        {
            return Err(EngineError::Config("refresh_ratio must be within 0.1..=1.0".to_string()));
        }
        if self.call.session_expires != 0 && self.call.session_expires < self.call.min_se {
            return Err(EngineError::Config("session_expires below min_se".to_string()));
        }
        Ok(())
    }

    /// Host written into Via and Contact
    pub fn local_host(&self) -> String {
        self.local
            .host
            .clone()
            .unwrap_or_else(|| self.local.bind_address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timers.sip_timers(), SipTimers::default());
        assert_eq!(config.call.max_invite_retries, 2);
        assert_eq!(config.auth.max_retries, 1);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            outbound_proxy = "sip:proxy.example.com;lr"

            [call]
            session_expires = 300
            reliable_provisional = "required"

            [local]
            transport = "tcp"
            "#,
        )
        .unwrap();
        assert_eq!(config.call.session_expires, 300);
        assert_eq!(config.call.reliable_provisional, ReliableProvisional::Required);
        assert_eq!(config.call.min_se, 90);
        assert_eq!(config.local.transport, TransportProtocol::Tcp);
        assert_eq!(config.registration.expires, 3600);
    }

    #[test]
    fn test_toml_dump_loads_back() {
        let mut config = EngineConfig::default();
        config.registration.keepalive_max_failures = 5;
        let text = config.to_toml().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_timers() {
        let mut config = EngineConfig::default();
        config.timers.t2_ms = 100;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = EngineConfig::load(None).unwrap();
        assert_eq!(config.local.port, 5060);
        assert_eq!(config.subscription.expires, 3600);
    }
}
