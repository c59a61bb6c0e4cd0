// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Client configuration data.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelConfig;
use crate::retry::SessionRetryPolicy;

/// A trait that handles the loading / saving and validity of configuration information.
pub trait Config: serde::Serialize {
    fn save(&self, path: &Path) -> Result<(), ()> {
        if self.is_valid() {
            let s = serde_yaml::to_string(&self).map_err(|_| ())?;
            if let Ok(mut f) = File::create(path) {
                let result = f.write_all(s.as_bytes());
                if result.is_ok() {
                    return Ok(());
                } else {
                    error!("Could not save config - error = {:?}", result.unwrap_err())
                }
            } else {
                error!("Cannot create the path to save the config");
            }
        } else {
            error!("Config isn't valid and won't be saved");
        }
        Err(())
    }

    fn load<A>(path: &Path) -> Result<A, ()>
    where
        for<'de> A: Config + serde::Deserialize<'de>,
    {
        if let Ok(mut f) = File::open(path) {
            let mut s = String::new();
            if f.read_to_string(&mut s).is_ok() {
                serde_yaml::from_str(&s).map_err(|err| {
                    error!(
                        "Cannot deserialize configuration from {}, error reason: {}",
                        path.to_string_lossy(),
                        err
                    );
                })
            } else {
                error!(
                    "Cannot read configuration file {} to string",
                    path.to_string_lossy()
                );
                Err(())
            }
        } else {
            error!("Cannot open configuration file {}", path.to_string_lossy());
            Err(())
        }
    }

    fn is_valid(&self) -> bool;
}

/// Reconnect behavior after a connection loss.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    /// Max backed-off retries after the immediate reconnect attempt that follows a
    /// connection loss: -1 (infinite), 0 (immediate attempt only) or a positive limit.
    pub session_retry_limit: i32,
    /// Sleep before the first backed-off retry, in milliseconds.
    pub session_retry_initial_ms: u64,
    /// Upper bound on the sleep between retries, in milliseconds.
    pub session_retry_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            session_retry_limit: SessionRetryPolicy::DEFAULT_RETRY_LIMIT as i32,
            session_retry_initial_ms: SessionRetryPolicy::DEFAULT_INITIAL_SLEEP_MS,
            session_retry_max_ms: SessionRetryPolicy::DEFAULT_MAX_SLEEP_MS,
        }
    }
}

impl RetryConfig {
    pub(crate) fn policy(&self) -> SessionRetryPolicy {
        let limit = match self.session_retry_limit {
            -1 => None,
            n => Some(n.max(0) as u32),
        };
        SessionRetryPolicy::new(
            Duration::from_millis(self.session_retry_max_ms),
            limit,
            Duration::from_millis(self.session_retry_initial_ms),
        )
    }
}

/// Client configuration.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone)]
pub struct ClientConfig {
    /// Session name sent in the create session request.
    pub session_name: String,
    /// Default timeout for a service request, in milliseconds.
    pub request_timeout_ms: u64,
    /// Session timeout requested from the server, in milliseconds. The server may revise
    /// it.
    pub session_timeout_ms: u64,
    /// Timeout for the discovery exchange, in milliseconds.
    pub discovery_timeout_ms: u64,
    /// Secure channel token lifetime requested from the server, in milliseconds.
    pub channel_token_lifetime_ms: u64,
    /// Maximum number of service requests awaiting a response at once.
    pub max_inflight_messages: usize,
    /// Reconnect behavior.
    pub retry: RetryConfig,
}

impl Config for ClientConfig {
    fn is_valid(&self) -> bool {
        let mut valid = true;

        if self.session_name.is_empty() {
            error!("Session name is empty");
            valid = false;
        }
        if self.request_timeout_ms == 0 {
            error!("Request timeout must be greater than zero");
            valid = false;
        }
        if self.channel_token_lifetime_ms == 0 {
            error!("Channel token lifetime must be greater than zero");
            valid = false;
        }
        if self.max_inflight_messages == 0 {
            error!("Max inflight messages must be greater than zero");
            valid = false;
        }
        if self.retry.session_retry_limit < -1 {
            error!(
                "Session retry limit of {} is invalid - must be -1 (infinite), 0 (never) or a positive value",
                self.retry.session_retry_limit
            );
            valid = false;
        }
        valid
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            session_name: "Rust OPC UA Client".into(),
            request_timeout_ms: 5_000,
            session_timeout_ms: 60_000,
            discovery_timeout_ms: 5_000,
            channel_token_lifetime_ms: 60_000,
            max_inflight_messages: 5,
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub(crate) fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub(crate) fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            max_inflight: self.max_inflight_messages,
            requested_token_lifetime: Duration::from_millis(self.channel_token_lifetime_ms),
        }
    }
}
