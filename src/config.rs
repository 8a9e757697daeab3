// Copyright 2020 Joyent, Inc.

use std::time::Duration;

use serde_derive::Deserialize;

use crate::error::Result;

pub const DEFAULT_MAX_WORKERS: usize = 32;
pub const DEFAULT_SWEEP_INTERVAL_MILLIS: u64 = 1000;
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Services running at the same time.
    pub max_workers: usize,
    /// Conversations allowed to wait for a worker. Past that, opens are
    /// rejected with `ServerBusy`.
    pub work_queue_size: usize,
    /// Upper bound for the pause between two registry sweeps. The sweeper
    /// shortens it on its own when a factory with a smaller client timeout
    /// is registered.
    pub sweep_interval_millis: u64,
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_workers: DEFAULT_MAX_WORKERS,
            work_queue_size: 0,
            sweep_interval_millis: DEFAULT_SWEEP_INTERVAL_MILLIS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(s: &str) -> Result<ServerConfig> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = n.max(1);
        self
    }

    pub fn work_queue_size(mut self, n: usize) -> Self {
        self.work_queue_size = n;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_millis = interval.as_millis() as u64;
        self
    }

    pub fn sweep_interval_duration(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_millis.max(1))
    }

    /// Conversations that may be in flight, running or queued.
    pub fn capacity(&self) -> usize {
        self.max_workers.max(1).saturating_add(self.work_queue_size)
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Name under which the server knows this client's response transport.
    pub client_id: Option<String>,
    pub session_token: Option<String>,
    /// Overrides the receive deadline the server suggests per service type.
    pub receive_timeout_millis: Option<u64>,
}

impl ClientConfig {
    pub fn from_json_str(s: &str) -> Result<ClientConfig> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn client_id<S: Into<String>>(mut self, id: S) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn session_token<S: Into<String>>(mut self, token: S) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout_millis = Some(timeout.as_millis() as u64);
        self
    }
}
