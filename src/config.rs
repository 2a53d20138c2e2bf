// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{collections::HashMap, fs, path::PathBuf, time};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::consts;

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else if let Ok(home) = std::env::var("HOME") {
        let mut config_path = PathBuf::from(home);
        config_path.push(".config");
        config_path.push("codewire");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The number of bytes of output history each session keeps in
    /// its ring buffer. By default, 4 MiB.
    pub output_ring_bytes: Option<usize>,

    /// How many bytes may pile up unsent for one attacher before
    /// the session drops it as a slow consumer. By default, 256 KiB.
    pub attacher_high_water: Option<usize>,

    /// How many events one subscription may buffer before the bus
    /// discards the oldest. By default, 256.
    pub subscription_buffer: Option<usize>,

    /// How many directed messages a session inbox retains.
    /// By default, 1000.
    pub inbox_cap: Option<usize>,

    /// How long a MsgRequest waits for a reply when the request
    /// does not carry a timeout. In seconds, by default 30.
    pub default_request_timeout_s: Option<u64>,

    /// A table of environment variables to inject into every
    /// launched session, applied before the per-launch env overlay.
    pub env: Option<HashMap<String, String>>,
}

impl Config {
    pub fn output_ring_bytes(&self) -> usize {
        self.output_ring_bytes.unwrap_or(consts::DEFAULT_OUTPUT_RING_BYTES)
    }

    pub fn attacher_high_water(&self) -> usize {
        self.attacher_high_water.unwrap_or(consts::DEFAULT_ATTACHER_HIGH_WATER)
    }

    pub fn subscription_buffer(&self) -> usize {
        self.subscription_buffer.unwrap_or(consts::DEFAULT_SUBSCRIPTION_BUFFER)
    }

    pub fn inbox_cap(&self) -> usize {
        self.inbox_cap.unwrap_or(consts::DEFAULT_INBOX_CAP)
    }

    pub fn default_request_timeout(&self) -> time::Duration {
        self.default_request_timeout_s
            .map(time::Duration::from_secs)
            .unwrap_or(consts::DEFAULT_REQUEST_TIMEOUT)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(30000)]
    fn parse() -> anyhow::Result<()> {
        let cases = vec![
            r#"
            output_ring_bytes = 65536
            "#,
            r#"
            attacher_high_water = 1024
            subscription_buffer = 16
            "#,
            r#"
            [env]
            LANG = "C"
            "#,
        ];

        for case in cases.into_iter() {
            let _: Config = toml::from_str(case)?;
        }

        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn defaults_applied() {
        let config = Config::default();
        assert_eq!(config.output_ring_bytes(), consts::DEFAULT_OUTPUT_RING_BYTES);
        assert_eq!(config.inbox_cap(), consts::DEFAULT_INBOX_CAP);
        assert_eq!(config.default_request_timeout(), consts::DEFAULT_REQUEST_TIMEOUT);
    }
}
