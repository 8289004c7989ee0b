// Copyright 2024-2025 Golem Cloud
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

use std::env;
use std::str::FromStr;
use std::time::Duration;

use plexus_common::model::Language;

use crate::WorkerError;

/// Worker settings come from the environment the provider adapter injected
/// at sandbox start, not from a config file.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Transport identity chosen by the control plane.
    pub component_id: String,
    /// Router endpoint of the owning control plane.
    pub transport_addr: String,
    /// Object store endpoint of the owning control plane.
    pub store_addr: String,
    pub language: Language,
    pub dependency_install_timeout: Duration,
    pub fetch_timeout: Duration,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, WorkerError> {
        let component_id = require_env("COMPONENT_ID")?;
        let transport_addr = require_env("TRANSPORT_ADDR")?;
        let store_addr = require_env("STORE_ADDR")?;
        let language = match env::var("LANGUAGE") {
            Ok(value) => Language::from_str(&value).map_err(WorkerError::InvalidConfig)?,
            Err(_) => Language::Unknown,
        };
        let dependency_install_timeout =
            duration_env("PLEXUS_INSTALL_TIMEOUT", Duration::from_secs(300))?;
        let fetch_timeout = duration_env("PLEXUS_FETCH_TIMEOUT", Duration::from_secs(30))?;

        Ok(Self {
            component_id,
            transport_addr,
            store_addr,
            language,
            dependency_install_timeout,
            fetch_timeout,
            connect_attempts: 10,
            connect_backoff: Duration::from_millis(200),
        })
    }
}

fn require_env(name: &'static str) -> Result<String, WorkerError> {
    env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or(WorkerError::MissingEnv(name))
}

fn duration_env(name: &'static str, default: Duration) -> Result<Duration, WorkerError> {
    match env::var(name) {
        Ok(value) => humantime::parse_duration(&value)
            .map_err(|err| WorkerError::InvalidConfig(format!("{name}: {err}"))),
        Err(_) => Ok(default),
    }
}
