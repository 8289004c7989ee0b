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

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Requirements for a loadable service configuration: serde both ways plus
/// a complete `Default` so that a missing config file still yields a
/// runnable local setup.
pub trait ConfigLoaderConfig: DeserializeOwned + Serialize + Default {}

impl<T: DeserializeOwned + Serialize + Default> ConfigLoaderConfig for T {}

/// Layered configuration loading: compiled-in defaults, then the TOML
/// config file, then `PLEXUS__` prefixed environment variables
/// (`PLEXUS__PEER__GOSSIP_INTERVAL=5s` overrides `peer.gossip_interval`).
pub struct ConfigLoader<T: ConfigLoaderConfig> {
    pub config_file_name: PathBuf,
    phantom_data: PhantomData<T>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            phantom_data: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(self.config_file_name.as_path()))
            .merge(Env::prefixed("PLEXUS__").split("__"))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// Loads the configuration, or dumps the effective defaults as TOML to
    /// stdout and returns `None` when `--dump-config` was passed. Load
    /// failures are fatal for a service binary.
    pub fn load_or_dump_config(&self) -> Option<T> {
        if std::env::args().any(|arg| arg == "--dump-config") {
            let config = T::default();
            match toml::to_string(&config) {
                Ok(dump) => println!("{dump}"),
                Err(err) => eprintln!("Failed to dump config: {err}"),
            }
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(err) => {
                    eprintln!(
                        "Failed to load config from {:?}: {err}",
                        self.config_file_name
                    );
                    std::process::exit(1);
                }
            }
        }
    }
}
