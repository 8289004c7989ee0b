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

use plexus_common::tracing::init_tracing_with_default_env_filter;
use plexus_common::SafeDisplay;
use plexus_control_plane::config::make_config_loader;
use plexus_control_plane::ControlPlane;
use tokio::task::JoinSet;
use tracing::info;

fn main() -> Result<(), anyhow::Error> {
    let Some(config) = make_config_loader().load_or_dump_config() else {
        return Ok(());
    };

    init_tracing_with_default_env_filter(&config.tracing);
    info!("Starting control plane with config:\n{}", config.to_safe_string());

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            let control_plane = ControlPlane::new(config).await?;
            let mut join_set = JoinSet::new();
            control_plane.run(&mut join_set).await?;
            while let Some(result) = join_set.join_next().await {
                result??;
            }
            Ok(())
        })
}
