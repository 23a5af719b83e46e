/*
 * Copyright 2023 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::filters::FilterRegistry;

/// The id under which the schema of the whole configuration file is written.
const CONFIG_ID: &str = "meshgate.config";

/// Generates JSON schema files for the configuration file and known filters.
#[derive(clap::Args, Clone, Debug)]
pub struct GenerateConfigSchema {
    /// The directory to write configuration files.
    #[clap(short, long, default_value = ".")]
    pub output_directory: std::path::PathBuf,
    /// A list of one or more filter IDs (or `meshgate.config`) to generate,
    /// or 'all' to generate every available schema.
    #[clap(num_args = 1.., default_value = "all")]
    pub filter_ids: Vec<String>,
}

impl GenerateConfigSchema {
    pub fn generate_config_schema(&self) -> crate::Result<()> {
        let all = self.filter_ids.len() == 1 && self.filter_ids[0].eq_ignore_ascii_case("all");
        let mut schemas = Vec::new();

        if all || self.filter_ids.iter().any(|id| id == CONFIG_ID) {
            schemas.push((CONFIG_ID, schemars::schema_for!(crate::Config)));
        }

        if all {
            schemas.extend(
                FilterRegistry::factories()
                    .into_iter()
                    .map(|factory| (factory.name(), factory.config_schema())),
            );
        } else {
            for id in self.filter_ids.iter().filter(|id| *id != CONFIG_ID) {
                match FilterRegistry::get_factory(id) {
                    Some(factory) => schemas.push((factory.name(), factory.config_schema())),
                    None => tracing::error!("{id} not found in filter set."),
                }
            }
        }

        for (id, schema) in schemas {
            let path = self.output_directory.join(format!("{id}.yaml"));

            tracing::info!("Writing {id} schema to {}", path.display());

            std::fs::write(path, serde_yaml::to_string(&schema)?)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{FaultInjection, StaticFilter};

    #[test]
    fn writes_requested_schemas() {
        let tmp_dir = tempfile::tempdir().unwrap();
        GenerateConfigSchema {
            output_directory: tmp_dir.path().to_owned(),
            filter_ids: vec![FaultInjection::NAME.into(), CONFIG_ID.into()],
        }
        .generate_config_schema()
        .unwrap();

        let written = std::fs::read_to_string(
            tmp_dir
                .path()
                .join(format!("{}.yaml", FaultInjection::NAME)),
        )
        .unwrap();
        assert!(written.contains("delay_percent"));
        assert!(tmp_dir.path().join("meshgate.config.yaml").exists());
    }
}
