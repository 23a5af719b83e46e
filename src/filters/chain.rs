/*
 * Copyright 2020 Google LLC
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

use prometheus::{exponential_buckets, Histogram};

use crate::{
    config::Filter as FilterConfig,
    filters::{prelude::*, FilterRegistry},
    metrics::{histogram_opts, CollectorExt},
};

const FILTER_LABEL: &str = "filter";

/// Start the histogram bucket at a millisecond, most filters return almost
/// immediately but delays and relays last seconds to hours.
const BUCKET_START: f64 = 0.001;

const BUCKET_FACTOR: f64 = 4.0;

/// At an exponential factor of 4 ([`BUCKET_FACTOR`]), 12 iterations gets us to
/// a little over an hour.
const BUCKET_COUNT: usize = 12;

/// A chain of [`Filter`]s to be executed in order.
///
/// The chain itself is immutable and shared by every connection of a
/// listener, each connection runs it with its own [`ConnectionContext`]. If
/// any filter returns an error the chain is broken and the error returned.
/// Execution also stops once a terminal filter has taken the connection.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<(String, FilterInstance)>,
    filter_connection_duration_seconds: Vec<Histogram>,
}

impl FilterChain {
    pub fn new(filters: Vec<(String, FilterInstance)>) -> Result<Self, CreationError> {
        let subsystem = "filter";

        Ok(Self {
            filter_connection_duration_seconds: filters
                .iter()
                .map(|(name, _)| {
                    Histogram::with_opts(
                        histogram_opts(
                            "connection_duration_seconds",
                            subsystem,
                            "Seconds taken to execute a given filter's `on_new_connection`.",
                            Some(
                                exponential_buckets(BUCKET_START, BUCKET_FACTOR, BUCKET_COUNT)
                                    .unwrap(),
                            ),
                        )
                        .const_label(FILTER_LABEL, name),
                    )
                    .and_then(|histogram| histogram.register_if_not_exists())
                })
                .collect::<Result<_, prometheus::Error>>()?,
            filters,
        })
    }

    pub fn testing<const N: usize>(filters: [FilterInstance; N]) -> Self {
        let filters = filters.into_iter().map(|f| (String::new(), f)).collect();
        Self::new(filters).unwrap()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = FilterConfig> + '_ {
        self.filters.iter().map(|(name, instance)| FilterConfig {
            name: name.clone(),
            label: instance.label().map(String::from),
            config: match instance.config() {
                serde_json::Value::Null => None,
                value => Some(value.clone()),
            },
        })
    }

    /// Validates the filter configurations in the provided config and constructs
    /// a [`Self`] if all configurations are valid.
    pub fn try_create(
        filter_configs: impl IntoIterator<Item = FilterConfig>,
    ) -> Result<Self, CreationError> {
        let mut filters = Vec::new();

        for filter_config in filter_configs {
            let filter = FilterRegistry::get(
                &filter_config.name,
                CreateFilterArgs::fixed(filter_config.config),
            )?
            .with_label(filter_config.label);

            filters.push((filter_config.name, filter));
        }

        Self::new(filters)
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut filters = f.debug_struct("Filters");

        for (id, instance) in &self.filters {
            filters.field(id, instance.config());
        }

        filters.finish()
    }
}

impl PartialEq for FilterChain {
    fn eq(&self, rhs: &Self) -> bool {
        if self.filters.len() != rhs.filters.len() {
            return false;
        }

        self.filters.iter().zip(&rhs.filters).all(
            |((lhs_name, lhs_instance), (rhs_name, rhs_instance))| {
                lhs_name == rhs_name
                    && lhs_instance.config() == rhs_instance.config()
                    && lhs_instance.label() == rhs_instance.label()
            },
        )
    }
}

impl std::ops::Index<usize> for FilterChain {
    type Output = (String, FilterInstance);

    fn index(&self, index: usize) -> &Self::Output {
        &self.filters[index]
    }
}

impl<'de> serde::Deserialize<'de> for FilterChain {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let filters = <Vec<FilterConfig>>::deserialize(de)?;

        Self::try_create(filters).map_err(serde::de::Error::custom)
    }
}

impl serde::Serialize for FilterChain {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        self.iter().collect::<Vec<_>>().serialize(ser)
    }
}

impl schemars::JsonSchema for FilterChain {
    fn schema_name() -> String {
        <Vec<FilterConfig>>::schema_name()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        <Vec<FilterConfig>>::json_schema(gen)
    }

    fn is_referenceable() -> bool {
        <Vec<FilterConfig>>::is_referenceable()
    }
}

#[async_trait::async_trait]
impl Filter for FilterChain {
    async fn on_new_connection(&self, ctx: &mut ConnectionContext) -> Result<(), FilterError> {
        for ((id, instance), histogram) in self
            .filters
            .iter()
            .zip(self.filter_connection_duration_seconds.iter())
        {
            tracing::trace!(%id, "running filter");
            let timer = histogram.start_timer();
            let result = instance.filter().on_new_connection(ctx).await;
            timer.stop_and_record();

            if let Err(error) = result {
                tracing::trace!(%id, %error, "filter closed connection");
                return Err(error);
            }

            if ctx.is_terminated() {
                tracing::trace!(%id, "filter took connection");
                break;
            }
        }

        Ok(())
    }
}
