/*
 * Copyright 2021 Google LLC
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

use std::sync::Arc;

use crate::filters::{CreationError, Filter, StaticFilter};

/// An owned pointer to a dynamic [`FilterFactory`] instance.
pub type DynFilterFactory = Box<dyn FilterFactory>;

/// The value returned by [`FilterFactory::create_filter`]: a filter together
/// with the normalised configuration it was built from.
#[derive(Clone)]
pub struct FilterInstance {
    config: Arc<serde_json::Value>,
    label: Option<String>,
    filter: Arc<dyn Filter>,
}

impl FilterInstance {
    pub fn new(config: serde_json::Value, filter: Arc<dyn Filter>) -> Self {
        Self {
            config: Arc::new(config),
            label: None,
            filter,
        }
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }

    #[inline]
    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    #[inline]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    #[inline]
    pub fn filter(&self) -> &dyn Filter {
        &*self.filter
    }
}

/// Provides the name and creation function for a given [`Filter`].
///
/// - The `create_filter` method takes in configuration for the filter to
///   create and returns a new instance of its filter type.
/// - The `name` method returns the unique identifier of the filter, in the
///   form `meshgate.filters.<module>.<version>.<item-name>`, for example
///   `meshgate.filters.tcp_proxy.v1alpha1.TcpProxy`.
pub trait FilterFactory: Sync + Send {
    /// name returns the configuration name for the Filter
    fn name(&self) -> &'static str;

    /// The JSON schema of the filter's configuration.
    fn config_schema(&self) -> schemars::schema::RootSchema;

    /// Returns a filter based on the provided arguments.
    fn create_filter(&self, args: CreateFilterArgs) -> Result<FilterInstance, CreationError>;

    /// Returns the configuration from the provided Option, otherwise it
    /// returns [`CreationError::MissingConfig`].
    fn require_config(
        &self,
        config: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CreationError> {
        config.ok_or_else(|| CreationError::MissingConfig(self.name()))
    }
}

/// Arguments needed to create a new filter.
#[derive(Clone, Debug, Default)]
pub struct CreateFilterArgs {
    /// Configuration for the filter.
    pub config: Option<serde_json::Value>,
}

impl CreateFilterArgs {
    /// Creates a new instance of [`CreateFilterArgs`] using a fixed
    /// configuration value.
    pub fn fixed(config: Option<serde_json::Value>) -> Self {
        Self { config }
    }
}

impl<F: StaticFilter + 'static> FilterFactory for std::marker::PhantomData<fn() -> F> {
    fn name(&self) -> &'static str {
        F::NAME
    }

    fn config_schema(&self) -> schemars::schema::RootSchema {
        schemars::gen::SchemaGenerator::default().into_root_schema_for::<F::Configuration>()
    }

    fn create_filter(&self, args: CreateFilterArgs) -> Result<FilterInstance, CreationError> {
        let config: Option<F::Configuration> = args
            .config
            .map(serde_json::from_value)
            .transpose()?;
        let normalised = match &config {
            Some(config) => serde_json::to_value(config)?,
            None => serde_json::Value::Null,
        };

        Ok(FilterInstance::new(
            normalised,
            Arc::new(F::try_from_config(config)?),
        ))
    }
}
