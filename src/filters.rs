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

//! Network filters applied to accepted connections.

mod chain;
mod connection;
mod error;
mod factory;
mod registry;
mod set;

pub mod fault_injection;
pub mod tcp_proxy;

/// Prelude containing all types and traits required to implement [`Filter`] and
/// [`FilterFactory`].
pub mod prelude {
    pub use super::{
        ConnectionContext, CreateFilterArgs, CreationError, DynFilterFactory, Filter,
        FilterError, FilterFactory, FilterInstance, StaticFilter,
    };
}

// Core Filter types
#[doc(inline)]
pub use self::{
    chain::FilterChain,
    connection::ConnectionContext,
    error::{CreationError, FilterError},
    factory::{CreateFilterArgs, DynFilterFactory, FilterFactory, FilterInstance},
    fault_injection::FaultInjection,
    registry::FilterRegistry,
    set::{FilterMap, FilterSet},
    tcp_proxy::TcpProxy,
};

/// Statically safe version of [`Filter`], if you're writing a Rust filter, you
/// should implement [`StaticFilter`] in addition to [`Filter`], as
/// [`StaticFilter`] guarantees all of the required properties through the type
/// system, allowing the registry to take care of the virtual table boilerplate
/// automatically at compile-time.
/// ```
/// use meshgate::filters::prelude::*;
///
/// struct Greet;
///
/// #[async_trait::async_trait]
/// impl Filter for Greet {
///     async fn on_new_connection(&self, ctx: &mut ConnectionContext) -> Result<(), FilterError> {
///         tracing::info!(peer = %ctx.peer_addr, "hello");
///         Ok(())
///     }
/// }
///
/// impl StaticFilter for Greet {
///     const NAME: &'static str = "greet.v1";
///     type Configuration = ();
///
///     fn try_from_config(_: Option<Self::Configuration>) -> Result<Self, CreationError> {
///         Ok(Self)
///     }
/// }
/// ```
pub trait StaticFilter: Filter + Sized {
    /// The globally unique name of the filter.
    const NAME: &'static str;
    /// The human-readable configuration of the filter. **Must** be [`serde`]
    /// compatible and have a JSON schema.
    type Configuration: schemars::JsonSchema
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>;

    /// Instantiates a new [`StaticFilter`] from the given configuration, if any.
    /// # Errors
    /// If the provided configuration is invalid.
    fn try_from_config(config: Option<Self::Configuration>) -> Result<Self, CreationError>;

    /// Instantiates a new [`StaticFilter`] from the given configuration, if any.
    /// # Panics
    /// If the provided configuration is invalid.
    fn from_config(config: Option<Self::Configuration>) -> Self {
        Self::try_from_config(config).unwrap()
    }

    /// Creates a new dynamic [`FilterFactory`] virtual table.
    fn factory() -> DynFilterFactory
    where
        Self: 'static,
    {
        Box::from(std::marker::PhantomData::<fn() -> Self>)
    }

    /// Convenience method for providing a consistent error message for filters
    /// which require a fully initialized [`Self::Configuration`].
    fn ensure_config_exists(
        config: Option<Self::Configuration>,
    ) -> Result<Self::Configuration, CreationError> {
        config.ok_or(CreationError::MissingConfig(Self::NAME))
    }

    fn as_filter_config(
        config: impl Into<Option<Self::Configuration>>,
    ) -> Result<crate::config::Filter, CreationError> {
        Ok(crate::config::Filter {
            name: Self::NAME.into(),
            label: None,
            config: config
                .into()
                .map(|config| serde_json::to_value(&config))
                .transpose()?,
        })
    }
}

/// Trait for acting on accepted connections.
///
/// Filters run in chain order on every new connection. A filter may hold the
/// connection back (for example to delay it), terminate it by returning an
/// error, or take the downstream stream and serve it, which ends the chain.
///
/// **Metrics**
///
/// * `filter_connection_duration_seconds` The duration it took for a
///   `filter`'s `on_new_connection` implementation to execute.
///   * Labels
///     * `filter` The name of the filter being executed.
#[async_trait::async_trait]
pub trait Filter: Send + Sync {
    /// [`Filter::on_new_connection`] is invoked once for every connection
    /// accepted by a listener. By default the connection passes through
    /// unchanged.
    async fn on_new_connection(&self, _: &mut ConnectionContext) -> Result<(), FilterError> {
        Ok(())
    }
}
