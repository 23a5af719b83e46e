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

use std::{collections::HashMap, iter::FromIterator, sync::Arc};

use crate::filters::{self, DynFilterFactory, FilterFactory, StaticFilter};

#[cfg(doc)]
use crate::filters::FilterRegistry;

/// A map of [`FilterFactory::name`]s to factories.
pub type FilterMap = HashMap<&'static str, Arc<dyn FilterFactory>>;

/// A set of filters to be registered with a [`FilterRegistry`].
#[derive(Clone)]
pub struct FilterSet(FilterMap);

impl FilterSet {
    /// Returns the set of built-in filters.
    ///
    /// Current default filters:
    /// - [`fault_injection`][filters::fault_injection]
    /// - [`tcp_proxy`][filters::tcp_proxy]
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self::default_with(Option::into_iter(None))
    }

    /// Returns a `FilterSet` with the filters provided through `filters` in
    /// addition to the defaults. Any filter factories provided by `filters`
    /// will override any defaults with a matching name.
    pub fn default_with(filters: impl IntoIterator<Item = DynFilterFactory>) -> Self {
        Self::with(
            [
                filters::FaultInjection::factory(),
                filters::TcpProxy::factory(),
            ]
            .into_iter()
            .chain(filters),
        )
    }

    /// Creates a new [`FilterSet`] with the set of `filter_factories` without
    /// any defaults.
    pub fn with(filters: impl IntoIterator<Item = DynFilterFactory>) -> Self {
        Self::from_iter(filters)
    }

    pub fn insert(&mut self, factory: DynFilterFactory) -> Option<Arc<dyn FilterFactory>> {
        self.0.insert(factory.name(), Arc::from(factory))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn FilterFactory>> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn FilterFactory>> + '_ {
        self.0.values()
    }
}

impl FromIterator<DynFilterFactory> for FilterSet {
    fn from_iter<I: IntoIterator<Item = DynFilterFactory>>(iter: I) -> Self {
        let mut set = Self(<_>::default());

        for factory in iter {
            set.insert(factory);
        }

        set
    }
}

impl std::fmt::Debug for FilterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}
