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

use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;

use crate::filters::{
    CreateFilterArgs, CreationError, DynFilterFactory, FilterFactory, FilterInstance, FilterSet,
};

static REGISTRY: Lazy<ArcSwap<FilterSet>> =
    Lazy::new(|| ArcSwap::new(Arc::new(FilterSet::default())));

/// Registry of all [`Filter`][crate::filters::Filter]s that can be applied in
/// the system. It starts out with [`FilterSet::default`].
#[derive(Debug)]
pub struct FilterRegistry;

impl FilterRegistry {
    /// Loads the provided [`FilterSet`] into the registry of available filters.
    pub fn register(factories: impl IntoIterator<Item = DynFilterFactory>) {
        let mut registry = FilterSet::clone(&REGISTRY.load_full());
        for factory in factories {
            registry.insert(factory);
        }

        REGISTRY.store(Arc::from(registry));
    }

    /// Creates and returns a new dynamic instance of
    /// [`Filter`][crate::filters::Filter] for a given `key`. Errors if the
    /// filter cannot be found, or if there is a configuration issue.
    pub fn get(key: &str, args: CreateFilterArgs) -> Result<FilterInstance, CreationError> {
        match REGISTRY.load().get(key).map(|p| p.create_filter(args)) {
            None => Err(CreationError::NotFound(key.to_owned())),
            Some(filter) => filter,
        }
    }

    /// Returns the factory registered under `key`.
    pub fn get_factory(key: &str) -> Option<Arc<dyn FilterFactory>> {
        REGISTRY.load().get(key).cloned()
    }

    /// Returns every registered factory.
    pub fn factories() -> Vec<Arc<dyn FilterFactory>> {
        REGISTRY.load().iter().cloned().collect()
    }
}
