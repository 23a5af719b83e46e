/*
 * Copyright 2024 Google LLC All Rights Reserved.
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{field} has invalid value{clarification}{examples}",
    clarification = clarification
                    .as_ref()
                    .map(|v| format!(": {}", v))
                    .unwrap_or_default(),
    examples = examples
                    .as_ref()
                    .map(|v| format!(": {}", v.join(", ")))
                    .unwrap_or_default(),

    )]
pub struct ValueInvalidArgs {
    pub field: String,
    pub clarification: Option<String>,
    pub examples: Option<Vec<String>>,
}

impl ValueInvalidArgs {
    pub fn new(field: impl Into<String>, clarification: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            clarification: Some(clarification.into()),
            examples: None,
        }
    }
}

/// Validation failure for a cluster, host, health check, or listener entry.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("field {0} cannot be empty")]
    EmptyName(&'static str),
    #[error("field {0} is not unique")]
    NotUnique(String),
    #[error("cluster `{0}` does not exist")]
    UnknownCluster(String),
    #[error(transparent)]
    ValueInvalid(#[from] ValueInvalidArgs),
    #[error(transparent)]
    FilterInvalid(#[from] crate::filters::CreationError),
}

impl ValidationError {
    pub(crate) fn invalid(field: impl Into<String>, clarification: impl Into<String>) -> Self {
        Self::ValueInvalid(ValueInvalidArgs::new(field, clarification))
    }
}

/// One entry of an update batch which was not applied.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rejected {
    /// The cluster name or host address identifying the entry.
    pub entry: String,
    pub error: ValidationError,
}

/// The outcome of applying a batch of control plane entries. Invalid entries
/// are skipped, the remainder of the batch is still applied.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UpdateReport {
    pub applied: usize,
    pub rejected: Vec<Rejected>,
}

impl UpdateReport {
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }

    pub(crate) fn reject(&mut self, entry: impl Into<String>, error: ValidationError) {
        let entry = entry.into();
        tracing::warn!(%entry, %error, "rejected configuration entry");
        self.rejected.push(Rejected { entry, error });
    }
}
