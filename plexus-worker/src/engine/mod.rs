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

pub mod native;
pub mod process;

use async_trait::async_trait;
use bytes::Bytes;
use plexus_common::model::Language;

/// A function argument or result as the engine sees it. Structured values
/// come from JSON-encoded objects; opaque bytes belong to interpreter
/// languages and are never inspected on this side of the engine boundary.
#[derive(Debug, Clone)]
pub enum FunctionValue {
    Json(serde_json::Value),
    Opaque(Bytes),
}

/// The function body as pushed by the router's FUNCTION message.
#[derive(Debug, Clone)]
pub struct FunctionPayload {
    pub name: String,
    pub language: Language,
    pub body: Bytes,
    pub requirements: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Interprets function bodies for one language. A component registers
/// exactly one function for its whole life and then serves invocations for
/// it; reflection over the body stays behind this trait and never crosses
/// the wire.
#[async_trait]
pub trait FunctionEngine: Send + Sync {
    async fn register(&self, function: &FunctionPayload) -> Result<(), EngineError>;

    async fn invoke(
        &self,
        args: Vec<(String, FunctionValue)>,
    ) -> Result<FunctionValue, EngineError>;
}
