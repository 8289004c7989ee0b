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

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::engine::{EngineError, FunctionEngine, FunctionPayload, FunctionValue};

pub type NativeFunction =
    Arc<dyn Fn(BTreeMap<String, Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// In-process engine over named Rust closures operating on JSON values.
/// Used by embedders and tests; the FUNCTION message selects the closure by
/// function name, the pickled body is ignored.
#[derive(Default)]
pub struct NativeEngine {
    functions: HashMap<String, NativeFunction>,
    active: Mutex<Option<NativeFunction>>,
}

impl NativeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(BTreeMap<String, Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        let function = Arc::new(function);
        self.functions.insert(
            name.to_string(),
            Arc::new(move |args| {
                let function = function.clone();
                async move { function(args) }.boxed()
            }),
        );
        self
    }

    pub fn with_async_function<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(BTreeMap<String, Value>) -> BoxFuture<'static, Result<Value, String>>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
        self
    }
}

#[async_trait]
impl FunctionEngine for NativeEngine {
    async fn register(&self, function: &FunctionPayload) -> Result<(), EngineError> {
        match self.functions.get(&function.name) {
            Some(native) => {
                *self.active.lock().unwrap() = Some(native.clone());
                Ok(())
            }
            None => Err(EngineError::Registration(format!(
                "no native function named {}",
                function.name
            ))),
        }
    }

    async fn invoke(
        &self,
        args: Vec<(String, FunctionValue)>,
    ) -> Result<FunctionValue, EngineError> {
        let function = self
            .active
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EngineError::Execution("no function registered".to_string()))?;

        let mut keyword_args = BTreeMap::new();
        for (param, value) in args {
            match value {
                FunctionValue::Json(json) => {
                    keyword_args.insert(param, json);
                }
                FunctionValue::Opaque(_) => {
                    return Err(EngineError::Unsupported(format!(
                        "native functions take structured arguments, {param} is opaque"
                    )))
                }
            }
        }

        function(keyword_args)
            .await
            .map(FunctionValue::Json)
            .map_err(EngineError::Execution)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use plexus_common::model::Language;
    use test_r::test;

    use super::*;

    fn payload(name: &str) -> FunctionPayload {
        FunctionPayload {
            name: name.to_string(),
            language: Language::Json,
            body: Bytes::new(),
            requirements: vec![],
        }
    }

    #[test]
    async fn registered_function_is_invoked_with_keyword_args() {
        let engine = NativeEngine::new().with_function("concat", |args| {
            let a = args["a"].as_str().unwrap_or_default().to_string();
            let b = args["b"].as_str().unwrap_or_default();
            Ok(Value::String(a + b))
        });

        engine.register(&payload("concat")).await.unwrap();
        let result = engine
            .invoke(vec![
                ("a".to_string(), FunctionValue::Json(Value::String("he".into()))),
                ("b".to_string(), FunctionValue::Json(Value::String("llo".into()))),
            ])
            .await
            .unwrap();
        match result {
            FunctionValue::Json(Value::String(s)) => assert_eq!(s, "hello"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    async fn unknown_function_fails_registration() {
        let engine = NativeEngine::new();
        let err = engine.register(&payload("missing")).await.unwrap_err();
        assert!(matches!(err, EngineError::Registration(_)));
    }
}
