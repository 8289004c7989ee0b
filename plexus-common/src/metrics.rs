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

pub mod api {
    use std::time::Instant;

    use lazy_static::lazy_static;
    use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};
    use ::tracing::{error, warn, Span};

    lazy_static! {
        static ref GRPC_API_SUCCESS_TOTAL: CounterVec = register_counter_vec!(
            "grpc_api_success_total",
            "Number of successful gRPC API calls",
            &["api"]
        )
        .unwrap();
        static ref GRPC_API_FAILURE_TOTAL: CounterVec = register_counter_vec!(
            "grpc_api_failure_total",
            "Number of failed gRPC API calls",
            &["api", "error_kind"]
        )
        .unwrap();
        static ref GRPC_API_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
            "grpc_api_duration_seconds",
            "Duration of gRPC API calls",
            &["api"]
        )
        .unwrap();
    }

    /// Classifies an API error for metrics and log levels. Expected errors
    /// (bad client input, not-found) log at warn, the rest at error.
    pub trait TraceErrorKind {
        fn trace_error_kind(&self) -> &'static str;
        fn is_expected(&self) -> bool;
    }

    pub struct RecordedGrpcRequest {
        pub span: Span,
        api: &'static str,
        start: Instant,
    }

    impl RecordedGrpcRequest {
        pub fn new(api: &'static str, span: Span) -> Self {
            Self {
                span,
                api,
                start: Instant::now(),
            }
        }

        pub fn succeed<T>(self, result: T) -> T {
            GRPC_API_SUCCESS_TOTAL.with_label_values(&[self.api]).inc();
            GRPC_API_DURATION_SECONDS
                .with_label_values(&[self.api])
                .observe(self.start.elapsed().as_secs_f64());
            result
        }

        pub fn fail<T>(self, result: T, error_kind: &dyn TraceErrorKind) -> T {
            let kind = error_kind.trace_error_kind();
            GRPC_API_FAILURE_TOTAL
                .with_label_values(&[self.api, kind])
                .inc();
            GRPC_API_DURATION_SECONDS
                .with_label_values(&[self.api])
                .observe(self.start.elapsed().as_secs_f64());
            let _entered = self.span.enter();
            if error_kind.is_expected() {
                warn!(error_kind = kind, "gRPC API call failed");
            } else {
                error!(error_kind = kind, "gRPC API call failed");
            }
            result
        }
    }
}

/// Opens a per-request span carrying the api name and any extra fields, and
/// returns the recording handle whose `succeed`/`fail` feed the api metrics.
#[macro_export]
macro_rules! recorded_grpc_api_request {
    ($api:expr $(, $($field:tt)*)?) => {
        $crate::metrics::api::RecordedGrpcRequest::new(
            $api,
            tracing::info_span!("grpc_api_request", api = $api $(, $($field)*)?),
        )
    };
}
