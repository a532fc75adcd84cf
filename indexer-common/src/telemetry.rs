// This file is part of flowindex.
// Copyright (C) 2025 Flowindex Contributors
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use fastrace_opentelemetry::OpenTelemetryReporter;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::InstrumentationScope;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use serde::Deserialize;
use std::{borrow::Cow, net::IpAddr};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "tracing")]
    pub tracing_config: Option<TracingConfig>,

    #[serde(rename = "metrics")]
    pub metrics_config: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TracingConfig {
    pub otlp_exporter_endpoint: String,
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub address: IpAddr,
    pub port: u16,
}

/// Initialize logging via logforth; must be called before any log statement, hence also
/// before loading the configuration.
pub fn init_logging() {
    logforth::starter_log::builder()
        .dispatch(|dispatch| {
            dispatch
                .filter(logforth::record::LevelFilter::MoreSevereEqual(
                    logforth::record::Level::Info,
                ))
                .append(logforth::append::Stderr::default())
        })
        .apply();
}

/// Initialize tracing: set up the fastrace OTLP reporter if an endpoint is configured,
/// otherwise spans stay local and unreported.
pub fn init_tracing(config: Option<TracingConfig>) {
    let Some(TracingConfig {
        otlp_exporter_endpoint,
        service_name,
    }) = config
    else {
        return;
    };

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(otlp_exporter_endpoint.clone())
        .build()
        .expect("OTLP span exporter can be built");

    let reporter = OpenTelemetryReporter::new(
        exporter,
        Cow::Owned(
            Resource::builder()
                .with_service_name(service_name.clone())
                .build(),
        ),
        InstrumentationScope::builder("flowindex").build(),
    );
    fastrace::set_reporter(reporter, fastrace::collector::Config::default());

    info!(
        otlp_exporter_endpoint,
        service_name;
        "tracing initialized"
    );
}

/// Initialize the Prometheus metrics exporter if configured.
pub fn init_metrics(config: Option<MetricsConfig>) {
    let Some(MetricsConfig { address, port }) = config else {
        return;
    };

    PrometheusBuilder::new()
        .with_http_listener((address, port))
        .install()
        .expect("Prometheus exporter can be installed");

    info!(address:%, port; "metrics exporter listening");
}
