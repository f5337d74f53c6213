use std::sync::OnceLock;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, IntGauge, Registry, TextEncoder};
use tracing::error;

use crate::generation::{DeltaKind, TerminalReason};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static GENERATIONS: OnceLock<IntCounterVec> = OnceLock::new();
static DELTAS: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_GENERATIONS: OnceLock<IntGauge> = OnceLock::new();

pub fn init_metrics() -> anyhow::Result<()> {
    if GENERATIONS.get().is_some() {
        return Ok(());
    }

    let generations = IntCounterVec::new(
        prometheus::opts!("generations_total", "Generations by terminal reason"),
        &["reason"],
    )?;
    let deltas = IntCounterVec::new(
        prometheus::opts!("deltas_total", "Published deltas by kind"),
        &["kind"],
    )?;
    let active = IntGauge::new("active_generations", "Generations currently streaming")?;

    REGISTRY.register(Box::new(generations.clone())).ok();
    REGISTRY.register(Box::new(deltas.clone())).ok();
    REGISTRY.register(Box::new(active.clone())).ok();

    let _ = GENERATIONS.set(generations);
    let _ = DELTAS.set(deltas);
    let _ = ACTIVE_GENERATIONS.set(active);
    Ok(())
}

pub fn record_started() {
    if let Some(gauge) = ACTIVE_GENERATIONS.get() {
        gauge.inc();
    }
}

pub fn record_terminal(reason: TerminalReason) {
    if let Some(counter) = GENERATIONS.get() {
        counter.with_label_values(&[reason.as_str()]).inc();
    }
    if let Some(gauge) = ACTIVE_GENERATIONS.get() {
        gauge.dec();
    }
}

pub fn record_delta(kind: DeltaKind) {
    if let Some(counter) = DELTAS.get() {
        counter.with_label_values(&[kind.as_str()]).inc();
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, [("content-type", "text/plain")], Vec::new());
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}
