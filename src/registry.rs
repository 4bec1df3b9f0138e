//! Source registry (§4.9): tracks every producer of orders, validates its
//! required fields by kind, and keeps per-source success/rejection counters.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::info;

use crate::error::{AggregatorError, Result};
use crate::models::{Source, SourceId, SourceKind, SourceStatus};

/// Required top-level fields on the raw intake payload, by source kind
/// (§4.9). `EXTERNAL` requires nothing extra since it may be auto-registered.
fn required_fields(kind: SourceKind) -> &'static [&'static str] {
    match kind {
        SourceKind::Bot => &["strategyId"],
        SourceKind::Manual => &["operatorId"],
        SourceKind::Api => &["apiKeyId"],
        SourceKind::Strategy => &["strategyId", "version"],
        SourceKind::External => &[],
    }
}

#[derive(Clone)]
pub struct SourceRegistry {
    sources: Arc<RwLock<HashMap<SourceId, Source>>>,
    auto_register_unknown: bool,
}

impl SourceRegistry {
    pub fn new(auto_register_unknown: bool) -> Self {
        Self {
            sources: Arc::new(RwLock::new(HashMap::new())),
            auto_register_unknown,
        }
    }

    pub fn register(&self, id: SourceId, kind: SourceKind) {
        let mut sources = self.sources.write();
        sources.entry(id.clone()).or_insert_with(|| {
            info!(source = %id, ?kind, "source registered");
            Source::new(id, kind)
        });
    }

    /// Validates the raw payload's required fields for `kind`, auto
    /// registering unknown sources of kind `External` when configured
    /// (§4.9).
    pub fn validate_and_touch(&self, id: &str, kind: SourceKind, payload: &Value) -> Result<()> {
        if !self.sources.read().contains_key(id) {
            if kind == SourceKind::External && self.auto_register_unknown {
                self.register(id.to_string(), kind);
            } else {
                return Err(AggregatorError::UnknownSource {
                    source_id: id.to_string(),
                });
            }
        }

        for field in required_fields(kind) {
            if payload.get(field).is_none() {
                return Err(AggregatorError::MalformedOrder {
                    reason: format!("source {id} missing required field '{field}'"),
                });
            }
        }

        Ok(())
    }

    pub fn record_outcome(&self, id: &str, accepted: bool) {
        let mut sources = self.sources.write();
        if let Some(source) = sources.get_mut(id) {
            source.orders_total += 1;
            if accepted {
                source.orders_success += 1;
            } else {
                source.orders_rejected += 1;
            }
            source.last_activity = std::time::Instant::now();
        }
    }

    pub fn record_cancellation(&self, id: &str) {
        let mut sources = self.sources.write();
        if let Some(source) = sources.get_mut(id) {
            source.orders_cancelled += 1;
        }
    }

    pub fn set_status(&self, id: &str, status: SourceStatus) -> bool {
        let mut sources = self.sources.write();
        match sources.get_mut(id) {
            Some(source) => {
                source.status = status;
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.sources
            .read()
            .get(id)
            .map(|s| s.status == SourceStatus::Active)
            .unwrap_or(false)
    }

    pub fn statistics(&self) -> Vec<Source> {
        self.sources.read().values().cloned().collect()
    }
}
