use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Initialize structured JSON logging for hosts embedding the engine.
/// `RUST_LOG` takes precedence over `default_level` when set.
pub fn init_telemetry(default_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(filter)
        .try_init()?;

    tracing::info!("Transition coordinator telemetry initialized with structured logging");
    Ok(())
}

/// Generate a correlation ID for linking the records of one coordinated call
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Create a span with the common attributes of a coordinated transition
pub fn create_transition_span(
    operation: &str,
    entity_kind: &str,
    entity_id: &str,
    target: &str,
    correlation_id: &str,
) -> tracing::Span {
    tracing::info_span!(
        "state_transition",
        operation = operation,
        entity.kind = entity_kind,
        entity.id = entity_id,
        target = target,
        correlation.id = correlation_id,
        otel.kind = "internal"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_are_unique() {
        assert_ne!(generate_correlation_id(), generate_correlation_id());
    }
}
