//! A JSON event formatter that stitches in the active OpenTelemetry trace id,
//! so log lines can be correlated with the traces exported via OTLP.

use opentelemetry::trace::TraceContextExt;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_opentelemetry::OtelData;
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    registry::{LookupSpan, SpanRef},
};

/// Formats events as JSON, same shape as `tracing_subscriber::fmt::format::Json`, but adds a
/// `trace_id` field taken from the current span's OpenTelemetry context when one is present.
pub struct JsonWithTraceId;

impl<S, N> FormatEvent<S, N> for JsonWithTraceId
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        let mut fields = Map::new();

        fields.insert("level".into(), Value::from(meta.level().as_str()));
        fields.insert("target".into(), Value::from(meta.target()));
        fields.insert("timestamp".into(), Value::from(unix_timestamp()));

        if let Some(trace_id) = trace_id_for_current_span(ctx) {
            fields.insert("trace_id".into(), Value::from(trace_id));
        }

        let mut visitor = JsonVisitor(&mut fields);
        event.record(&mut visitor);

        let line = serde_json::to_string(&Value::Object(fields)).map_err(|_| std::fmt::Error)?;
        writeln!(writer, "{line}")
    }
}

struct JsonVisitor<'a>(&'a mut Map<String, Value>);

impl<'a> Visit for JsonVisitor<'a> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_owned(), Value::from(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_owned(), Value::from(value));
    }
}

fn trace_id_for_current_span<S, N>(ctx: &FmtContext<'_, S, N>) -> Option<String>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    let span = ctx.lookup_current()?;
    otel_trace_id(&span)
}

fn otel_trace_id<S>(span: &SpanRef<'_, S>) -> Option<String>
where
    S: for<'a> LookupSpan<'a>,
{
    let extensions = span.extensions();
    let otel_data = extensions.get::<OtelData>()?;
    let trace_id = otel_data.parent_cx.span().span_context().trace_id();
    Some(trace_id.to_string())
}

/// Seconds-with-nanos timestamp; avoids pulling in a dedicated time crate for one formatter.
fn unix_timestamp() -> f64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs_f64()
}
