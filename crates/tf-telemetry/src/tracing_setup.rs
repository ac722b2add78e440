use uuid::Uuid;

/// Generate a trace ID (32 hex characters).
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Generate a span ID (16 hex characters).
pub fn generate_span_id() -> String {
    let mut id = Uuid::new_v4().as_simple().to_string();
    id.truncate(16);
    id
}

/// Root span for one orchestrator run. Returns the span and its trace ID.
pub fn run_span(project: &str) -> (tracing::Span, String) {
    let trace_id = generate_trace_id();
    let span = tracing::info_span!(
        "orchestrator_run",
        trace_id = %trace_id,
        span_id = %generate_span_id(),
        project = %project,
    );
    (span, trace_id)
}

/// Span for one scheduling wave under an existing trace.
pub fn wave_span(trace_id: &str, wave: u64) -> tracing::Span {
    tracing::info_span!(
        "wave",
        trace_id = %trace_id,
        span_id = %generate_span_id(),
        wave = wave,
    )
}

/// Span wrapping the supervision of one agent session.
pub fn session_span(task_id: &str, session_id: &str, attempt: u32) -> tracing::Span {
    tracing::info_span!(
        "agent_session",
        task_id = %task_id,
        session_id = %session_id,
        attempt = attempt,
    )
}
