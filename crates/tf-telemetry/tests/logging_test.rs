use tf_telemetry::logging;

#[test]
fn init_logging_twice_is_a_no_op() {
    logging::init_logging("tf-test", "debug");
    logging::init_logging("tf-test", "info");
    tracing::info!(task_id = "T1", "human-readable log line");
}

#[test]
fn json_init_after_global_subscriber_is_silent() {
    logging::init(
        "tf-test-json",
        "info",
        logging::Format::Json,
    );
    tracing::info!(wave = 1u64, "json log line");
}
