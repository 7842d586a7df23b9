use tracing::trace;

// Counters are emitted as trace events; the Prometheus recorder only
// serves what is registered through it.

pub fn inc_requests(route: &'static str) {
    trace!(target = "relist.metrics", route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "relist.metrics",
        stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn model_call(call: &'static str, ok: bool) {
    trace!(target = "relist.metrics", call, ok, "model_calls_total_inc");
}

pub fn batch_processed(processed: u32, failed: usize) {
    trace!(
        target = "relist.metrics",
        processed,
        failed = failed as u64,
        "autopilot_products_total_inc"
    );
}
