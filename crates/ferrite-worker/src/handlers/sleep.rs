use serde_json::json;

use crate::handlers::{HandlerError, HeartbeatFn};
use crate::task_context::TaskContext;

/// Sleep in one-second slices, heartbeating between slices so cancel and
/// lease loss are noticed promptly.
pub(crate) async fn handle(
    ctx: &mut TaskContext,
    heartbeat: &dyn HeartbeatFn,
) -> Result<(), HandlerError> {
    let seconds = match ctx.input.get("seconds") {
        Some(value) if value.is_i64() || value.is_u64() || value.is_f64() => {
            let seconds = value.as_f64().unwrap_or(-1.0);
            if seconds < 0.0 {
                return Err(HandlerError::Invalid(
                    "input 'seconds' must be >= 0".to_string(),
                ));
            }
            seconds as u64
        }
        _ => {
            return Err(HandlerError::Invalid(
                "input 'seconds' must be a non-negative number".to_string(),
            ));
        }
    };

    let mut step = ctx.step("sleep");
    step.meta
        .insert("seconds_requested".to_string(), json!(seconds));
    let mut slept = 0u64;
    while slept < seconds {
        if let Err(signal) = heartbeat.beat().await {
            step.meta.insert("slept".to_string(), json!(slept));
            match &signal {
                HandlerError::Canceled => {
                    let err = ferrite_types::TaskError::new(
                        "Canceled",
                        "Task was canceled",
                        "sleep",
                    );
                    ctx.fail_step(step, &err);
                }
                _ => {
                    let err = ferrite_types::TaskError::new(
                        "RuntimeError",
                        "Heartbeat failed, task was taken over by another worker",
                        "sleep",
                    );
                    ctx.fail_step(step, &err);
                }
            }
            return Err(signal);
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        slept += 1;
    }
    step.meta.insert("slept".to_string(), json!(slept));
    ctx.complete_step(step);

    ctx.result.insert("slept".to_string(), json!(slept));
    ctx.artifacts
        .insert("duration_seconds".to_string(), json!(slept));
    Ok(())
}
