//! Timer module.
//!
//! Timers run as independent tokio tasks; a fired timer tells the client
//! to start the alarm sound, then seeds a brand-new run so the model can
//! announce the completion. The new run goes through the session's normal
//! lock-guarded entry point, so it waits for any in-flight run to finish.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use murmur_core::error::ModuleError;
use murmur_core::message::Message;
use murmur_core::module::{
    Capability, CapabilityModule, ModuleContext, ToolReply, arg_f64, arg_str, arg_str_opt,
};
use serde_json::{Value, json};
use tracing::debug;

static CAPS: &[Capability] = &[
    Capability::new(
        "create_timer",
        &["duration", "unit", "label"],
        "Creates a timer for the specified duration and unit (seconds, minutes, hours) with an optional label.",
    ),
    Capability::new(
        "stop_timer_sound",
        &[],
        "Stops the timer sound if it is currently playing.",
    ),
];

const MAX_TIMER_SECONDS: u64 = 86_400;

pub struct ClockModule {
    ctx: ModuleContext,
    timers: Arc<tokio::sync::Mutex<Vec<ActiveTimer>>>,
    next_id: AtomicU64,
}

#[derive(Debug, Clone)]
struct ActiveTimer {
    id: u64,
    label: Option<String>,
    total_seconds: u64,
}

impl ClockModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self {
            ctx,
            timers: Arc::new(tokio::sync::Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn active_timers(&self) -> usize {
        self.timers.lock().await.len()
    }

    async fn create_timer(&self, args: &Value) -> Result<Value, ModuleError> {
        let duration = arg_f64(args, "duration")?;
        let unit = arg_str(args, "unit")?.to_lowercase();
        let label = arg_str_opt(args, "label");

        let multiplier = match unit.as_str() {
            "seconds" => 1.0,
            "minutes" => 60.0,
            "hours" => 3_600.0,
            _ => {
                return Ok(
                    json!({"error": "Invalid time unit. Use 'seconds', 'minutes', or 'hours'."}),
                );
            }
        };
        let total_seconds = (duration * multiplier).round();
        if total_seconds >= MAX_TIMER_SECONDS as f64 {
            return Ok(json!({"error": "Timer duration must be less than 24 hours."}));
        }
        if total_seconds <= 0.0 {
            return Ok(json!({"error": "Timer duration must be greater than 0."}));
        }
        let total_seconds = total_seconds as u64;

        let timer = ActiveTimer {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            label,
            total_seconds,
        };
        debug!(id = timer.id, total_seconds, "Starting timer");
        self.timers.lock().await.push(timer.clone());

        let ctx = self.ctx.clone();
        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timer.total_seconds)).await;
            timers.lock().await.retain(|t| t.id != timer.id);
            fire_timer(&ctx, &timer).await;
        });

        Ok(json!({
            "message": format!(
                "Timer set for {} {unit} ({total_seconds} seconds).",
                format_number(duration)
            ),
        }))
    }
}

/// Announce a completed timer: start the alarm on the client, then seed a
/// new run so the model speaks and ends it.
async fn fire_timer(ctx: &ModuleContext, timer: &ActiveTimer) {
    let pretty = pretty_duration(timer.total_seconds);

    let mut payload = json!({
        "status": "timer_complete",
        "duration": pretty,
        "info": "The timer sound is now playing. You can stop it with the 'stop_timer_sound' command.",
    });
    let spoken = match &timer.label {
        Some(label) => {
            payload["label"] = json!(label);
            format!("Timer {label} has completed.")
        }
        None => format!("The {pretty} timer has completed."),
    };

    let seeds = vec![
        Message::tool_response(payload.to_string()),
        Message::assistant(spoken),
        Message::end(),
    ];

    ctx.send_tool_message("clock", json!({"message": "START_TIMER_SOUND"}))
        .await;
    ctx.runs.request_run(seeds).await;
}

/// "2 hours, 30 minutes, 10 seconds" — zero components are skipped.
fn pretty_duration(total_seconds: u64) -> String {
    let hours = total_seconds / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours} hours, "));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes} minutes, "));
    }
    if seconds > 0 {
        out.push_str(&format!("{seconds} seconds, "));
    }
    out.trim_end_matches(", ").to_string()
}

/// Render a duration argument without a trailing ".0" for whole numbers.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[async_trait]
impl CapabilityModule for ClockModule {
    fn name(&self) -> &'static str {
        "clock"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPS
    }

    async fn invoke(&self, function: &str, args: Value) -> Result<ToolReply, ModuleError> {
        match function {
            "create_timer" => Ok(ToolReply::value(self.create_timer(&args).await?)),
            "stop_timer_sound" => {
                self.ctx
                    .send_tool_message("clock", json!({"message": "STOP_TIMER_SOUND"}))
                    .await;
                Ok(ToolReply::value(Value::Null))
            }
            other => Err(ModuleError::FunctionNotFound {
                module: "clock".into(),
                function: other.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CapturingRuns, RecordingTransport};
    use murmur_core::message::MessageKind;
    use murmur_core::transport::OutboundEvent;

    fn module() -> (
        ClockModule,
        Arc<RecordingTransport>,
        Arc<CapturingRuns>,
        tempfile::TempDir,
    ) {
        let transport = Arc::new(RecordingTransport::default());
        let runs = Arc::new(CapturingRuns::default());
        let (ctx, dir) = crate::testing::context_with(transport.clone(), runs.clone());
        (ClockModule::new(ctx), transport, runs, dir)
    }

    #[tokio::test]
    async fn rejects_invalid_unit_and_bounds() {
        let (module, _t, _r, _dir) = module();

        let reply = module
            .invoke("create_timer", json!({"duration": 5, "unit": "fortnights"}))
            .await
            .unwrap();
        assert!(reply.render().contains("Invalid time unit"));

        let reply = module
            .invoke("create_timer", json!({"duration": 25, "unit": "hours"}))
            .await
            .unwrap();
        assert!(reply.render().contains("less than 24 hours"));

        let reply = module
            .invoke("create_timer", json!({"duration": 0, "unit": "seconds"}))
            .await
            .unwrap();
        assert!(reply.render().contains("greater than 0"));

        assert_eq!(module.active_timers().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fired_timer_seeds_a_new_run() {
        let (module, transport, runs, _dir) = module();

        let reply = module
            .invoke(
                "create_timer",
                json!({"duration": 2, "unit": "seconds", "label": "tea"}),
            )
            .await
            .unwrap();
        assert_eq!(
            reply.value["message"],
            json!("Timer set for 2 seconds (2 seconds).")
        );
        assert_eq!(module.active_timers().await, 1);

        // Let the timer elapse.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(module.active_timers().await, 0);

        let all_runs = runs.runs();
        assert_eq!(all_runs.len(), 1);
        let seeds = &all_runs[0];
        assert_eq!(seeds.len(), 3);
        assert_eq!(seeds[0].kind, MessageKind::ToolResponse);
        assert!(seeds[0].content.contains("timer_complete"));
        assert!(seeds[0].content.contains("tea"));
        assert_eq!(seeds[1].kind, MessageKind::Assistant);
        assert_eq!(seeds[1].content, "Timer tea has completed.");
        assert_eq!(seeds[2].kind, MessageKind::End);

        // The alarm started before the run was requested.
        assert_eq!(
            transport.events(),
            vec![OutboundEvent::ToolMessage {
                tool: "clock".into(),
                data: json!({"message": "START_TIMER_SOUND"}),
            }]
        );
    }

    #[tokio::test]
    async fn unlabeled_timer_speaks_its_duration() {
        let timer = ActiveTimer {
            id: 1,
            label: None,
            total_seconds: 90,
        };
        let transport = Arc::new(RecordingTransport::default());
        let runs = Arc::new(CapturingRuns::default());
        let (ctx, _dir) = crate::testing::context_with(transport, runs.clone());

        fire_timer(&ctx, &timer).await;
        let seeds = runs.runs().remove(0);
        assert_eq!(
            seeds[1].content,
            "The 1 minutes, 30 seconds timer has completed."
        );
    }

    #[tokio::test]
    async fn stop_timer_sound_signals_the_client() {
        let (module, transport, _r, _dir) = module();
        let reply = module.invoke("stop_timer_sound", json!({})).await.unwrap();
        assert_eq!(reply.render(), "");
        assert_eq!(
            transport.events(),
            vec![OutboundEvent::ToolMessage {
                tool: "clock".into(),
                data: json!({"message": "STOP_TIMER_SOUND"}),
            }]
        );
    }

    #[test]
    fn pretty_duration_skips_zero_components() {
        assert_eq!(pretty_duration(3_661), "1 hours, 1 minutes, 1 seconds");
        assert_eq!(pretty_duration(7_200), "2 hours");
        assert_eq!(pretty_duration(45), "45 seconds");
    }
}
