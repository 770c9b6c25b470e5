//! Time arithmetic module.
//!
//! Times are exchanged with the model as opaque `time:<ms-since-epoch>`
//! ids, so the model never does date math itself: it asks for ids,
//! subtracts them here, and renders them back through this module.

use async_trait::async_trait;
use chrono::{Local, TimeZone, Utc};
use murmur_core::error::ModuleError;
use murmur_core::module::{Capability, CapabilityModule, ModuleContext, ToolReply, arg_str};
use serde_json::{Value, json};

static CAPS: &[Capability] = &[
    Capability::new("get_current_time", &[], "Gets the current time as a unique time ID."),
    Capability::new(
        "get_specific_time",
        &["year", "month", "day", "hour", "minute", "second"],
        "Gets the time for a specific date and time and returns it as a unique time ID. Hour, minute, and second default to 0.",
    ),
    Capability::new(
        "get_duration_between",
        &["time_id_1", "time_id_2"],
        "Calculates the duration between two time IDs and returns it in a human-readable format.",
    ),
    Capability::new(
        "get_human_readable_time",
        &["time_id"],
        "Converts a time ID (e.g. 'time:1678886400000') to a human-readable format.",
    ),
];

pub struct TimeModule;

impl TimeModule {
    pub fn new(_ctx: ModuleContext) -> Self {
        Self
    }
}

#[async_trait]
impl CapabilityModule for TimeModule {
    fn name(&self) -> &'static str {
        "time"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPS
    }

    async fn invoke(&self, function: &str, args: Value) -> Result<ToolReply, ModuleError> {
        let value = match function {
            "get_current_time" => json!(time_id(Utc::now().timestamp_millis())),
            "get_specific_time" => get_specific_time(&args),
            "get_duration_between" => {
                let a = arg_str(&args, "time_id_1")?;
                let b = arg_str(&args, "time_id_2")?;
                duration_between(&a, &b)
            }
            "get_human_readable_time" => {
                let id = arg_str(&args, "time_id")?;
                human_readable(&id)
            }
            other => {
                return Err(ModuleError::FunctionNotFound {
                    module: "time".into(),
                    function: other.into(),
                });
            }
        };
        Ok(ToolReply::value(value))
    }
}

fn time_id(ms: i64) -> String {
    format!("time:{ms}")
}

/// Parse a `time:<ms_since_epoch>` id.
fn parse_time_id(id: &str) -> Result<i64, String> {
    let err = || format!("Could not parse time_id '{id}': must be 'time:<ms_since_epoch>'.");
    let (prefix, ms) = id.split_once(':').ok_or_else(err)?;
    if prefix != "time" {
        return Err(err());
    }
    ms.parse::<i64>().map_err(|_| err())
}

fn get_specific_time(args: &Value) -> Value {
    let field = |name: &str| args.get(name).and_then(Value::as_i64);
    let (Some(year), Some(month), Some(day)) = (field("year"), field("month"), field("day"))
    else {
        return json!({"error": "Invalid date or time provided: year, month, and day are required."});
    };
    let hour = field("hour").unwrap_or(0);
    let minute = field("minute").unwrap_or(0);
    let second = field("second").unwrap_or(0);

    let parts: Option<(i32, u32, u32, u32, u32, u32)> = (|| {
        Some((
            i32::try_from(year).ok()?,
            u32::try_from(month).ok()?,
            u32::try_from(day).ok()?,
            u32::try_from(hour).ok()?,
            u32::try_from(minute).ok()?,
            u32::try_from(second).ok()?,
        ))
    })();

    let date = parts.and_then(|(y, mo, d, h, mi, s)| {
        Local.with_ymd_and_hms(y, mo, d, h, mi, s).single()
    });
    match date {
        Some(dt) => json!(time_id(dt.timestamp_millis())),
        None => json!({"error": "Invalid date or time provided."}),
    }
}

fn duration_between(id1: &str, id2: &str) -> Value {
    let (ms1, ms2) = match (parse_time_id(id1), parse_time_id(id2)) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => return json!({"error": e}),
    };
    json!({"duration": format_duration((ms1 - ms2).abs() / 1000)})
}

/// Human-readable duration, e.g. "1 day, 2 hours, 5 seconds".
fn format_duration(total_seconds: i64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;

    let mut parts = Vec::new();
    let plural = |n: i64, unit: &str| {
        format!("{n} {unit}{}", if n == 1 { "" } else { "s" })
    };
    if days > 0 {
        parts.push(plural(days, "day"));
    }
    if hours > 0 {
        parts.push(plural(hours, "hour"));
    }
    if minutes > 0 {
        parts.push(plural(minutes, "minute"));
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(plural(seconds, "second"));
    }
    parts.join(", ")
}

fn human_readable(id: &str) -> Value {
    match parse_time_id(id) {
        Ok(ms) => match Local.timestamp_millis_opt(ms).single() {
            Some(dt) => json!(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            None => json!({"error": format!("Time ID '{id}' is out of range.")}),
        },
        Err(e) => json!({"error": e}),
    }
}
