//! Home-automation module.
//!
//! Talks to a Home Assistant instance over its REST API. The discovery
//! flow is: `get_devices` to find devices in a room, `get_device_functions`
//! to learn what a device can do, then the device-type-specific function.
//! The control functions are hidden capabilities: dispatchable, documented
//! through `get_device_functions`, but absent from the module's top-level
//! docs.

use async_trait::async_trait;
use murmur_core::error::ModuleError;
use murmur_core::module::{
    Capability, CapabilityModule, ModuleContext, ToolReply, arg_i64_opt, arg_str, arg_str_list,
    arg_str_opt,
};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use tracing::debug;

static CAPS: &[Capability] = &[
    Capability::new(
        "get_devices",
        &["room"],
        "Searches for smart devices in the home. room is the room to search in (e.g., 'living room'). You may use 'all' to search all rooms and 'default' to search the default room. If the user does not specify a room, use the default room.",
    ),
    Capability::new(
        "get_device_functions",
        &["device_id"],
        "Returns the available functions to control a specific device.",
    ),
    Capability::hidden(
        "turn_on_lights",
        &["device_ids"],
        "Turns on a list of light devices.",
    ),
    Capability::hidden(
        "turn_off_lights",
        &["device_ids"],
        "Turns off a list of light devices.",
    ),
    Capability::hidden(
        "set_lights",
        &["device_ids", "brightness_pct", "color_name"],
        "Sets the brightness percentage (0-100) and/or the color name (e.g., 'red', 'blue') of a list of light devices. You can specify either brightness_pct or color_name or both.",
    ),
];

const NOT_CONFIGURED: &str =
    "Home Assistant URL or token is not set. Ask the user to set it by modifying the configuration file.";

pub struct HomeModule {
    ctx: ModuleContext,
    http: reqwest::Client,
    state: std::sync::Mutex<HomeState>,
}

#[derive(Default)]
struct HomeState {
    base_url: String,
    token: String,
    default_room: String,
}

impl HomeModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self {
            ctx,
            http: reqwest::Client::new(),
            state: std::sync::Mutex::new(HomeState::default()),
        }
    }

    fn config(&self) -> HomeState {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        HomeState {
            base_url: state.base_url.clone(),
            token: state.token.clone(),
            default_room: state.default_room.clone(),
        }
    }

    async fn request(
        &self,
        config: &HomeState,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response, ModuleError> {
        let url = format!("{}{}", config.base_url.trim_end_matches('/'), endpoint);
        let builder = match body {
            Some(body) => self.http.post(&url).json(&body),
            None => self.http.get(&url),
        };
        builder
            .header("Authorization", format!("Bearer {}", config.token))
            .send()
            .await
            .map_err(|e| execution_failed("request", e.to_string()))
    }

    /// Map device ids to area names via the template endpoint.
    async fn device_areas(
        &self,
        config: &HomeState,
        device_ids: &[String],
    ) -> Result<HashMap<String, Option<String>>, ModuleError> {
        let template = format!(
            "{{{{ {} }}}}",
            device_ids
                .iter()
                .map(|id| format!("area_name('{id}')"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let response = self
            .request(config, "/template", Some(json!({"template": template})))
            .await?;
        let text = response
            .text()
            .await
            .map_err(|e| execution_failed("get_devices", e.to_string()))?;
        Ok(parse_area_response(&text, device_ids))
    }

    async fn get_devices(&self, args: &Value) -> Result<Value, ModuleError> {
        let mut room = arg_str(args, "room")?;
        let config = self.config();
        if config.base_url.is_empty() || config.token.is_empty() {
            return Ok(json!(NOT_CONFIGURED));
        }
        if room == "default" {
            room = config.default_room.clone();
        }

        let response = self.request(&config, "/states", None).await?;
        let states: Vec<Value> = response
            .json()
            .await
            .map_err(|e| execution_failed("get_devices", e.to_string()))?;

        let mut devices: Map<String, Value> = states
            .iter()
            .filter_map(|d| {
                d["entity_id"]
                    .as_str()
                    .map(|id| (id.to_string(), d.clone()))
            })
            .collect();
        flatten_groups(&mut devices);

        let device_ids: Vec<String> = devices.keys().cloned().collect();
        let areas = self.device_areas(&config, &device_ids).await?;

        let matched = filter_by_room(&devices, &areas, &room);
        if matched.is_empty() {
            let mut valid_rooms: Vec<String> = areas.values().flatten().cloned().collect();
            valid_rooms.sort();
            valid_rooms.dedup();
            return Ok(json!({
                "error": format!("Room '{room}' does not exist"),
                "valid_rooms": valid_rooms,
            }));
        }

        let output: Vec<Value> = matched
            .iter()
            .map(|(id, device)| {
                json!({
                    "id": format!("home:device:{id}"),
                    "room": areas.get(id.as_str()).cloned().flatten(),
                    "name": device["attributes"]["friendly_name"].as_str().unwrap_or(id),
                    "type": id.split('.').next().unwrap_or_default(),
                    "state": device["state"],
                })
            })
            .collect();
        Ok(json!({"devices": output}))
    }

    fn get_device_functions(&self, args: &Value) -> Result<Value, ModuleError> {
        let device_id = arg_str(args, "device_id")?;
        let config = self.config();
        if config.base_url.is_empty() || config.token.is_empty() {
            return Ok(json!(NOT_CONFIGURED));
        }

        let Some(device_type) = device_type(&device_id) else {
            return Ok(json!({"error": format!("Invalid device id '{device_id}'.")}));
        };
        if device_type != "light" {
            return Ok(
                json!({"error": format!("Device type '{device_type}' is not supported yet.")}),
            );
        }

        let functions: Vec<Value> = ["turn_on_lights", "turn_off_lights", "set_lights"]
            .iter()
            .filter_map(|name| self.describe(name))
            .map(|desc| serde_json::to_value(desc).unwrap_or(Value::Null))
            .collect();
        Ok(json!({"functions": functions}))
    }

    /// Call a Home Assistant service on each device.
    async fn trigger_all(
        &self,
        device_ids: &[String],
        service: &str,
        extra: Map<String, Value>,
    ) -> Result<Value, ModuleError> {
        let config = self.config();
        if config.base_url.is_empty() || config.token.is_empty() {
            return Ok(json!(NOT_CONFIGURED));
        }

        for device_id in device_ids {
            let Some((device_type, entity)) =
                device_type(device_id).zip(device_entity(device_id))
            else {
                return Ok(json!({"error": format!("Invalid device id '{device_id}'.")}));
            };
            let mut body = extra.clone();
            body.insert("entity_id".into(), json!(entity));
            let endpoint = format!("/services/{device_type}/{service}");
            debug!(endpoint = %endpoint, entity = %entity, "Triggering device service");
            self.request(&config, &endpoint, Some(Value::Object(body)))
                .await?;
        }
        Ok(json!({"status": "success"}))
    }

    async fn set_lights(&self, args: &Value) -> Result<Value, ModuleError> {
        let device_ids = arg_str_list(args, "device_ids")?;
        let brightness = arg_i64_opt(args, "brightness_pct");
        let color = arg_str_opt(args, "color_name");
        if brightness.is_none() && color.is_none() {
            return Ok(
                json!({"error": "You must specify either brightness_pct or color_name or both."}),
            );
        }

        let mut extra = Map::new();
        if let Some(pct) = brightness {
            extra.insert("brightness_pct".into(), json!(pct));
        }
        if let Some(color) = color {
            extra.insert("color_name".into(), json!(color));
        }
        self.trigger_all(&device_ids, "turn_on", extra).await
    }
}

fn execution_failed(function: &str, reason: String) -> ModuleError {
    ModuleError::ExecutionFailed {
        module: "home".into(),
        function: function.into(),
        reason,
    }
}

/// `home:device:light.kitchen` → `light.kitchen`
fn device_entity(device_id: &str) -> Option<&str> {
    let entity = device_id.strip_prefix("home:device:")?;
    (!entity.is_empty()).then_some(entity)
}

/// `home:device:light.kitchen` → `light`
fn device_type(device_id: &str) -> Option<&str> {
    device_entity(device_id)?.split('.').next()
}

/// Remove devices that are members of a group device, keeping the group.
fn flatten_groups(devices: &mut Map<String, Value>) {
    let grouped: Vec<String> = devices
        .values()
        .filter_map(|d| d["attributes"]["entity_id"].as_array())
        .flatten()
        .filter_map(|id| id.as_str().map(str::to_string))
        .collect();
    for id in grouped {
        devices.remove(&id);
    }
}

/// Parse the template endpoint's rendered tuple of area names.
///
/// The response looks like `('Kitchen', 'Office', None)`; entries render
/// literal `None` (or the quirky `on`) when the device has no area.
fn parse_area_response(text: &str, device_ids: &[String]) -> HashMap<String, Option<String>> {
    let inner = text
        .trim()
        .trim_start_matches(['(', '['])
        .trim_end_matches([')', ']']);
    let names = inner.split(", ").map(|part| {
        let name = part.trim().trim_matches(['\'', '"']);
        if name.is_empty() || name == "None" || name == "on" {
            None
        } else {
            Some(name.to_string())
        }
    });
    device_ids.iter().cloned().zip(names).collect()
}

/// Keep devices with a known area, optionally restricted to one room.
fn filter_by_room(
    devices: &Map<String, Value>,
    areas: &HashMap<String, Option<String>>,
    room: &str,
) -> Vec<(String, Value)> {
    devices
        .iter()
        .filter_map(|(id, device)| {
            let area = areas.get(id.as_str())?.as_ref()?;
            if room != "all" && !area.eq_ignore_ascii_case(room) {
                return None;
            }
            Some((id.clone(), device.clone()))
        })
        .collect()
}

#[async_trait]
impl CapabilityModule for HomeModule {
    fn name(&self) -> &'static str {
        "home"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPS
    }

    async fn setup(&self) {
        let settings = self.ctx.settings.scoped(&self.ctx.user_id, self.name());
        let data = settings.load(
            "homeassistant",
            json!({"hass_url": "", "hass_token": "", "default_room": "living room"}),
        );
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.base_url = data["hass_url"].as_str().unwrap_or_default().to_string();
        state.token = data["hass_token"].as_str().unwrap_or_default().to_string();
        state.default_room = data["default_room"]
            .as_str()
            .filter(|s| !s.is_empty())
            .unwrap_or("living room")
            .to_string();
    }

    async fn invoke(&self, function: &str, args: Value) -> Result<ToolReply, ModuleError> {
        let value = match function {
            "get_devices" => self.get_devices(&args).await?,
            "get_device_functions" => self.get_device_functions(&args)?,
            "turn_on_lights" => {
                let ids = arg_str_list(&args, "device_ids")?;
                self.trigger_all(&ids, "turn_on", Map::new()).await?
            }
            "turn_off_lights" => {
                let ids = arg_str_list(&args, "device_ids")?;
                self.trigger_all(&ids, "turn_off", Map::new()).await?
            }
            "set_lights" => self.set_lights(&args).await?,
            other => {
                return Err(ModuleError::FunctionNotFound {
                    module: "home".into(),
                    function: other.into(),
                });
            }
        };
        Ok(ToolReply::value(value))
    }
}
