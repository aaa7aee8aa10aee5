//! Device tools generated from the descriptors a client reports.
//!
//! A client announces its devices once (`IotDescriptor`) and then streams
//! property updates (`IotStateUpdate`). Each property becomes a
//! `get_{device}_{property}` query tool answering from the last reported
//! value; each method becomes a tool that sends an `iot` command frame back
//! down the connection.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{required_str, ParameterSchema, PropertySchema, ToolDescriptor, ToolOutcome, ToolType};
use crate::conversation::ConversationContext;

const RESPONSE_SUCCESS: &str = "response_success";
const RESPONSE_FAILURE: &str = "response_failure";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IotDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: BTreeMap<String, IotProperty>,
    #[serde(default)]
    pub methods: BTreeMap<String, IotMethod>,
}

/// A property or method parameter: description plus JSON type name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IotProperty {
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default = "string_kind")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IotMethod {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, IotProperty>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IotStateUpdate {
    pub name: String,
    #[serde(default)]
    pub state: Map<String, Value>,
}

fn string_kind() -> String {
    "string".into()
}

impl IotDescriptor {
    /// Devices that report only methods expose the method parameters as
    /// their queryable properties.
    pub fn normalize(&mut self) {
        if !self.properties.is_empty() {
            return;
        }
        for method in self.methods.values() {
            for (name, param) in &method.parameters {
                self.properties
                    .entry(name.clone())
                    .or_insert_with(|| param.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.methods.is_empty()
    }
}

/// JSON type name as used in device descriptors.
fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug)]
struct Device {
    descriptor: IotDescriptor,
    values: HashMap<String, Value>,
}

/// Per-connection device table with the last reported property values.
#[derive(Debug, Default)]
pub struct IotDevices {
    devices: HashMap<String, Device>,
}

impl IotDevices {
    pub fn register(&mut self, descriptor: IotDescriptor) {
        info!(device = %descriptor.name, "iot device registered");
        self.devices.insert(
            descriptor.name.clone(),
            Device {
                descriptor,
                values: HashMap::new(),
            },
        );
    }

    /// Apply one state report. Values for unknown properties or of the wrong
    /// JSON type are dropped. Returns how many values were accepted.
    pub fn apply(&mut self, update: &IotStateUpdate) -> usize {
        let Some(device) = self.devices.get_mut(&update.name) else {
            warn!(device = %update.name, "state update for unregistered device");
            return 0;
        };
        let mut accepted = 0;
        for (property, value) in &update.state {
            let Some(schema) = device.descriptor.properties.get(property) else {
                warn!(device = %update.name, %property, "state update for unknown property");
                continue;
            };
            let kind = json_kind(value);
            if !schema.kind.eq_ignore_ascii_case(kind) {
                warn!(
                    device = %update.name,
                    %property,
                    expected = %schema.kind,
                    got = kind,
                    "state update type mismatch"
                );
                continue;
            }
            debug!(device = %update.name, %property, %value, "iot state updated");
            device.values.insert(property.clone(), value.clone());
            accepted += 1;
        }
        accepted
    }

    pub fn value(&self, device: &str, property: &str) -> Option<Value> {
        self.devices.get(device)?.values.get(property).cloned()
    }

    pub fn has_method(&self, device: &str, method: &str) -> bool {
        self.devices
            .get(device)
            .is_some_and(|d| d.descriptor.methods.contains_key(method))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Register `descriptors` on the session's connection and add their tools
/// to the session registry. Returns the number of tools added.
pub fn register_devices(ctx: &mut ConversationContext, descriptors: Vec<IotDescriptor>) -> usize {
    let mut added = 0;
    for mut descriptor in descriptors {
        descriptor.normalize();
        if descriptor.is_empty() {
            debug!(device = %descriptor.name, "device without properties or methods skipped");
            continue;
        }
        for (property, schema) in &descriptor.properties {
            ctx.tools_mut()
                .register(property_tool(&descriptor.name, property, schema));
            added += 1;
        }
        for (method, spec) in &descriptor.methods {
            ctx.tools_mut().register(method_tool(&descriptor, method, spec));
            added += 1;
        }
        ctx.connection().register_device(descriptor);
    }
    info!(session_id = %ctx.session_id(), tools = added, "iot tools registered");
    added
}

fn response_params(schema: ParameterSchema, success_hint: &str, failure_hint: &str) -> ParameterSchema {
    schema
        .property(RESPONSE_SUCCESS, PropertySchema::string(success_hint), true)
        .property(RESPONSE_FAILURE, PropertySchema::string(failure_hint), true)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn property_tool(device: &str, property: &str, schema: &IotProperty) -> ToolDescriptor {
    let name = format!("get_{}_{}", device.to_lowercase(), property.to_lowercase());
    let parameters = response_params(
        ParameterSchema::new(),
        "Friendly reply when the query succeeds; must contain {value} where the value goes",
        &format!("Friendly reply when the {} of {device} cannot be read", schema.description),
    );
    let device = device.to_string();
    let property = property.to_string();

    ToolDescriptor::new(
        name,
        format!("Query the {} of {device}", schema.description),
        ToolType::IotCtl,
        parameters,
        move |ctx: &mut ConversationContext, args| {
            let success = required_str(args, RESPONSE_SUCCESS)?;
            let failure = required_str(args, RESPONSE_FAILURE)?;
            match ctx.connection().iot_value(&device, &property) {
                Some(value) => {
                    let shown = display_value(&value);
                    Ok(ToolOutcome::response(
                        ToolType::IotCtl,
                        shown.clone(),
                        success.replace("{value}", &shown),
                    ))
                }
                None => Ok(ToolOutcome::error(
                    ToolType::IotCtl,
                    format!("{device}.{property} has no reported value"),
                    failure,
                )),
            }
        },
    )
}

fn method_tool(descriptor: &IotDescriptor, method: &str, spec: &IotMethod) -> ToolDescriptor {
    let mut parameters = ParameterSchema::new();
    for (name, param) in &spec.parameters {
        parameters = parameters.property(
            name.clone(),
            PropertySchema::typed(param.kind.clone(), param.description.clone()),
            true,
        );
    }
    let parameters = response_params(
        parameters,
        "Friendly reply describing the result of the operation, no placeholders",
        "Friendly reply when the operation fails",
    );
    let device = descriptor.name.clone();
    let method_name = method.to_string();

    ToolDescriptor::new(
        method,
        format!("{} - {}", descriptor.description, spec.description),
        ToolType::IotCtl,
        parameters,
        move |ctx: &mut ConversationContext, args| {
            let success = required_str(args, RESPONSE_SUCCESS)?.to_string();
            let failure = required_str(args, RESPONSE_FAILURE)?.to_string();
            let mut command_args = args.clone();
            command_args.remove(RESPONSE_SUCCESS);
            command_args.remove(RESPONSE_FAILURE);

            if ctx
                .connection()
                .send_iot_command(&device, &method_name, command_args)
            {
                Ok(ToolOutcome::response(
                    ToolType::IotCtl,
                    format!("{device}.{method_name} sent"),
                    success,
                ))
            } else {
                Ok(ToolOutcome::error(
                    ToolType::IotCtl,
                    format!("{device}.{method_name} could not be sent"),
                    failure,
                ))
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConnectionHandle;
    use crate::ipc::events::{OutboundFrame, ServerMessage};
    use crate::tools::{ActionType, ToolRegistry};
    use serde_json::json;

    fn speaker() -> IotDescriptor {
        serde_json::from_value(json!({
            "name": "Speaker",
            "description": "The device speaker",
            "properties": {
                "volume": {"description": "current volume", "type": "number"}
            },
            "methods": {
                "SetVolume": {
                    "description": "set the volume",
                    "parameters": {"volume": {"description": "0-100", "type": "number"}}
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn property_tool_answers_from_reported_state() {
        let (connection, _rx) = ConnectionHandle::detached("iot-1");
        let mut ctx = ConversationContext::new("", 10, connection, ToolRegistry::new());
        assert_eq!(register_devices(&mut ctx, vec![speaker()]), 2);

        let args = r#"{"response_success":"Volume is {value}","response_failure":"Can't tell"}"#;
        let before = ctx.dispatch_tool("get_speaker_volume", args);
        assert_eq!(before.action, ActionType::Error);
        assert_eq!(before.response, "Can't tell");

        ctx.connection().update_iot_state(&[IotStateUpdate {
            name: "Speaker".into(),
            state: json!({"volume": 60}).as_object().unwrap().clone(),
        }]);
        let after = ctx.dispatch_tool("get_speaker_volume", args);
        assert_eq!(after.action, ActionType::Response);
        assert_eq!(after.response, "Volume is 60");
    }

    #[test]
    fn method_tool_sends_command_without_response_texts() {
        let (connection, mut rx) = ConnectionHandle::detached("iot-2");
        let mut ctx = ConversationContext::new("", 10, connection, ToolRegistry::new());
        register_devices(&mut ctx, vec![speaker()]);

        let outcome = ctx.dispatch_tool(
            "SetVolume",
            r#"{"volume":30,"response_success":"Done","response_failure":"Failed"}"#,
        );
        assert_eq!(outcome.action, ActionType::Response);
        assert_eq!(outcome.response, "Done");

        let Ok(OutboundFrame::Json(ServerMessage::Iot { commands })) = rx.try_recv() else {
            panic!("expected an iot frame");
        };
        assert_eq!(commands[0].name, "Speaker");
        assert_eq!(commands[0].method, "SetVolume");
        assert_eq!(commands[0].parameters.len(), 1);
        assert_eq!(commands[0].parameters["volume"], 30);
    }

    #[test]
    fn method_tool_fails_when_connection_closed() {
        let (connection, rx) = ConnectionHandle::detached("iot-3");
        let mut ctx = ConversationContext::new("", 10, connection, ToolRegistry::new());
        register_devices(&mut ctx, vec![speaker()]);
        drop(rx);

        let outcome = ctx.dispatch_tool(
            "SetVolume",
            r#"{"volume":30,"response_success":"Done","response_failure":"Failed"}"#,
        );
        assert_eq!(outcome.action, ActionType::Error);
        assert_eq!(outcome.response, "Failed");
    }

    #[test]
    fn mistyped_state_is_rejected() {
        let mut devices = IotDevices::default();
        devices.register(speaker());
        let accepted = devices.apply(&IotStateUpdate {
            name: "Speaker".into(),
            state: json!({"volume": "loud", "bass": 3}).as_object().unwrap().clone(),
        });
        assert_eq!(accepted, 0);
        assert!(devices.value("Speaker", "volume").is_none());
    }

    #[test]
    fn method_only_device_exposes_parameters_as_properties() {
        let mut lamp: IotDescriptor = serde_json::from_value(json!({
            "name": "Lamp",
            "methods": {
                "SetBrightness": {"parameters": {"brightness": {"type": "number"}}}
            }
        }))
        .unwrap();
        lamp.normalize();
        assert_eq!(lamp.properties["brightness"].kind, "number");
    }
}
