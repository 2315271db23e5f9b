//! Message types exchanged between the workspace daemon and its views
//!
//! Every envelope is a JSON object tagged by `type`. Views send
//! [`OutboundMessage`]s; the daemon sends [`InboundMessage`]s. The `state`
//! message is a partial update: absent fields are left untouched by the
//! receiver, an explicit `null` clears the field.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::build::BuildStatus;
use crate::config::{ConfigProperties, ProjectConfig, PropertyValue, Unit};

// ==============================================================================
// View → daemon
// ==============================================================================

/// Commands sent by views
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OutboundMessage {
    /// View finished loading and wants a full snapshot
    Ready,

    /// Run a named task; only `build` is known
    RunTask { task_type: String },

    /// Select a unit, resolve one from the active editor, or clear
    SetCurrentUnit {
        #[serde(default)]
        unit: Option<UnitTarget>,
    },

    /// Ask for the unit picker items
    QuickPickUnit,

    /// Write a preference; a missing value resets it to the default
    SetConfigProperty {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<PropertyValue>,
    },

    OpenSettings {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Source line ranges with differences, forwarded to editor views
    LineRanges { data: Vec<LineRange> },

    /// The editor's active file changed
    ActiveEditor {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    CopySymbol {
        symbol_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        demangled_name: Option<String>,
        #[serde(default)]
        demangled: bool,
    },

    /// Opaque per-view state persisted across restarts
    SetViewState { key: String, value: Value },

    #[serde(other)]
    Unknown,
}

/// Target of a `setCurrentUnit` command: a unit or the `"source"` keyword
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum UnitTarget {
    Source(SourceKeyword),
    Unit(Box<Unit>),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKeyword {
    #[serde(rename = "source")]
    Source,
}

impl UnitTarget {
    pub fn source() -> Self {
        UnitTarget::Source(SourceKeyword::Source)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

// ==============================================================================
// Daemon → view
// ==============================================================================

/// Messages pushed to views
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum InboundMessage {
    State(StateDelta),

    Notify {
        level: NotifyLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<NotifyAction>,
    },

    QuickPick { items: Vec<QuickPickItem> },

    Clipboard { text: String },

    LineRanges { data: Vec<LineRange> },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NotifyLevel {
    Info,
    Warning,
    Error,
}

/// Follow-up offered alongside a notification
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NotifyAction {
    ShowLog,
    OpenSettings,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QuickPickItem {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Raw object bytes, base64 on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectData(pub Arc<[u8]>);

impl ObjectData {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for ObjectData {
    fn from(bytes: Vec<u8>) -> Self {
        ObjectData(bytes.into())
    }
}

impl Serialize for ObjectData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for ObjectData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(ObjectData::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Partial state update
///
/// Outer `None` means "unchanged" and is not serialized; `Some(None)` is
/// sent as `null` and clears the field on the receiver.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_properties: Option<ConfigProperties>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub current_unit: Option<Option<Unit>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub left_status: Option<Option<BuildStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub right_status: Option<Option<BuildStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub left_object: Option<Option<ObjectData>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub right_object: Option<Option<ObjectData>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub diff_result: Option<Option<ObjectData>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub project_config: Option<Option<Arc<ProjectConfig>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_state: Option<BTreeMap<String, Value>>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        *self == StateDelta::default()
    }

    /// Split into frames carrying at most one object buffer each
    ///
    /// Object frames come first and the remaining fields last, so a receiver
    /// that waits for `buildRunning` has every object by then.
    pub fn into_frames(mut self) -> Vec<StateDelta> {
        let mut frames = Vec::new();
        if matches!(self.left_object, Some(Some(_))) {
            frames.push(StateDelta {
                left_object: self.left_object.take(),
                ..Default::default()
            });
        }
        if matches!(self.right_object, Some(Some(_))) {
            frames.push(StateDelta {
                right_object: self.right_object.take(),
                ..Default::default()
            });
        }
        if matches!(self.diff_result, Some(Some(_))) {
            frames.push(StateDelta {
                diff_result: self.diff_result.take(),
                ..Default::default()
            });
        }
        if !self.is_empty() {
            frames.push(self);
        }
        frames
    }
}

/// Full workspace state: canonical in the daemon, mirrored by views
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceState {
    pub build_running: bool,
    pub config_properties: ConfigProperties,
    pub current_unit: Option<Unit>,
    pub left_status: Option<BuildStatus>,
    pub right_status: Option<BuildStatus>,
    pub left_object: Option<ObjectData>,
    pub right_object: Option<ObjectData>,
    pub diff_result: Option<ObjectData>,
    pub project_config: Option<Arc<ProjectConfig>>,
    pub view_state: BTreeMap<String, Value>,
}

impl WorkspaceState {
    /// Delta carrying every field, sent to a view when it becomes ready
    pub fn snapshot(&self) -> StateDelta {
        StateDelta {
            build_running: Some(self.build_running),
            config_properties: Some(self.config_properties.clone()),
            current_unit: Some(self.current_unit.clone()),
            left_status: Some(self.left_status.clone()),
            right_status: Some(self.right_status.clone()),
            left_object: Some(self.left_object.clone()),
            right_object: Some(self.right_object.clone()),
            diff_result: Some(self.diff_result.clone()),
            project_config: Some(self.project_config.clone()),
            view_state: Some(self.view_state.clone()),
        }
    }

    /// Apply only the fields present in `delta`
    pub fn apply(&mut self, delta: StateDelta) {
        if let Some(v) = delta.build_running {
            self.build_running = v;
        }
        if let Some(v) = delta.config_properties {
            self.config_properties = v;
        }
        if let Some(v) = delta.current_unit {
            self.current_unit = v;
        }
        if let Some(v) = delta.left_status {
            self.left_status = v;
        }
        if let Some(v) = delta.right_status {
            self.right_status = v;
        }
        if let Some(v) = delta.left_object {
            self.left_object = v;
        }
        if let Some(v) = delta.right_object {
            self.right_object = v;
        }
        if let Some(v) = delta.diff_result {
            self.diff_result = v;
        }
        if let Some(v) = delta.project_config {
            self.project_config = v;
        }
        if let Some(v) = delta.view_state {
            self.view_state = v;
        }
    }
}

/// Serde adapter for `Option<Option<T>>` fields (absent / null / value)
mod nullable {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ipc::MAX_MESSAGE_SIZE;
    use serde_json::json;

    fn parse(value: Value) -> OutboundMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_outbound_simple_commands() {
        assert_eq!(parse(json!({"type": "ready"})), OutboundMessage::Ready);
        assert_eq!(parse(json!({"type": "quickPickUnit"})), OutboundMessage::QuickPickUnit);
        assert_eq!(
            parse(json!({"type": "runTask", "taskType": "build"})),
            OutboundMessage::RunTask {
                task_type: "build".to_string()
            }
        );
    }

    #[test]
    fn test_set_current_unit_variants() {
        assert_eq!(
            parse(json!({"type": "setCurrentUnit", "unit": "source"})),
            OutboundMessage::SetCurrentUnit {
                unit: Some(UnitTarget::source())
            }
        );
        assert_eq!(
            parse(json!({"type": "setCurrentUnit", "unit": null})),
            OutboundMessage::SetCurrentUnit { unit: None }
        );
        let OutboundMessage::SetCurrentUnit {
            unit: Some(UnitTarget::Unit(unit)),
        } = parse(json!({"type": "setCurrentUnit", "unit": {"name": "mod/foo.o", "base_path": "b/foo.o"}}))
        else {
            panic!("expected unit target");
        };
        assert_eq!(unit.name(), "mod/foo.o");
        assert_eq!(unit.base_path.as_deref(), Some("b/foo.o"));
    }

    #[test]
    fn test_set_config_property_value_optional() {
        assert_eq!(
            parse(json!({"type": "setConfigProperty", "id": "arm.archVersion", "value": "v4t"})),
            OutboundMessage::SetConfigProperty {
                id: "arm.archVersion".to_string(),
                value: Some(PropertyValue::String("v4t".to_string())),
            }
        );
        assert_eq!(
            parse(json!({"type": "setConfigProperty", "id": "spaceBetweenArgs"})),
            OutboundMessage::SetConfigProperty {
                id: "spaceBetweenArgs".to_string(),
                value: None,
            }
        );
    }

    #[test]
    fn test_copy_symbol_field_names() {
        assert_eq!(
            parse(json!({"type": "copySymbol", "symbolName": "_Z3foov", "demangledName": "foo()", "demangled": true})),
            OutboundMessage::CopySymbol {
                symbol_name: "_Z3foov".to_string(),
                demangled_name: Some("foo()".to_string()),
                demangled: true,
            }
        );
    }

    #[test]
    fn test_unknown_type_falls_through() {
        assert_eq!(parse(json!({"type": "frobnicate", "x": 1})), OutboundMessage::Unknown);
    }

    #[test]
    fn test_state_delta_omits_unchanged_and_keeps_null() {
        let delta = StateDelta {
            build_running: Some(false),
            left_status: Some(None),
            right_object: Some(Some(ObjectData::from(vec![1, 2, 3]))),
            ..Default::default()
        };
        let value = serde_json::to_value(InboundMessage::State(delta)).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "state",
                "buildRunning": false,
                "leftStatus": null,
                "rightObject": "AQID"
            })
        );
    }

    #[test]
    fn test_mirror_applies_only_present_fields() {
        let mut mirror = WorkspaceState {
            build_running: true,
            left_object: Some(ObjectData::from(vec![9])),
            ..Default::default()
        };
        let message: InboundMessage = serde_json::from_value(json!({
            "type": "state",
            "buildRunning": false,
            "rightObject": "AQID",
            "currentUnit": null
        }))
        .unwrap();
        let InboundMessage::State(delta) = message else {
            panic!("expected state");
        };
        mirror.apply(delta);
        assert!(!mirror.build_running);
        assert_eq!(mirror.left_object, Some(ObjectData::from(vec![9])));
        assert_eq!(mirror.right_object.as_ref().map(ObjectData::as_bytes), Some(&[1u8, 2, 3][..]));
        assert!(mirror.current_unit.is_none());
    }

    #[test]
    fn test_snapshot_rebuilds_identical_state() {
        let state = WorkspaceState {
            build_running: true,
            current_unit: Some(Unit {
                name: Some("a".to_string()),
                ..Default::default()
            }),
            right_object: Some(ObjectData::from(vec![1])),
            ..Default::default()
        };
        let mut mirror = WorkspaceState::default();
        mirror.apply(state.snapshot());
        assert_eq!(mirror, state);
    }

    #[test]
    fn test_objects_are_split_into_own_frames() {
        let big = ObjectData::from(vec![0u8; 25 * 1024 * 1024]);
        let delta = StateDelta {
            build_running: Some(false),
            left_object: Some(Some(big.clone())),
            right_object: Some(Some(big)),
            diff_result: Some(None),
            ..Default::default()
        };
        let frames = delta.clone().into_frames();
        assert_eq!(frames.len(), 3);
        let last = frames.last().unwrap();
        assert_eq!(last.build_running, Some(false));
        assert_eq!(last.diff_result, Some(None));
        assert!(last.left_object.is_none() && last.right_object.is_none());

        for frame in &frames {
            let encoded = serde_json::to_vec(&InboundMessage::State(frame.clone())).unwrap();
            assert!(encoded.len() <= MAX_MESSAGE_SIZE);
        }

        let mut split = WorkspaceState::default();
        for frame in frames {
            split.apply(frame);
        }
        let mut whole = WorkspaceState::default();
        whole.apply(delta);
        assert_eq!(split, whole);
    }

    #[test]
    fn test_delta_without_objects_is_one_frame() {
        let delta = StateDelta {
            build_running: Some(true),
            ..Default::default()
        };
        assert_eq!(delta.clone().into_frames(), vec![delta]);
        assert!(StateDelta::default().into_frames().is_empty());
    }

    #[test]
    fn test_notify_wire_shape() {
        let message = InboundMessage::Notify {
            level: NotifyLevel::Error,
            message: "Build failed".to_string(),
            action: Some(NotifyAction::ShowLog),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"type": "notify", "level": "error", "message": "Build failed", "action": "showLog"})
        );
    }
}
