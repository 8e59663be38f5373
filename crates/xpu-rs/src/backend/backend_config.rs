use serde::{Deserialize, Serialize};

/// Tri-state user policy: explicitly enabled, explicitly disabled or left to the compiler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreeState {
    #[serde(rename = "THREESTATE_ON")]
    On,
    #[serde(rename = "THREESTATE_OFF")]
    Off,
    #[default]
    #[serde(rename = "THREESTATE_UNDEFINED")]
    Undefined,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallType {
    #[default]
    Function,
    RepeatLoop,
    Pipeline,
    PipelineStage,
    ResourceUpdate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceUpdateConfig {
    pub offload_variables: ThreeState,
    pub partition_offloaded_variables: ThreeState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionConfig {
    pub partitioned_elementwise_cluster: bool,
    pub keep_input_layouts: bool,
    pub unique_sharding: bool,
    pub num_modified_remote_buffer_inputs: usize,
    pub num_unmodified_remote_buffer_inputs: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepeatConfig {
    pub repeat_count: usize,
}

/// Configuration attached to call-like instructions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallConfig {
    #[serde(rename = "type")]
    pub kind: CallType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_update_config: Option<ResourceUpdateConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_config: Option<FunctionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_config: Option<RepeatConfig>,
}

/// JSON document carried by every instruction; empty for most of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_config: Option<CallConfig>,
}

impl BackendConfig {
    pub fn call(kind: CallType) -> Self {
        Self {
            call_config: Some(CallConfig {
                kind,
                ..CallConfig::default()
            }),
        }
    }

    pub fn resource_update(config: ResourceUpdateConfig) -> Self {
        Self {
            call_config: Some(CallConfig {
                kind: CallType::ResourceUpdate,
                resource_update_config: Some(config),
                ..CallConfig::default()
            }),
        }
    }

    pub fn function(config: FunctionConfig) -> Self {
        Self {
            call_config: Some(CallConfig {
                kind: CallType::Function,
                function_config: Some(config),
                ..CallConfig::default()
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.call_config.is_none()
    }

    pub fn call_type(&self) -> Option<CallType> {
        self.call_config.as_ref().map(|c| c.kind)
    }

    pub fn resource_update_config(&self) -> ResourceUpdateConfig {
        self.call_config
            .as_ref()
            .and_then(|c| c.resource_update_config)
            .unwrap_or_default()
    }

    pub fn function_config(&self) -> FunctionConfig {
        self.call_config
            .as_ref()
            .and_then(|c| c.function_config)
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_update_config_uses_threestate_names() {
        let config = BackendConfig::resource_update(ResourceUpdateConfig {
            offload_variables: ThreeState::On,
            partition_offloaded_variables: ThreeState::Off,
        });
        let json = config.to_json().expect("serialize");
        assert!(json.contains("\"offloadVariables\":\"THREESTATE_ON\""));
        assert!(json.contains("\"type\":\"ResourceUpdate\""));
        assert_eq!(BackendConfig::from_json(&json).expect("parse"), config);
    }

    #[test]
    fn missing_fields_default_to_undefined() {
        let config = BackendConfig::from_json(
            r#"{"callConfig":{"type":"ResourceUpdate","resourceUpdateConfig":{}}}"#,
        )
        .expect("parse");
        let ru = config.resource_update_config();
        assert_eq!(ru.offload_variables, ThreeState::Undefined);
        assert_eq!(ru.partition_offloaded_variables, ThreeState::Undefined);
    }
}
