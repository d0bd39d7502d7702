use serde::{Deserialize, Serialize};
use serde_json::Value;
use wfcore::ConfigMap;

/// Shape of a node type's configuration map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSchema {
    pub fields: Vec<ConfigField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(ConfigField {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(ConfigField {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Every violation found. Unknown keys are allowed.
    pub fn validate(&self, config: &ConfigMap) -> Vec<String> {
        let mut issues = Vec::new();
        for field in &self.fields {
            match config.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    issues.push(format!("missing required config '{}'", field.name));
                }
                Some(value) if !value.is_null() && !field.kind.accepts(value) => {
                    issues.push(format!(
                        "config '{}' must be {:?}",
                        field.name, field.kind
                    ));
                }
                _ => {}
            }
        }
        issues
    }
}
