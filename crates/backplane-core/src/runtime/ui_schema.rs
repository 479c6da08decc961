// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! UI schema normalization and execute-input mapping.
//!
//! A version's `ui_schema` is either the block form (`schema_version`,
//! `layout`, `blocks`, `actions`, `result_view`) or the older flat form
//! (`fields` + `submit`), which is rewritten into a single form block.
//! `input` and `select` blocks define the execute inputs.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, FieldError, Result};

/// Schema version stamped on normalized schemas.
pub const CURRENT_SCHEMA_VERSION: &str = "1.0.0";

const BLOCK_TYPES: &[&str] = &["form", "input", "select", "table", "card", "chart", "markdown"];
const RESULT_VIEW_TYPES: &[&str] = &["text", "markdown", "table", "card", "chart"];
const LAYOUT_TYPES: &[&str] = &["single_column", "grid"];
const FORBIDDEN_PROPS: &[&str] = &[
    "html",
    "dangerouslysetinnerhtml",
    "dangerously_set_innerhtml",
    "dangerously_set_inner_html",
    "innerhtml",
    "script",
    "raw_html",
    "rawhtml",
    "inline_style",
    "inline-style",
    "inlinestyle",
    "style",
];

/// Normalized UI schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiSchema {
    #[serde(default)]
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Layout>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_view: Option<ResultView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    #[serde(rename = "type", default)]
    pub layout_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub props: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub block_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input_key: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub props: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationRules>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub action_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub props: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultView {
    #[serde(rename = "type", default)]
    pub view_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub props: Map<String, Value>,
}

/// Per-input validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pattern: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct LegacySchema {
    #[serde(default)]
    title: String,
    #[serde(default)]
    fields: Vec<LegacyField>,
    #[serde(default)]
    submit: LegacySubmit,
}

#[derive(Debug, Deserialize)]
struct LegacyField {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default)]
    field_type: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    placeholder: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    options: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct LegacySubmit {
    #[serde(default)]
    label: String,
}

fn invalid(reason: &str) -> CoreError {
    CoreError::InvalidUiSchema(reason.to_string())
}

fn norm(value: &str) -> String {
    value.trim().to_lowercase()
}

fn has_forbidden_props(props: &Map<String, Value>) -> bool {
    props.keys().any(|k| FORBIDDEN_PROPS.contains(&norm(k).as_str()))
}

impl UiSchema {
    /// Parses and validates a stored schema. Empty or null schemas yield `None`.
    pub fn normalize(raw: &Value) -> Result<Option<Self>> {
        let Some(obj) = raw.as_object().filter(|o| !o.is_empty()) else {
            return Ok(None);
        };
        let mut schema = if !obj.contains_key("schema_version") && obj.contains_key("fields") {
            let legacy: LegacySchema =
                serde_json::from_value(raw.clone()).map_err(|_| invalid("malformed fields"))?;
            Self::from_legacy(legacy)
        } else {
            let mut schema: UiSchema =
                serde_json::from_value(raw.clone()).map_err(|e| invalid(&e.to_string()))?;
            if schema.schema_version.trim().is_empty() {
                schema.schema_version = CURRENT_SCHEMA_VERSION.to_string();
            }
            schema
        };
        schema.validate()?;
        Ok(Some(schema))
    }

    fn from_legacy(legacy: LegacySchema) -> Self {
        let children: Vec<Block> = legacy
            .fields
            .into_iter()
            .enumerate()
            .map(|(idx, field)| {
                let id = match field.id.trim() {
                    "" => format!("field_{}", idx + 1),
                    id => id.to_string(),
                };
                let mut props = Map::new();
                if !field.placeholder.trim().is_empty() {
                    props.insert("placeholder".into(), Value::String(field.placeholder));
                }
                if !field.options.is_empty() {
                    props.insert("options".into(), Value::Array(field.options));
                }
                let block_type = match norm(&field.field_type).as_str() {
                    "select" | "dropdown" => "select",
                    _ => "input",
                };
                Block {
                    id: id.clone(),
                    block_type: block_type.to_string(),
                    label: field.label,
                    input_key: id,
                    props,
                    validation: Some(ValidationRules {
                        required: field.required,
                        ..Default::default()
                    }),
                    children: Vec::new(),
                }
            })
            .collect();

        let title = match legacy.title.trim() {
            "" => "Form".to_string(),
            t => t.to_string(),
        };
        let submit = match legacy.submit.label.trim() {
            "" => "Submit".to_string(),
            l => l.to_string(),
        };
        let blocks = if children.is_empty() {
            Vec::new()
        } else {
            vec![Block {
                id: "form".into(),
                block_type: "form".into(),
                label: title,
                input_key: String::new(),
                props: Map::new(),
                validation: None,
                children,
            }]
        };
        Self {
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            layout: Some(Layout {
                layout_type: "single_column".into(),
                props: Map::new(),
            }),
            blocks,
            actions: vec![Action {
                id: "submit".into(),
                action_type: "submit".into(),
                label: submit,
                props: Map::new(),
            }],
            result_view: None,
        }
    }

    fn validate(&mut self) -> Result<()> {
        let layout = self.layout.get_or_insert_with(|| Layout {
            layout_type: "single_column".into(),
            props: Map::new(),
        });
        let mut layout_type = norm(&layout.layout_type);
        if layout_type.is_empty() || layout_type == "stack" {
            layout_type = "single_column".into();
        }
        if !LAYOUT_TYPES.contains(&layout_type.as_str()) || has_forbidden_props(&layout.props) {
            return Err(invalid("layout"));
        }
        layout.layout_type = layout_type;

        for block in &mut self.blocks {
            validate_block(block)?;
        }
        for action in &self.actions {
            if action.id.trim().is_empty()
                || action.action_type.trim().is_empty()
                || has_forbidden_props(&action.props)
            {
                return Err(invalid("action"));
            }
        }
        if let Some(view) = &mut self.result_view {
            let view_type = norm(&view.view_type);
            if !RESULT_VIEW_TYPES.contains(&view_type.as_str()) || has_forbidden_props(&view.props) {
                return Err(invalid("result_view"));
            }
            view.view_type = view_type;
        }
        Ok(())
    }

    /// JSON form returned by the schema endpoint.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn input_blocks(&self) -> Vec<&Block> {
        fn walk<'a>(blocks: &'a [Block], out: &mut Vec<&'a Block>) {
            for block in blocks {
                if matches!(norm(&block.block_type).as_str(), "input" | "select") {
                    out.push(block);
                }
                walk(&block.children, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.blocks, &mut out);
        out
    }

    /// Maps client inputs keyed by block id onto workflow input keys and
    /// validates them. With no input blocks the result is empty.
    pub fn map_inputs(&self, inputs: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut mapped = Map::new();
        let mut errors = Vec::new();
        for block in self.input_blocks() {
            let ui_key = block.id.trim();
            if ui_key.is_empty() {
                continue;
            }
            let target = match block.input_key.trim() {
                "" => ui_key,
                key => key,
            };
            let value = inputs
                .get(ui_key)
                .or_else(|| inputs.get(target))
                .filter(|v| !v.is_null());
            let Some(value) = value else {
                if block.validation.as_ref().is_some_and(|v| v.required) {
                    errors.push(FieldError {
                        field: ui_key.to_string(),
                        message: validation_message(block, "为必填项"),
                    });
                }
                continue;
            };
            if let Some(message) = check_value(block, value) {
                errors.push(FieldError {
                    field: ui_key.to_string(),
                    message,
                });
                continue;
            }
            mapped.insert(target.to_string(), value.clone());
        }
        if errors.is_empty() {
            Ok(mapped)
        } else {
            Err(CoreError::InvalidInputs(errors))
        }
    }
}

fn validate_block(block: &mut Block) -> Result<()> {
    let block_type = norm(&block.block_type);
    if block.id.trim().is_empty() || !BLOCK_TYPES.contains(&block_type.as_str()) {
        return Err(invalid("block"));
    }
    if has_forbidden_props(&block.props) {
        return Err(invalid("forbidden block prop"));
    }
    if let Some(rules) = &block.validation {
        if !rules.pattern.is_empty() && Regex::new(&rules.pattern).is_err() {
            return Err(invalid("validation pattern"));
        }
    }
    block.block_type = block_type;
    for child in &mut block.children {
        validate_block(child)?;
    }
    Ok(())
}

fn validation_message(block: &Block, suffix: &str) -> String {
    if let Some(msg) = block
        .validation
        .as_ref()
        .map(|v| v.message.trim())
        .filter(|m| !m.is_empty())
    {
        return msg.to_string();
    }
    let label = [block.label.trim(), block.id.trim()]
        .into_iter()
        .find(|l| !l.is_empty())
        .unwrap_or("输入");
    format!("{label}{suffix}")
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn trim_float(v: f64) -> String {
    let s = format!("{v:.2}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn check_value(block: &Block, value: &Value) -> Option<String> {
    let rules = block.validation.as_ref()?;
    if !rules.allowed.is_empty() && !rules.allowed.iter().any(|c| values_equal(value, c)) {
        return Some(validation_message(block, "取值不在允许范围内"));
    }
    if let (false, Value::String(s)) = (rules.pattern.is_empty(), value) {
        if let Ok(re) = Regex::new(&rules.pattern) {
            if !re.is_match(s) {
                return Some(validation_message(block, "格式不符合要求"));
            }
        }
    }
    if rules.min.is_none() && rules.max.is_none() {
        return None;
    }
    let (measure, min_label, max_label) = match as_number(value) {
        Some(n) => (Some(n), "最小值为 ", "最大值为 "),
        None => {
            let len = match value {
                Value::String(s) => Some(s.chars().count()),
                Value::Array(a) => Some(a.len()),
                Value::Object(o) => Some(o.len()),
                _ => None,
            };
            (len.map(|l| l as f64), "最小长度为 ", "最大长度为 ")
        }
    };
    let measure = measure?;
    if let Some(min) = rules.min.filter(|m| measure < *m) {
        return Some(validation_message(block, &format!("{min_label}{}", trim_float(min))));
    }
    if let Some(max) = rules.max.filter(|m| measure > *m) {
        return Some(validation_message(block, &format!("{max_label}{}", trim_float(max))));
    }
    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_legacy_fields_become_form() {
        let schema = UiSchema::normalize(&json!({
            "title": "Ask",
            "fields": [{"id": "q", "label": "Question", "required": true}, {"type": "dropdown", "options": ["a"]}],
        }))
        .unwrap()
        .unwrap();
        assert_eq!(schema.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(schema.blocks[0].block_type, "form");
        assert_eq!(schema.blocks[0].children[1].id, "field_2");
        assert_eq!(schema.blocks[0].children[1].block_type, "select");
        assert_eq!(schema.actions[0].label, "Submit");
    }

    #[test]
    fn test_rejects_unsafe_schema() {
        let bad = json!({"schema_version": "1.0.0", "blocks": [{"id": "x", "type": "markdown", "props": {"HTML": "<b>"}}]});
        assert!(matches!(UiSchema::normalize(&bad), Err(CoreError::InvalidUiSchema(_))));
        let bad = json!({"blocks": [{"id": "x", "type": "iframe"}]});
        assert!(UiSchema::normalize(&bad).is_err());
        assert!(UiSchema::normalize(&json!({})).unwrap().is_none());
        assert!(UiSchema::normalize(&Value::Null).unwrap().is_none());
    }

    #[test]
    fn test_map_inputs_validates_and_renames() {
        let schema = UiSchema::normalize(&json!({
            "blocks": [{"id": "form", "type": "form", "children": [
                {"id": "age", "type": "input", "label": "年龄", "input_key": "user_age",
                 "validation": {"required": true, "min": 18, "max": 99}},
                {"id": "plan", "type": "select", "validation": {"enum": ["a", "b"]}},
                {"id": "code", "type": "input", "validation": {"pattern": "^[A-Z]{3}$", "message": "bad code"}}
            ]}]
        }))
        .unwrap()
        .unwrap();

        let ok = schema
            .map_inputs(json!({"age": "30", "plan": "a", "extra": 1}).as_object().unwrap())
            .unwrap();
        assert_eq!(ok.get("user_age"), Some(&json!("30")));
        assert!(!ok.contains_key("extra"));

        let err = schema
            .map_inputs(json!({"age": 10, "plan": "z", "code": "abc"}).as_object().unwrap())
            .unwrap_err();
        let CoreError::InvalidInputs(fields) = err else {
            panic!("expected InvalidInputs");
        };
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].message, "年龄最小值为 18");
        assert_eq!(fields[1].message, "plan取值不在允许范围内");
        assert_eq!(fields[2].message, "bad code");

        let err = schema.map_inputs(&Map::new()).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUTS");
    }
}
