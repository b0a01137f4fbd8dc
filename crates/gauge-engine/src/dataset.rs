use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One input row; `id` must be stable across resumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetItem {
    pub id: String,
    pub input: Value,
    #[serde(default)]
    pub expected_output: Option<Value>,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl DatasetItem {
    pub fn new(id: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            input,
            expected_output: None,
            metadata: empty_object(),
        }
    }

    pub fn with_expected(mut self, expected: Value) -> Self {
        self.expected_output = Some(expected);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub items: Vec<DatasetItem>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, items: Vec<DatasetItem>) -> Self {
        Self {
            name: name.into(),
            items,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
