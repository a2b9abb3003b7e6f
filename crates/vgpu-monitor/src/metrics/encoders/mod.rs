use std::collections::BTreeMap;

pub mod influx;

/// Parameters for encoding one container/device usage line
#[derive(Debug, Clone)]
pub struct ContainerMetricsParams<'a> {
    pub pod_uid: &'a str,
    pub container: &'a str,
    pub device_index: usize,
    pub device_uuid: &'a str,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub context_bytes: u64,
    pub module_bytes: u64,
    pub buffer_bytes: u64,
    pub offset_bytes: u64,
    pub sm_util: u64,
    pub sm_limit: u64,
    pub priority: i32,
    pub last_kernel_time: i64,
    pub timestamp: i64,
}

/// Field value for metrics
#[derive(Debug, Clone)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    UnsignedInteger(u64),
    Float(f64),
    Boolean(bool),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Integer(value.into())
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::UnsignedInteger(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

/// Trait for encoding metrics in different formats
pub trait MetricsEncoder: Send + Sync {
    /// Encode metrics with measurement name, tags, fields, and timestamp
    fn encode_metrics(
        &self,
        measurement: &str,
        tags: &BTreeMap<String, String>,
        fields: &BTreeMap<String, FieldValue>,
        timestamp: i64,
    ) -> String;

    fn encode_container_metrics(&self, params: &ContainerMetricsParams) -> String {
        let tags = BTreeMap::from([
            ("pod_uid".to_string(), params.pod_uid.to_string()),
            ("container".to_string(), params.container.to_string()),
            ("device_index".to_string(), params.device_index.to_string()),
            ("device_uuid".to_string(), params.device_uuid.to_string()),
        ]);

        let fields = BTreeMap::from([
            ("memory_usage_bytes".to_string(), params.memory_usage_bytes.into()),
            ("memory_limit_bytes".to_string(), params.memory_limit_bytes.into()),
            ("context_bytes".to_string(), params.context_bytes.into()),
            ("module_bytes".to_string(), params.module_bytes.into()),
            ("buffer_bytes".to_string(), params.buffer_bytes.into()),
            ("offset_bytes".to_string(), params.offset_bytes.into()),
            ("sm_util".to_string(), params.sm_util.into()),
            ("sm_limit".to_string(), params.sm_limit.into()),
            ("priority".to_string(), params.priority.into()),
            ("last_kernel_time".to_string(), params.last_kernel_time.into()),
        ]);

        self.encode_metrics("vgpu_container_usage", &tags, &fields, params.timestamp)
    }
}
