use std::collections::BTreeMap;

use influxdb_line_protocol::LineProtocolBuilder;

use super::FieldValue;
use super::MetricsEncoder;
use crate::metrics::BytesWrapper;

/// InfluxDB line protocol encoder
#[derive(Debug, Default)]
pub struct InfluxEncoder;

impl MetricsEncoder for InfluxEncoder {
    fn encode_metrics(
        &self,
        measurement: &str,
        tags: &BTreeMap<String, String>,
        fields: &BTreeMap<String, FieldValue>,
        timestamp: i64,
    ) -> String {
        let mut builder = LineProtocolBuilder::new().measurement(measurement);

        // Empty tag values are not representable in line protocol.
        for (key, value) in tags.iter().filter(|(_, v)| !v.is_empty()) {
            builder = builder.tag(key, value);
        }

        // The first field moves the builder into its after-field state.
        let mut fields = fields.iter();
        let Some((first_key, first_value)) = fields.next() else {
            let lp_built = builder
                .field("_empty", true)
                .timestamp(timestamp)
                .close_line()
                .build();
            return BytesWrapper::from(lp_built).to_string();
        };

        let mut after_first_field = match first_value {
            FieldValue::String(s) => builder.field(first_key, s.as_str()),
            FieldValue::Integer(i) => builder.field(first_key, *i),
            FieldValue::UnsignedInteger(u) => builder.field(first_key, *u),
            FieldValue::Float(f) => builder.field(first_key, *f),
            FieldValue::Boolean(b) => builder.field(first_key, *b),
        };

        for (key, value) in fields {
            after_first_field = match value {
                FieldValue::String(s) => after_first_field.field(key, s.as_str()),
                FieldValue::Integer(i) => after_first_field.field(key, *i),
                FieldValue::UnsignedInteger(u) => after_first_field.field(key, *u),
                FieldValue::Float(f) => after_first_field.field(key, *f),
                FieldValue::Boolean(b) => after_first_field.field(key, *b),
            };
        }

        let lp_built = after_first_field.timestamp(timestamp).close_line().build();
        BytesWrapper::from(lp_built).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::encoders::ContainerMetricsParams;

    #[test]
    fn encodes_container_usage_line() {
        let encoder = InfluxEncoder;
        let params = ContainerMetricsParams {
            pod_uid: "8d5c9b0e",
            container: "trainer",
            device_index: 1,
            device_uuid: "GPU-1234",
            memory_usage_bytes: 600,
            memory_limit_bytes: 1 << 30,
            context_bytes: 100,
            module_bytes: 200,
            buffer_bytes: 300,
            offset_bytes: 0,
            sm_util: 42,
            sm_limit: 50,
            priority: 1,
            last_kernel_time: 1_700_000_000,
            timestamp: 1_609_459_200_000_000_000,
        };

        let line = encoder.encode_container_metrics(&params);

        assert!(line.starts_with(
            "vgpu_container_usage,container=trainer,device_index=1,device_uuid=GPU-1234,pod_uid=8d5c9b0e "
        ));
        assert!(line.contains("memory_usage_bytes=600u"));
        assert!(line.contains("memory_limit_bytes=1073741824u"));
        assert!(line.contains("priority=1i"));
        assert!(line.contains("last_kernel_time=1700000000i"));
        assert!(line.trim_end().ends_with(" 1609459200000000000"));
    }

    #[test]
    fn empty_tag_values_are_dropped() {
        let encoder = InfluxEncoder;
        let tags = BTreeMap::from([
            ("device_uuid".to_string(), String::new()),
            ("pod_uid".to_string(), "p".to_string()),
        ]);
        let fields = BTreeMap::from([("sm_util".to_string(), FieldValue::from(7u64))]);

        let line = encoder.encode_metrics("vgpu_container_usage", &tags, &fields, 1);

        assert!(line.starts_with("vgpu_container_usage,pod_uid=p sm_util=7u 1"));
    }

    #[test]
    fn missing_fields_fall_back_to_placeholder() {
        let encoder = InfluxEncoder;
        let line = encoder.encode_metrics("vgpu_container_usage", &BTreeMap::new(), &BTreeMap::new(), 1);

        assert!(line.contains("_empty=true"));
    }
}
