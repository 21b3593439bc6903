//! Flat per-(resource, window) report records and their single-line wire form.

use crate::{
    classifier::{Classification, ResourceType},
    stats::TimeWindowStat,
};
use rust_decimal::prelude::ToPrimitive;
use std::{fmt, sync::Arc};

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRecord {
    pub ip: Arc<str>,
    pub config_id: i32,
    pub resource: String,
    pub resource_type: ResourceType,
    pub start: i64,
    pub total: i64,
    pub completed: i64,
    pub peak_concurrent: i64,
    pub requests_per_second: f64,
    pub blocked: i64,
    pub errors: i64,
    pub avg_response_time: i64,
    pub max_response_time: i64,
    pub min_response_time: i64,
}

/// Builds records for one reporting host.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    ip: Arc<str>,
}

impl RecordBuilder {
    pub fn new(ip: impl Into<Arc<str>>) -> Self {
        Self { ip: ip.into() }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn build(
        &self,
        resource: &str,
        classification: Classification,
        window: &TimeWindowStat,
    ) -> ReportRecord {
        let requests_per_second = window
            .rps
            .and_then(|rps| rps.to_f64())
            .unwrap_or(0.00);

        ReportRecord {
            ip: self.ip.clone(),
            config_id: classification.config_id,
            resource: resource.to_string(),
            resource_type: classification.resource_type,
            start: window.start_time,
            total: window.total,
            completed: window.comp_reqs,
            peak_concurrent: window.peak_concurrent_requests,
            requests_per_second,
            blocked: window.block_requests,
            errors: window.errors,
            avg_response_time: window.avg_rt,
            max_response_time: window.max,
            min_response_time: window.min,
        }
    }
}

impl ReportRecord {
    pub fn to_line(&self) -> String {
        self.to_string()
    }
}

/// Renders a double the way the JVM does: plain with a fractional part in
/// `[1e-3, 1e7)`, computerized scientific notation (`1.0E-4`) outside it.
struct JvmDouble(f64);

impl fmt::Display for JvmDouble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;
        if value.is_nan() {
            return f.write_str("NaN");
        }
        if value.is_infinite() {
            return f.write_str(if value > 0.0 { "Infinity" } else { "-Infinity" });
        }
        if value == 0.0 || (1e-3..1e7).contains(&value.abs()) {
            return write!(f, "{value:?}");
        }

        let scientific = format!("{value:e}");
        let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
        if mantissa.contains('.') {
            write!(f, "{mantissa}E{exponent}")
        } else {
            write!(f, "{mantissa}.0E{exponent}")
        }
    }
}

impl fmt::Display for ReportRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Strings are quoted but not escaped
        write!(
            f,
            "{{\"ip\":\"{}\",\"id\":{},\"resource\":\"{}\",\"type\":{},\"start\":{},\
             \"reqs\":{},\"completeReqs\":{},\"peakConcurrents\":{},\"reqPerSec\":{},\
             \"blockReqs\":{},\"errors\":{},\"avgRespTime\":{},\"maxRespTime\":{},\
             \"minRespTime\":{}}}",
            self.ip,
            self.config_id,
            self.resource,
            self.resource_type.code(),
            self.start,
            self.total,
            self.completed,
            self.peak_concurrent,
            JvmDouble(self.requests_per_second),
            self.blocked,
            self.errors,
            self.avg_response_time,
            self.max_response_time,
            self.min_response_time,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::dec;
    use serde_json::Value;

    fn sample_window() -> TimeWindowStat {
        TimeWindowStat {
            start_time: 1_704_067_210_000,
            total: 120,
            comp_reqs: 118,
            peak_concurrent_requests: 9,
            rps: Some(dec!(12.5)),
            block_requests: 2,
            errors: 1,
            avg_rt: 35,
            min: 3,
            max: 410,
        }
    }

    fn api_classification() -> Classification {
        Classification {
            config_id: 7,
            resource_type: ResourceType::Api,
        }
    }

    #[test]
    fn test_build_copies_fields() {
        let builder = RecordBuilder::new("10.0.0.5");
        let record = builder.build("/orders/list", api_classification(), &sample_window());

        assert_eq!(&*record.ip, "10.0.0.5");
        assert_eq!(record.config_id, 7);
        assert_eq!(record.resource, "/orders/list");
        assert_eq!(record.start, 1_704_067_210_000);
        assert_eq!(record.total, 120);
        assert_eq!(record.completed, 118);
        assert_eq!(record.peak_concurrent, 9);
        assert_eq!(record.requests_per_second, 12.5);
        assert_eq!(record.blocked, 2);
        assert_eq!(record.errors, 1);
        assert_eq!(record.avg_response_time, 35);
        assert_eq!(record.max_response_time, 410);
        assert_eq!(record.min_response_time, 3);
    }

    #[test]
    fn test_missing_rps_is_zero() {
        let window = TimeWindowStat {
            rps: None,
            ..sample_window()
        };
        let record = RecordBuilder::new("10.0.0.5").build("/orders/list", api_classification(), &window);

        assert_eq!(record.requests_per_second, 0.0);
        assert!(record.to_line().contains("\"reqPerSec\":0.0,"));
    }

    #[test]
    fn test_wire_format() {
        let record = RecordBuilder::new("10.0.0.5").build("/orders/list", api_classification(), &sample_window());

        assert_eq!(
            record.to_line(),
            "{\"ip\":\"10.0.0.5\",\"id\":7,\"resource\":\"/orders/list\",\"type\":4,\
             \"start\":1704067210000,\"reqs\":120,\"completeReqs\":118,\"peakConcurrents\":9,\
             \"reqPerSec\":12.5,\"blockReqs\":2,\"errors\":1,\"avgRespTime\":35,\
             \"maxRespTime\":410,\"minRespTime\":3}"
        );
    }

    #[test]
    fn test_wire_format_is_json_with_fixed_key_order() {
        let record = RecordBuilder::new("10.0.0.5").build(
            "payment-service",
            Classification {
                config_id: 0,
                resource_type: ResourceType::Service,
            },
            &sample_window(),
        );
        let line = record.to_line();
        assert!(!line.contains('\n'));

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["ip"], "10.0.0.5");
        assert_eq!(value["type"], 3);
        assert_eq!(value["reqPerSec"], 12.5);

        let keys = [
            "ip",
            "id",
            "resource",
            "type",
            "start",
            "reqs",
            "completeReqs",
            "peakConcurrents",
            "reqPerSec",
            "blockReqs",
            "errors",
            "avgRespTime",
            "maxRespTime",
            "minRespTime",
        ];
        let positions: Vec<usize> = keys
            .iter()
            .map(|key| line.find(&format!("\"{key}\":")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_double_rendering_follows_jvm() {
        let cases = [
            (0.0, "0.0"),
            (0.001, "0.001"),
            (12.5, "12.5"),
            (9_999_999.0, "9999999.0"),
            (0.0001, "1.0E-4"),
            (0.00025, "2.5E-4"),
            (1e7, "1.0E7"),
            (12_345_678.0, "1.2345678E7"),
            (-1e8, "-1.0E8"),
            (f64::INFINITY, "Infinity"),
            (f64::NAN, "NaN"),
        ];
        for (value, expected) in cases {
            assert_eq!(JvmDouble(value).to_string(), expected, "{value}");
        }
    }

    #[test]
    fn test_whole_rps_keeps_fraction() {
        let window = TimeWindowStat {
            rps: Some(dec!(3)),
            ..sample_window()
        };
        let record = RecordBuilder::new("10.0.0.5").build("_global", api_classification(), &window);
        assert!(record.to_line().contains("\"reqPerSec\":3.0,"));
    }
}
