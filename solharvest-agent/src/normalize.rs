//! Payload normalization
//!
//! Pure conversion of one raw payload plus its endpoint descriptor into
//! canonical measurement points. No I/O, no side effects. Failed payloads
//! yield zero points; payload fields not declared in the descriptor are
//! ignored, so provider schema additions never break the pipeline.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use scraper::{Html, Selector};

use crate::config::EndpointDescriptor;
use crate::model::{MeasurementPoint, PayloadBody, RawPayload};

pub fn normalize(descriptor: &EndpointDescriptor, payload: &RawPayload) -> Vec<MeasurementPoint> {
    if !payload.is_success() {
        return Vec::new();
    }

    match &payload.body {
        Some(PayloadBody::Json(value)) => normalize_json(descriptor, payload, value),
        Some(PayloadBody::Html(html)) => normalize_html(descriptor, payload, html),
        Some(PayloadBody::Registers(registers)) => {
            normalize_registers(descriptor, payload, registers)
        }
        None => Vec::new(),
    }
}

fn point(
    descriptor: &EndpointDescriptor,
    payload: &RawPayload,
    name: &str,
    unit: &str,
    timestamp: DateTime<Utc>,
    value: f64,
) -> MeasurementPoint {
    MeasurementPoint {
        measurement: name.to_string(),
        device_id: descriptor.device_id.clone(),
        timestamp,
        value,
        unit: unit.to_string(),
        source_kind: payload.source_kind,
    }
}

// ===== JSON =====

fn normalize_json(
    descriptor: &EndpointDescriptor,
    payload: &RawPayload,
    value: &serde_json::Value,
) -> Vec<MeasurementPoint> {
    // Source-reported timestamp if declared, fetch time otherwise.
    let base_ts = descriptor
        .timestamp_path
        .as_deref()
        .and_then(|path| lookup_path(value, path))
        .and_then(value_to_timestamp)
        .unwrap_or(payload.fetched_at);

    let mut points = Vec::new();
    for spec in descriptor.enabled_measurements() {
        let Some(path) = spec.value_path.as_deref() else {
            continue;
        };
        let Some(node) = lookup_path(value, path) else {
            continue;
        };

        match node {
            // Dated series (monthly history payloads): one point per element.
            serde_json::Value::Array(elements) => {
                for element in elements {
                    let Some(v) = element.get("value").and_then(value_as_f64) else {
                        continue; // provider pads missing days with null
                    };
                    let ts = element
                        .get("date")
                        .or_else(|| element.get("timestamp"))
                        .and_then(value_to_timestamp)
                        .unwrap_or(base_ts);
                    points.push(point(descriptor, payload, &spec.name, &spec.unit, ts, v));
                }
            }
            scalar => {
                if let Some(v) = value_as_f64(scalar) {
                    points.push(point(descriptor, payload, &spec.name, &spec.unit, base_ts, v));
                }
            }
        }
    }
    points
}

/// Walk a dotted path through a JSON tree; numeric segments index arrays.
fn lookup_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn value_as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        // Some providers stringify numbers.
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => parse_source_timestamp(s),
        serde_json::Value::Number(n) => {
            let epoch = n.as_i64()?;
            // Heuristic: values past ~2001 in milliseconds.
            if epoch > 1_000_000_000_000 {
                DateTime::from_timestamp_millis(epoch)
            } else {
                DateTime::from_timestamp(epoch, 0)
            }
        }
        _ => None,
    }
}

/// Accepts RFC3339, `YYYY-MM-DD HH:MM:SS` and bare dates (midnight UTC).
pub fn parse_source_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

// ===== Register maps =====

fn normalize_registers(
    descriptor: &EndpointDescriptor,
    payload: &RawPayload,
    registers: &std::collections::HashMap<String, f64>,
) -> Vec<MeasurementPoint> {
    descriptor
        .enabled_measurements()
        .filter_map(|spec| {
            registers.get(&spec.name).map(|&v| {
                point(
                    descriptor,
                    payload,
                    &spec.name,
                    &spec.unit,
                    payload.fetched_at,
                    v,
                )
            })
        })
        .collect()
}

// ===== HTML =====

fn normalize_html(
    descriptor: &EndpointDescriptor,
    payload: &RawPayload,
    html: &str,
) -> Vec<MeasurementPoint> {
    let document = Html::parse_document(html);

    let mut points = Vec::new();
    for spec in descriptor.enabled_measurements() {
        let Some(selector_str) = spec.selector.as_deref() else {
            continue;
        };
        let Ok(selector) = Selector::parse(selector_str) else {
            continue;
        };

        // Scope the lookup to this device's sub-tree when declared.
        let element = match descriptor.device_selector.as_deref() {
            Some(scope_str) => {
                let Ok(scope) = Selector::parse(scope_str) else {
                    continue;
                };
                document
                    .select(&scope)
                    .next()
                    .and_then(|node| node.select(&selector).next())
            }
            None => document.select(&selector).next(),
        };

        let Some(element) = element else { continue };
        let text: String = element.text().collect::<Vec<_>>().join(" ");
        if let Some(v) = parse_numeric_text(&text) {
            points.push(point(
                descriptor,
                payload,
                &spec.name,
                &spec.unit,
                payload.fetched_at,
                v,
            ));
        }
    }
    points
}

/// Leading numeric value of a display string ("1,234.5 kWh" -> 1234.5).
fn parse_numeric_text(text: &str) -> Option<f64> {
    let cleaned = text.trim().replace(',', "");
    let mut end = 0;
    for (i, c) in cleaned.char_indices() {
        let ok = c.is_ascii_digit() || c == '.' || ((c == '-' || c == '+') && i == 0);
        if !ok {
            break;
        }
        end = i + c.len_utf8();
    }
    cleaned[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeasurementSpec;
    use crate::model::{RawPayload, SourceKind};
    use chrono::TimeZone;

    fn spec(name: &str, value_path: Option<&str>, selector: Option<&str>) -> MeasurementSpec {
        MeasurementSpec {
            name: name.to_string(),
            enabled: true,
            unit: "W".to_string(),
            min: None,
            max: None,
            value_path: value_path.map(str::to_string),
            selector: selector.map(str::to_string),
            register: None,
            register_format: None,
            scale: None,
        }
    }

    fn descriptor(kind: SourceKind, measurements: Vec<MeasurementSpec>) -> EndpointDescriptor {
        EndpointDescriptor {
            id: "test".to_string(),
            enabled: true,
            source_kind: kind,
            device_id: "dev-1".to_string(),
            device_type: None,
            path: None,
            device_selector: None,
            unit_id: None,
            timestamp_path: None,
            request_params: Default::default(),
            measurements,
        }
    }

    #[test]
    fn test_failed_payload_yields_zero_points() {
        let desc = descriptor(SourceKind::Api, vec![spec("power", Some("power"), None)]);
        let payload = RawPayload::failed(SourceKind::Api, "test", "boom");
        assert!(normalize(&desc, &payload).is_empty());
    }

    #[test]
    fn test_json_nested_path_extraction() {
        let desc = descriptor(
            SourceKind::Api,
            vec![spec("power", Some("overview.currentPower.power"), None)],
        );
        let payload = RawPayload::fetched(
            SourceKind::Api,
            "test",
            PayloadBody::Json(serde_json::json!({
                "overview": {
                    "currentPower": { "power": 3520.5, "undeclared": "ignored" },
                    "alsoIgnored": true
                }
            })),
        );

        let points = normalize(&desc, &payload);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, "power");
        assert_eq!(points[0].value, 3520.5);
        assert_eq!(points[0].device_id, "dev-1");
        assert_eq!(points[0].timestamp, payload.fetched_at);
    }

    #[test]
    fn test_json_dated_series_yields_point_per_element() {
        let desc = descriptor(
            SourceKind::Api,
            vec![spec("energy", Some("energy.values"), None)],
        );
        let payload = RawPayload::fetched(
            SourceKind::Api,
            "test",
            PayloadBody::Json(serde_json::json!({
                "energy": {
                    "values": [
                        {"date": "2024-05-01 00:00:00", "value": 12500.0},
                        {"date": "2024-05-02 00:00:00", "value": null},
                        {"date": "2024-05-03 00:00:00", "value": 13100.0}
                    ]
                }
            })),
        );

        let points = normalize(&desc, &payload);
        assert_eq!(points.len(), 2); // null day skipped
        assert_eq!(
            points[0].timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(points[1].value, 13100.0);
    }

    #[test]
    fn test_json_source_reported_timestamp() {
        let mut desc = descriptor(SourceKind::Api, vec![spec("power", Some("power"), None)]);
        desc.timestamp_path = Some("lastUpdate".to_string());
        let payload = RawPayload::fetched(
            SourceKind::Api,
            "test",
            PayloadBody::Json(serde_json::json!({
                "power": 100.0,
                "lastUpdate": "2024-05-10T12:30:00Z"
            })),
        );

        let points = normalize(&desc, &payload);
        assert_eq!(
            points[0].timestamp,
            Utc.with_ymd_and_hms(2024, 5, 10, 12, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_json_missing_path_drops_only_that_measurement() {
        let desc = descriptor(
            SourceKind::Api,
            vec![
                spec("power", Some("present"), None),
                spec("voltage", Some("absent.path"), None),
            ],
        );
        let payload = RawPayload::fetched(
            SourceKind::Api,
            "test",
            PayloadBody::Json(serde_json::json!({"present": 42.0})),
        );

        let points = normalize(&desc, &payload);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, "power");
    }

    #[test]
    fn test_register_map_lookup() {
        let mut m = spec("ac_power", None, None);
        m.register = Some(40083);
        let desc = descriptor(SourceKind::Modbus, vec![m, spec("unmapped", None, None)]);

        let mut registers = std::collections::HashMap::new();
        registers.insert("ac_power".to_string(), 4820.0);
        registers.insert("undeclared".to_string(), 1.0);
        let payload =
            RawPayload::fetched(SourceKind::Modbus, "test", PayloadBody::Registers(registers));

        let points = normalize(&desc, &payload);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, "ac_power");
        assert_eq!(points[0].value, 4820.0);
    }

    #[test]
    fn test_html_device_scoped_extraction() {
        let mut desc = descriptor(
            SourceKind::Web,
            vec![spec("power", None, Some("span.power"))],
        );
        desc.device_selector = Some("div[data-serial=\"inv-1\"]".to_string());

        let html = r#"
            <html><body>
              <div data-serial="inv-0"><span class="power">999 W</span></div>
              <div data-serial="inv-1"><span class="power">1,250.5 W</span></div>
            </body></html>
        "#;
        let payload =
            RawPayload::fetched(SourceKind::Web, "test", PayloadBody::Html(html.to_string()));

        let points = normalize(&desc, &payload);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 1250.5);
    }

    #[test]
    fn test_numeric_text_parsing() {
        assert_eq!(parse_numeric_text("1,234.5 kWh"), Some(1234.5));
        assert_eq!(parse_numeric_text(" -10.2 C"), Some(-10.2));
        assert_eq!(parse_numeric_text("42"), Some(42.0));
        assert_eq!(parse_numeric_text("n/a"), None);
        assert_eq!(parse_numeric_text(""), None);
    }

    #[test]
    fn test_timestamp_formats() {
        assert!(parse_source_timestamp("2024-05-10T12:30:00Z").is_some());
        assert!(parse_source_timestamp("2024-05-10 12:30:00").is_some());
        assert_eq!(
            parse_source_timestamp("2024-05-10").unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap()
        );
        assert!(parse_source_timestamp("not a date").is_none());
    }
}
