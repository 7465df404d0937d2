//! Normalization of raw queue messages into [`EventRecord`]s.
//!
//! The normalizer is a pure function of its input: it decodes the message
//! body, resolves each event against the deployment's [`SchemaVariant`] and
//! produces one outcome per event, in input order. An event missing a
//! required field yields a [`FieldMissingError`] without affecting its
//! siblings.
//!
//! The variable list is passed through as the exact text it had in the
//! message body; only the recognized readings are interpreted.

use std::collections::HashMap;

use serde_json::value::RawValue;
use serde_json::{Map, Value};

use crate::error::{DecodeError, FieldMissingError};
use crate::models::{
    EventRecord, PumpingState, SchemaVariant, ENGINE_SPEED, FUEL_LEVEL, FUEL_RATE,
    TOTAL_USED_FUEL,
};

// ---

/// Result of normalizing a single event.
pub type EventOutcome = Result<EventRecord, FieldMissingError>;

const LOCATION_MODULE: &str = "gpsLocationStampModule";
const TIME_MODULE: &str = "gpsTimeStampModule";
const VARIABLES_MODULE: &str = "variablesDumpListModule";

const LEGACY_VARIABLES_PATH: &[&str] = &[TIME_MODULE, "header", VARIABLES_MODULE, "variables"];
const CURRENT_VARIABLES_PATH: &[&str] = &[VARIABLES_MODULE, "variables"];

#[derive(Debug, Clone)]
pub struct Normalizer {
    // ---
    variant: SchemaVariant,
    tenant_tag: String,
}

/// Where one event's substructures live, resolved once per event.
struct EventView<'a> {
    header: &'a Map<String, Value>,
    location: Option<&'a Map<String, Value>>,
    variables: Option<&'a Value>,
    raw_variables: Option<&'a RawValue>,
}

impl<'a> EventView<'a> {
    // ---
    fn resolve(
        variant: SchemaVariant,
        index: usize,
        event: &'a Value,
        raw_event: Option<&'a RawValue>,
    ) -> Result<Self, FieldMissingError> {
        // ---
        let location = event.get(LOCATION_MODULE).and_then(Value::as_object);

        let (header, variables, raw_path) = match variant {
            SchemaVariant::Legacy => {
                let header = event
                    .get(TIME_MODULE)
                    .and_then(|module| module.get("header"))
                    .and_then(Value::as_object)
                    .ok_or(FieldMissingError {
                        index,
                        field: "gpsTimeStampModule.header",
                    })?;
                let variables = variable_list(header.get(VARIABLES_MODULE));
                (header, variables, LEGACY_VARIABLES_PATH)
            }
            SchemaVariant::Current => {
                let header = event
                    .get("header")
                    .and_then(Value::as_object)
                    .ok_or(FieldMissingError {
                        index,
                        field: "header",
                    })?;
                let variables = variable_list(event.get(VARIABLES_MODULE));
                (header, variables, CURRENT_VARIABLES_PATH)
            }
        };

        let raw_variables = variables.and(raw_event.and_then(|raw| raw_path_get(raw, raw_path)));

        Ok(Self {
            header,
            location,
            variables,
            raw_variables,
        })
    }
}

/// The `variables` array of a dump module, if both are present.
fn variable_list(module: Option<&Value>) -> Option<&Value> {
    module?.get("variables").filter(|list| list.is_array())
}

/// Follow `path` through nested objects, keeping the value's source text.
fn raw_path_get<'a>(raw: &'a RawValue, path: &[&str]) -> Option<&'a RawValue> {
    path.iter().try_fold(raw, |node, key| raw_member(node, key))
}

/// One member of a raw JSON object; `None` if `raw` is not an object.
fn raw_member<'a>(raw: &'a RawValue, key: &str) -> Option<&'a RawValue> {
    // ---
    let mut members: HashMap<String, &'a RawValue> = serde_json::from_str(raw.get()).ok()?;
    members.remove(key)
}

/// Source text of each entry of the top-level `events` array.
fn raw_events(body: &[u8]) -> Vec<&RawValue> {
    // ---
    let Ok(mut members) = serde_json::from_slice::<HashMap<String, &RawValue>>(body) else {
        return Vec::new();
    };
    members
        .remove("events")
        .and_then(|events| serde_json::from_str(events.get()).ok())
        .unwrap_or_default()
}

/// Named variable readings, zero unless a recognized title is found.
#[derive(Debug, Default)]
struct VariableReadings {
    engine_speed: f64,
    fuel_level: f64,
    total_used_fuel: f64,
    fuel_rate: f64,
}

impl VariableReadings {
    // ---
    fn collect(list: &Value) -> Self {
        // ---
        let mut readings = Self::default();

        for entry in list.as_array().into_iter().flatten() {
            let Some(title) = entry.get("title").and_then(Value::as_str) else {
                continue;
            };
            let Some(value) = entry.get("resultValue").and_then(Value::as_f64) else {
                continue;
            };

            match title {
                ENGINE_SPEED => readings.engine_speed = value,
                FUEL_LEVEL => readings.fuel_level = value,
                TOTAL_USED_FUEL => readings.total_used_fuel = value,
                FUEL_RATE => readings.fuel_rate = value,
                _ => {}
            }
        }

        readings
    }
}

impl Normalizer {
    // ---
    pub fn new(variant: SchemaVariant, tenant_tag: impl Into<String>) -> Self {
        Self {
            variant,
            tenant_tag: tenant_tag.into(),
        }
    }

    pub fn variant(&self) -> SchemaVariant {
        self.variant
    }

    /// Decode a raw message body and normalize each of its events.
    ///
    /// Fails only when the body is not JSON or has no `events` sequence;
    /// per-event failures are returned in place, so the output always has
    /// one entry per input event.
    pub fn normalize(&self, body: &[u8]) -> Result<Vec<EventOutcome>, DecodeError> {
        // ---
        let message: Value = serde_json::from_slice(body)?;

        let events = message
            .get("events")
            .ok_or(DecodeError::MissingEvents)?
            .as_array()
            .ok_or(DecodeError::EventsNotSequence)?;
        let raw = raw_events(body);

        Ok(events
            .iter()
            .enumerate()
            .map(|(index, event)| self.normalize_event(index, event, raw.get(index).copied()))
            .collect())
    }

    fn normalize_event(
        &self,
        index: usize,
        event: &Value,
        raw_event: Option<&RawValue>,
    ) -> EventOutcome {
        // ---
        let view = EventView::resolve(self.variant, index, event, raw_event)?;
        let header = view.header;

        let require_number = |field: &'static str| {
            number(header, field).ok_or(FieldMissingError { index, field })
        };
        let require_integer = |field: &'static str| {
            integer(header, field).ok_or(FieldMissingError { index, field })
        };

        let latitude = require_number("Latitude")?;
        let longitude = require_number("Longitude")?;
        let unit_id = require_integer("UnitId")?;
        let ground_speed = require_number("Speed")?;
        let utc_timestamp_seconds = require_integer("UtcTimestampSeconds")?;
        let odometer = require_number("Odometer")?;
        let event_type = match self.variant {
            SchemaVariant::Current => Some(require_integer("TemplateId")?),
            SchemaVariant::Legacy => None,
        };

        let course = view
            .location
            .and_then(|location| number(location, "course"))
            .unwrap_or(0.0);

        let readings = view
            .variables
            .map(VariableReadings::collect)
            .unwrap_or_default();
        let raw_variables = view
            .raw_variables
            .map(|list| list.get().to_string())
            .unwrap_or_default();

        Ok(EventRecord {
            unit_id,
            latitude,
            longitude,
            ground_speed,
            utc_timestamp_seconds,
            odometer,
            course,
            event_type,
            pumping_state: PumpingState::from_event_type(event_type),
            engine_speed: readings.engine_speed,
            fuel_level: readings.fuel_level,
            total_used_fuel: readings.total_used_fuel,
            fuel_rate: readings.fuel_rate,
            raw_variables,
            client: self.tenant_tag.clone(),
        })
    }
}

fn number(map: &Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key)?.as_f64()
}

/// Integer field; integral floats such as `7.0` are accepted.
fn integer(map: &Map<String, Value>, key: &str) -> Option<i64> {
    // ---
    let value = map.get(key)?;
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn current() -> Normalizer {
        Normalizer::new(SchemaVariant::Current, "Cementos")
    }

    fn legacy() -> Normalizer {
        Normalizer::new(SchemaVariant::Legacy, "Cementos")
    }

    fn current_event(unit_id: i64, template_id: i64) -> Value {
        // ---
        json!({
            "header": {
                "Latitude": 19.43,
                "Longitude": -99.13,
                "UnitId": unit_id,
                "Speed": 42.5,
                "UtcTimestampSeconds": 1_700_000_000,
                "Odometer": 1234.5,
                "TemplateId": template_id
            }
        })
    }

    fn body(events: Vec<Value>) -> Vec<u8> {
        serde_json::to_vec(&json!({ "events": events })).unwrap()
    }

    #[test]
    fn test_reference_message() {
        // ---
        let raw = br#"{"events":[{"header":{"Latitude":1.1,"Longitude":2.2,"UnitId":7,"Speed":50,"UtcTimestampSeconds":1000,"Odometer":99.9,"TemplateId":132},"variablesDumpListModule":{"variables":[{"title":"Fuel Level","resultValue":55}]}}]}"#;

        let outcomes = current().normalize(raw).unwrap();
        assert_eq!(outcomes.len(), 1);

        let record = outcomes[0].as_ref().unwrap();
        assert_eq!(record.unit_id, 7);
        assert_eq!(record.pumping_state, PumpingState::PumpingOut);
        assert_eq!(record.event_type, Some(132));
        assert_eq!(record.fuel_level, 55.0);
        assert_eq!(record.engine_speed, 0.0);
        assert_eq!(record.course, 0.0);
        assert_eq!(record.ground_speed, 50.0);
        assert_eq!(record.odometer, 99.9);
        assert_eq!(record.utc_timestamp_seconds, 1000);
        assert_eq!(record.client, "Cementos");
        assert_eq!(
            record.raw_variables,
            r#"[{"title":"Fuel Level","resultValue":55}]"#
        );
    }

    #[test]
    fn test_raw_variables_keep_source_text() {
        // ---
        let raw = br#"{"events":[{"header":{"Latitude":1.1,"Longitude":2.2,"UnitId":7,"Speed":50,"UtcTimestampSeconds":1000,"Odometer":99.9,"TemplateId":0},"variablesDumpListModule":{"variables": [ {"title":"Fuel Level","resultValue":55.10}, {"resultValue":3,"title":"Zeta"} ] }}]}"#;

        let outcomes = current().normalize(raw).unwrap();
        let record = outcomes[0].as_ref().unwrap();

        assert_eq!(record.fuel_level, 55.1);
        assert_eq!(
            record.raw_variables,
            r#"[ {"title":"Fuel Level","resultValue":55.10}, {"resultValue":3,"title":"Zeta"} ]"#
        );
    }

    #[test]
    fn test_raw_variables_per_event() {
        // ---
        let raw = br#"{"events":[
            {"header":{"Latitude":1,"Longitude":2,"UnitId":1,"Speed":0,"UtcTimestampSeconds":1,"Odometer":0,"TemplateId":0},"variablesDumpListModule":{"variables":[{"title":"A","resultValue":1.50}]}},
            {"header":{"Latitude":1,"Longitude":2,"UnitId":2,"Speed":0,"UtcTimestampSeconds":2,"Odometer":0,"TemplateId":0}},
            {"header":{"Latitude":1,"Longitude":2,"UnitId":3,"Speed":0,"UtcTimestampSeconds":3,"Odometer":0,"TemplateId":0},"variablesDumpListModule":{"variables":[{"title":"B","resultValue":2.00}]}}
        ]}"#;

        let outcomes = current().normalize(raw).unwrap();
        let texts: Vec<&str> = outcomes
            .iter()
            .map(|o| o.as_ref().unwrap().raw_variables.as_str())
            .collect();

        assert_eq!(
            texts,
            vec![
                r#"[{"title":"A","resultValue":1.50}]"#,
                "",
                r#"[{"title":"B","resultValue":2.00}]"#
            ]
        );
    }

    #[test]
    fn test_preserves_event_order() {
        // ---
        let events = (1..=5).map(|unit| current_event(unit, 0)).collect();
        let outcomes = current().normalize(&body(events)).unwrap();

        let units: Vec<i64> = outcomes
            .iter()
            .map(|outcome| outcome.as_ref().unwrap().unit_id)
            .collect();
        assert_eq!(units, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_empty_events_yields_nothing() {
        // ---
        let outcomes = current().normalize(br#"{"events":[]}"#).unwrap();
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_normalize_is_idempotent() {
        // ---
        let mut event = current_event(9, 133);
        event["variablesDumpListModule"] = json!({
            "variables": [
                {"title": "Engine Speed", "resultValue": 1500.25},
                {"title": "Odd Sensor", "resultValue": 3}
            ]
        });
        let raw = body(vec![event, current_event(10, 1)]);

        let normalizer = current();
        let first = normalizer.normalize(&raw).unwrap();
        let second = normalizer.normalize(&raw).unwrap();

        assert_eq!(first, second);
        let first_json: Vec<String> = first
            .iter()
            .map(|o| serde_json::to_string(o.as_ref().unwrap()).unwrap())
            .collect();
        let second_json: Vec<String> = second
            .iter()
            .map(|o| serde_json::to_string(o.as_ref().unwrap()).unwrap())
            .collect();
        assert_eq!(first_json, second_json);
    }

    #[test]
    fn test_defaults_when_submodules_absent() {
        // ---
        let outcomes = current().normalize(&body(vec![current_event(1, 0)])).unwrap();
        let record = outcomes[0].as_ref().unwrap();

        assert_eq!(record.course, 0.0);
        assert_eq!(record.engine_speed, 0.0);
        assert_eq!(record.fuel_level, 0.0);
        assert_eq!(record.total_used_fuel, 0.0);
        assert_eq!(record.fuel_rate, 0.0);
        assert_eq!(record.raw_variables, "");
    }

    #[test]
    fn test_course_from_location_module() {
        // ---
        let mut event = current_event(1, 0);
        event["gpsLocationStampModule"] = json!({ "course": 270.5 });

        let outcomes = current().normalize(&body(vec![event])).unwrap();
        assert_eq!(outcomes[0].as_ref().unwrap().course, 270.5);
    }

    #[test]
    fn test_all_recognized_variables() {
        // ---
        let mut event = current_event(1, 0);
        event["variablesDumpListModule"] = json!({
            "variables": [
                {"title": "Engine Speed", "resultValue": 1800},
                {"title": "Fuel Level", "resultValue": 61.5},
                {"title": "Engine Total Fuel Used", "resultValue": 40210.0},
                {"title": "Engine Fuel Rate", "resultValue": 12.75},
                {"title": "fuel level", "resultValue": 1},
                {"title": "Coolant Temp", "resultValue": 88}
            ]
        });

        let outcomes = current().normalize(&body(vec![event])).unwrap();
        let record = outcomes[0].as_ref().unwrap();

        assert_eq!(record.engine_speed, 1800.0);
        assert_eq!(record.fuel_level, 61.5);
        assert_eq!(record.total_used_fuel, 40210.0);
        assert_eq!(record.fuel_rate, 12.75);
        assert!(record.raw_variables.contains("Coolant Temp"));
        assert!(record.raw_variables.contains("fuel level"));
    }

    #[test]
    fn test_repeated_title_last_wins() {
        // ---
        let mut event = current_event(1, 0);
        event["variablesDumpListModule"] = json!({
            "variables": [
                {"title": "Fuel Level", "resultValue": 10},
                {"title": "Fuel Level", "resultValue": 20}
            ]
        });

        let outcomes = current().normalize(&body(vec![event])).unwrap();
        assert_eq!(outcomes[0].as_ref().unwrap().fuel_level, 20.0);
    }

    #[test]
    fn test_pumping_state_from_template_id() {
        // ---
        let events = vec![
            current_event(1, 132),
            current_event(2, 133),
            current_event(3, 7),
        ];
        let outcomes = current().normalize(&body(events)).unwrap();

        let states: Vec<i8> = outcomes
            .iter()
            .map(|o| o.as_ref().unwrap().pumping_state.code())
            .collect();
        assert_eq!(states, vec![-1, 1, 0]);
    }

    #[test]
    fn test_missing_field_skips_only_that_event() {
        // ---
        let mut broken = current_event(2, 0);
        broken["header"].as_object_mut().unwrap().remove("Latitude");
        let events = vec![current_event(1, 0), broken, current_event(3, 0)];

        let outcomes = current().normalize(&body(events)).unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].as_ref().unwrap().unit_id, 1);
        assert_eq!(
            outcomes[1].as_ref().unwrap_err(),
            &FieldMissingError {
                index: 1,
                field: "Latitude"
            }
        );
        assert_eq!(outcomes[2].as_ref().unwrap().unit_id, 3);
    }

    #[test]
    fn test_current_requires_template_id() {
        // ---
        let mut event = current_event(1, 0);
        event["header"].as_object_mut().unwrap().remove("TemplateId");

        let outcomes = current().normalize(&body(vec![event])).unwrap();
        assert_eq!(outcomes[0].as_ref().unwrap_err().field, "TemplateId");
    }

    #[test]
    fn test_non_numeric_field_counts_as_missing() {
        // ---
        let mut event = current_event(1, 0);
        event["header"]["Speed"] = json!("fast");

        let outcomes = current().normalize(&body(vec![event])).unwrap();
        assert_eq!(outcomes[0].as_ref().unwrap_err().field, "Speed");
    }

    #[test]
    fn test_integral_float_unit_id() {
        // ---
        let mut event = current_event(1, 0);
        event["header"]["UnitId"] = json!(7.0);
        let mut fractional = current_event(2, 0);
        fractional["header"]["UnitId"] = json!(7.5);

        let outcomes = current().normalize(&body(vec![event, fractional])).unwrap();
        assert_eq!(outcomes[0].as_ref().unwrap().unit_id, 7);
        assert_eq!(outcomes[1].as_ref().unwrap_err().field, "UnitId");
    }

    #[test]
    fn test_current_does_not_guess_legacy_shape() {
        // ---
        let event = json!({
            "gpsTimeStampModule": {
                "header": {
                    "Latitude": 1.0, "Longitude": 2.0, "UnitId": 3, "Speed": 4.0,
                    "UtcTimestampSeconds": 5, "Odometer": 6.0
                }
            }
        });

        let outcomes = current().normalize(&body(vec![event])).unwrap();
        assert_eq!(outcomes[0].as_ref().unwrap_err().field, "header");
    }

    #[test]
    fn test_legacy_event() {
        // ---
        let event = json!({
            "gpsLocationStampModule": { "course": 90.0 },
            "gpsTimeStampModule": {
                "header": {
                    "Latitude": 25.67,
                    "Longitude": -100.31,
                    "UnitId": 4411,
                    "Speed": 12.0,
                    "UtcTimestampSeconds": 1_600_000_000,
                    "Odometer": 8000.0,
                    "TemplateId": 132,
                    "variablesDumpListModule": {
                        "variables": [{"title": "Engine Fuel Rate", "resultValue": 3.5}]
                    }
                }
            }
        });

        let outcomes = legacy().normalize(&body(vec![event])).unwrap();
        let record = outcomes[0].as_ref().unwrap();

        assert_eq!(record.unit_id, 4411);
        assert_eq!(record.course, 90.0);
        assert_eq!(record.fuel_rate, 3.5);
        assert_eq!(record.event_type, None);
        assert_eq!(record.pumping_state, PumpingState::Idle);
        assert!(record.raw_variables.contains("Engine Fuel Rate"));
    }

    #[test]
    fn test_legacy_raw_variables_keep_source_text() {
        // ---
        let raw = br#"{"events":[{"gpsTimeStampModule":{"header":{"Latitude":1,"Longitude":2,"UnitId":5,"Speed":0,"UtcTimestampSeconds":9,"Odometer":0,"variablesDumpListModule":{"variables":[{"title":"Engine Speed","resultValue":900.0}]}}}}]}"#;

        let outcomes = legacy().normalize(raw).unwrap();
        let record = outcomes[0].as_ref().unwrap();

        assert_eq!(record.engine_speed, 900.0);
        assert_eq!(
            record.raw_variables,
            r#"[{"title":"Engine Speed","resultValue":900.0}]"#
        );
    }

    #[test]
    fn test_legacy_defaults_when_submodules_absent() {
        // ---
        let event = json!({
            "gpsTimeStampModule": {
                "header": {
                    "Latitude": 25.67,
                    "Longitude": -100.31,
                    "UnitId": 4411,
                    "Speed": 12.0,
                    "UtcTimestampSeconds": 1_600_000_000,
                    "Odometer": 8000.0
                }
            }
        });

        let outcomes = legacy().normalize(&body(vec![event])).unwrap();
        let record = outcomes[0].as_ref().unwrap();

        assert_eq!(record.unit_id, 4411);
        assert_eq!(record.course, 0.0);
        assert_eq!(record.engine_speed, 0.0);
        assert_eq!(record.fuel_level, 0.0);
        assert_eq!(record.total_used_fuel, 0.0);
        assert_eq!(record.fuel_rate, 0.0);
        assert_eq!(record.raw_variables, "");
    }

    #[test]
    fn test_legacy_requires_time_module_header() {
        // ---
        let outcomes = legacy().normalize(&body(vec![current_event(1, 0)])).unwrap();
        assert_eq!(
            outcomes[0].as_ref().unwrap_err().field,
            "gpsTimeStampModule.header"
        );
    }

    #[test]
    fn test_decode_errors() {
        // ---
        let normalizer = current();

        assert!(matches!(
            normalizer.normalize(b"{not json"),
            Err(DecodeError::InvalidJson(_))
        ));
        assert!(matches!(
            normalizer.normalize(br#"{"evts":[]}"#),
            Err(DecodeError::MissingEvents)
        ));
        assert!(matches!(
            normalizer.normalize(br#"{"events":{"a":1}}"#),
            Err(DecodeError::EventsNotSequence)
        ));
        assert!(matches!(
            normalizer.normalize(b"[1,2,3]"),
            Err(DecodeError::MissingEvents)
        ));
    }
}
