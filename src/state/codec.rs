//! Tagged JSON encoding for persisted snapshots.
//!
//! Unlike [`StateValue::to_json`], this keeps dates, sets and maps
//! distinguishable so a journal entry decodes back to the same shape.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map as JsonMap, Value as Json};
use std::collections::HashSet;

use crate::error::{PomoflowError, Result};
use crate::state::value::StateValue;

const DATE_TAG: &str = "$date";
const SET_TAG: &str = "$set";
const MAP_TAG: &str = "$map";
const RECORD_TAG: &str = "$record";

fn is_tag(key: &str) -> bool {
    matches!(key, DATE_TAG | SET_TAG | MAP_TAG | RECORD_TAG)
}

/// Encode a state graph. Cyclic back-edges are written as `null`.
pub fn encode(value: &StateValue) -> Json {
    let mut ancestors = HashSet::new();
    encode_value(value, &mut ancestors).unwrap_or(Json::Null)
}

fn encode_value(value: &StateValue, ancestors: &mut HashSet<usize>) -> Option<Json> {
    let addr = value.node_addr();
    if let Some(addr) = addr {
        if !ancestors.insert(addr) {
            return Some(Json::Null);
        }
    }

    let encoded = match value {
        StateValue::Callable(_) => None,
        StateValue::Date(d) => {
            let mut tagged = JsonMap::new();
            tagged.insert(
                DATE_TAG.to_string(),
                Json::String(d.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
            Some(Json::Object(tagged))
        }
        StateValue::List(items) => Some(Json::Array(
            items
                .borrow()
                .iter()
                .filter_map(|item| encode_value(item, ancestors))
                .collect(),
        )),
        StateValue::Set(members) => {
            let members: Vec<Json> = members
                .borrow()
                .iter()
                .filter_map(|m| encode_value(m, ancestors))
                .collect();
            let mut tagged = JsonMap::new();
            tagged.insert(SET_TAG.to_string(), Json::Array(members));
            Some(Json::Object(tagged))
        }
        StateValue::Map(entries) => {
            let pairs: Vec<Json> = entries
                .borrow()
                .iter()
                .filter_map(|(k, v)| {
                    let k = encode_value(k, ancestors)?;
                    let v = encode_value(v, ancestors)?;
                    Some(Json::Array(vec![k, v]))
                })
                .collect();
            let mut tagged = JsonMap::new();
            tagged.insert(MAP_TAG.to_string(), Json::Array(pairs));
            Some(Json::Object(tagged))
        }
        StateValue::Record(fields) => {
            let mut object = JsonMap::new();
            for (k, v) in fields.borrow().iter() {
                if let Some(v) = encode_value(v, ancestors) {
                    object.insert(k.clone(), v);
                }
            }
            // A lone tag-like key would decode as a tagged value: wrap it.
            if object.len() == 1 && object.keys().all(|k| is_tag(k)) {
                let mut wrapper = JsonMap::new();
                wrapper.insert(RECORD_TAG.to_string(), Json::Object(object));
                Some(Json::Object(wrapper))
            } else {
                Some(Json::Object(object))
            }
        }
        scalar => Some(scalar.to_json()),
    };

    if let Some(addr) = addr {
        ancestors.remove(&addr);
    }
    encoded
}

/// Decode a tagged value produced by [`encode`].
pub fn decode(value: &Json) -> Result<StateValue> {
    match value {
        Json::Array(items) => Ok(StateValue::list(
            items.iter().map(decode).collect::<Result<Vec<_>>>()?,
        )),
        Json::Object(fields) if fields.len() == 1 => {
            let (key, inner) = fields.iter().next().ok_or_else(|| invalid("empty object"))?;
            match key.as_str() {
                DATE_TAG => {
                    let text = inner.as_str().ok_or_else(|| invalid("$date must be a string"))?;
                    let date = DateTime::parse_from_rfc3339(text)
                        .map_err(|e| invalid(&format!("bad $date '{}': {}", text, e)))?;
                    Ok(StateValue::Date(date.with_timezone(&Utc)))
                }
                SET_TAG => {
                    let members = inner.as_array().ok_or_else(|| invalid("$set must be an array"))?;
                    Ok(StateValue::set(
                        members.iter().map(decode).collect::<Result<Vec<_>>>()?,
                    ))
                }
                MAP_TAG => {
                    let pairs = inner.as_array().ok_or_else(|| invalid("$map must be an array"))?;
                    let mut entries = Vec::with_capacity(pairs.len());
                    for pair in pairs {
                        match pair.as_array().map(Vec::as_slice) {
                            Some([k, v]) => entries.push((decode(k)?, decode(v)?)),
                            _ => return Err(invalid("$map entries must be [key, value] pairs")),
                        }
                    }
                    Ok(StateValue::map(entries))
                }
                RECORD_TAG => {
                    let object = inner
                        .as_object()
                        .ok_or_else(|| invalid("$record must be an object"))?;
                    decode_record(object)
                }
                _ => decode_record(fields),
            }
        }
        Json::Object(fields) => decode_record(fields),
        scalar => Ok(StateValue::from_json(scalar)),
    }
}

fn decode_record(fields: &JsonMap<String, Json>) -> Result<StateValue> {
    let mut decoded = Vec::with_capacity(fields.len());
    for (k, v) in fields {
        decoded.push((k.clone(), decode(v)?));
    }
    Ok(StateValue::record(decoded))
}

fn invalid(reason: &str) -> PomoflowError {
    PomoflowError::Validation {
        reason: format!("snapshot encoding: {}", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_tagged_values_decode_to_same_shape() {
        let value = StateValue::record([
            (
                "due",
                StateValue::Date(Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap()),
            ),
            ("tags", StateValue::set([StateValue::text("home")])),
            (
                "byWeek",
                StateValue::map([(StateValue::Number(12.0), StateValue::text("sprint"))]),
            ),
            ("plain", StateValue::list([StateValue::Bool(true)])),
        ]);

        let decoded = decode(&encode(&value)).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_record_with_tag_like_key_survives() {
        let value = StateValue::record([("$set", StateValue::text("literal"))]);
        let encoded = encode(&value);
        assert_eq!(encoded, json!({"$record": {"$set": "literal"}}));
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn test_malformed_date_is_rejected() {
        let result = decode(&json!({"$date": "yesterday"}));
        assert!(matches!(result, Err(PomoflowError::Validation { .. })));
    }
}
