//! Live task store and the mutation facade the sync engine drives.

pub mod task_store;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value as Json;

use crate::error::Result;

pub use task_store::{StoreChange, TaskStore};

/// Key under which settings are persisted.
pub const SETTINGS_KEY: &str = "settings";

/// Item fields consulted for modification time, in any order.
const TIMESTAMP_FIELDS: [&str; 4] = ["updatedAt", "updated_at", "createdAt", "created_at"];

/// A keyed collection of items in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Tasks,
    Projects,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Tasks, Collection::Projects];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Tasks => "tasks",
            Collection::Projects => "projects",
        }
    }

    /// Persistence key of one item.
    pub fn key(&self, id: &str) -> String {
        format!("{}/{}", self.as_str(), id)
    }

    /// Split a persistence key into its collection and item id.
    pub fn parse_key(key: &str) -> Option<(Collection, &str)> {
        let (prefix, id) = key.split_once('/')?;
        let collection = Collection::ALL.into_iter().find(|c| c.as_str() == prefix)?;
        (!id.is_empty()).then_some((collection, id))
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mutation surface the sync coordinator reads and writes through.
///
/// Items are opaque JSON objects; only `id` and the timestamp fields are
/// interpreted.
pub trait DomainFacade {
    fn items(&self, collection: Collection) -> Vec<Json>;

    fn settings(&self) -> Json;

    fn create_item(&self, collection: Collection, item: Json) -> Result<()>;

    /// Shallow-merge `fields` into the item.
    fn update_item(&self, collection: Collection, id: &str, fields: Json) -> Result<()>;

    fn delete_item(&self, collection: Collection, id: &str) -> Result<()>;
}

/// An item's id. Numeric ids are rendered in their integer form.
pub fn item_id(item: &Json) -> Option<String> {
    match item.get("id")? {
        Json::String(s) if !s.is_empty() => Some(s.clone()),
        Json::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => Some(i.to_string()),
            (None, Some(u)) => Some(u.to_string()),
            _ => n.as_f64().map(number_id),
        },
        _ => None,
    }
}

/// Render a numeric id so `1`, `1.0` and `1e0` are the same key.
pub(crate) fn number_id(n: f64) -> String {
    // Beyond 2^53 a float no longer holds every integer.
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Parse a timestamp field: an RFC 3339 string or epoch milliseconds.
pub fn parse_timestamp(value: &Json) -> Option<DateTime<Utc>> {
    match value {
        Json::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        Json::Number(n) => {
            let ms = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(ms).single()
        }
        _ => None,
    }
}

/// Latest of an item's modification and creation times.
pub fn item_timestamp(item: &Json) -> Option<DateTime<Utc>> {
    TIMESTAMP_FIELDS
        .iter()
        .filter_map(|field| item.get(*field).and_then(parse_timestamp))
        .max()
}

/// Latest modification across every item of every collection.
pub fn latest_modification(facade: &dyn DomainFacade) -> Option<DateTime<Utc>> {
    Collection::ALL
        .iter()
        .flat_map(|c| facade.items(*c))
        .filter_map(|item| item_timestamp(&item))
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn test_parse_key() {
        assert_eq!(Collection::parse_key("tasks/abc"), Some((Collection::Tasks, "abc")));
        assert_eq!(
            Collection::parse_key("projects/a/b"),
            Some((Collection::Projects, "a/b"))
        );
        assert_eq!(Collection::parse_key("settings"), None);
        assert_eq!(Collection::parse_key("tasks/"), None);
        assert_eq!(Collection::parse_key("notes/1"), None);
    }

    #[test_case(json!({"id": "t1"}), Some("t1") ; "string id")]
    #[test_case(json!({"id": 42}), Some("42") ; "numeric id")]
    #[test_case(json!({"id": 1.0}), Some("1") ; "integral float id")]
    #[test_case(json!({"id": 2.5}), Some("2.5") ; "fractional id")]
    #[test_case(json!({"id": ""}), None ; "empty id")]
    #[test_case(json!({"name": "x"}), None ; "missing id")]
    fn test_item_id(item: Json, expected: Option<&str>) {
        assert_eq!(item_id(&item).as_deref(), expected);
    }

    #[test_case(json!({"updatedAt": "2024-03-01T10:00:00Z"}), 1709287200000 ; "camel case rfc3339")]
    #[test_case(json!({"updated_at": 1709287200000i64}), 1709287200000 ; "snake case epoch ms")]
    #[test_case(json!({"createdAt": "2024-03-01T10:00:00Z", "updatedAt": "2024-03-01T10:00:01Z"}), 1709287201000 ; "latest field wins")]
    fn test_item_timestamp(item: Json, expected_ms: i64) {
        assert_eq!(item_timestamp(&item).map(|t| t.timestamp_millis()), Some(expected_ms));
    }

    #[test]
    fn test_item_without_timestamps() {
        assert!(item_timestamp(&json!({"id": "1", "updatedAt": "soon"})).is_none());
    }
}
