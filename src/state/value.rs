//! Dynamic application state graph.
//!
//! The live store keeps tasks, projects and settings as a [`StateValue`] tree.
//! Container nodes are reference counted so the graph can alias and cycle,
//! which is why snapshots go through [`StateValue::deep_clone`] instead of
//! the derived (shallow) `Clone`.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map as JsonMap, Number, Value as Json};

/// Shared, interior-mutable container node.
pub type Node<T> = Rc<RefCell<T>>;

/// Opaque function value carried in state; never copied into snapshots.
pub type Callable = Rc<dyn Fn(&[StateValue]) -> StateValue>;

/// A value in the application state graph.
///
/// `Clone` copies handles: both values point at the same container nodes.
#[derive(Clone)]
pub enum StateValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Date(DateTime<Utc>),
    /// Ordered sequence.
    List(Node<Vec<StateValue>>),
    /// String-keyed object.
    Record(Node<BTreeMap<String, StateValue>>),
    /// Arbitrary-keyed container, insertion ordered.
    Map(Node<Vec<(StateValue, StateValue)>>),
    /// Unordered collection of distinct members.
    Set(Node<Vec<StateValue>>),
    Callable(Callable),
}

impl Default for StateValue {
    fn default() -> Self {
        StateValue::Null
    }
}

fn node<T>(value: T) -> Node<T> {
    Rc::new(RefCell::new(value))
}

impl StateValue {
    pub fn text(value: impl Into<String>) -> Self {
        StateValue::Text(value.into())
    }

    pub fn list(items: impl IntoIterator<Item = StateValue>) -> Self {
        StateValue::List(node(items.into_iter().collect()))
    }

    pub fn record<K: Into<String>>(fields: impl IntoIterator<Item = (K, StateValue)>) -> Self {
        StateValue::Record(node(
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn map(entries: impl IntoIterator<Item = (StateValue, StateValue)>) -> Self {
        StateValue::Map(node(entries.into_iter().collect()))
    }

    /// Build a set, dropping members structurally equal to an earlier one.
    pub fn set(members: impl IntoIterator<Item = StateValue>) -> Self {
        let mut distinct: Vec<StateValue> = Vec::new();
        for member in members {
            if !distinct.iter().any(|existing| existing == &member) {
                distinct.push(member);
            }
        }
        StateValue::Set(node(distinct))
    }

    pub fn callable(f: impl Fn(&[StateValue]) -> StateValue + 'static) -> Self {
        StateValue::Callable(Rc::new(f))
    }

    /// Short name of the variant, used in validation messages.
    pub fn kind(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::Bool(_) => "bool",
            StateValue::Number(_) => "number",
            StateValue::Text(_) => "text",
            StateValue::Date(_) => "date",
            StateValue::List(_) => "list",
            StateValue::Record(_) => "record",
            StateValue::Map(_) => "map",
            StateValue::Set(_) => "set",
            StateValue::Callable(_) => "callable",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Node<BTreeMap<String, StateValue>>> {
        match self {
            StateValue::Record(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Node<Vec<StateValue>>> {
        match self {
            StateValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Field lookup on a record. Returns a handle sharing the field's nodes.
    pub fn get(&self, key: &str) -> Option<StateValue> {
        self.as_record()
            .and_then(|fields| fields.borrow().get(key).cloned())
    }

    /// Set a field on a record. Returns false if `self` is not a record.
    pub fn set_field(&self, key: impl Into<String>, value: StateValue) -> bool {
        match self.as_record() {
            Some(fields) => {
                fields.borrow_mut().insert(key.into(), value);
                true
            }
            None => false,
        }
    }

    /// Address of the container node, used as identity for cycle tracking.
    pub(crate) fn node_addr(&self) -> Option<usize> {
        match self {
            StateValue::List(n) | StateValue::Set(n) => Some(Rc::as_ptr(n) as *const () as usize),
            StateValue::Record(n) => Some(Rc::as_ptr(n) as *const () as usize),
            StateValue::Map(n) => Some(Rc::as_ptr(n) as *const () as usize),
            _ => None,
        }
    }

    /// Structural deep copy.
    ///
    /// Every container node is copied exactly once; aliasing and cycles in the
    /// source are reproduced in the copy. Callables are skipped: they are
    /// dropped from containers, and a callable root copies to `Null`.
    pub fn deep_clone(&self) -> StateValue {
        let mut copies: HashMap<usize, StateValue> = HashMap::new();
        clone_value(self, &mut copies).unwrap_or(StateValue::Null)
    }

    /// Structural equality that terminates on cyclic graphs.
    pub fn structural_eq(&self, other: &StateValue) -> bool {
        let mut assumed: HashSet<(usize, usize)> = HashSet::new();
        eq_value(self, other, &mut assumed)
    }

    /// Plain JSON view: dates become RFC 3339 strings, sets become arrays,
    /// maps with text keys become objects. Back-edges of cycles become `null`.
    pub fn to_json(&self) -> Json {
        let mut ancestors: HashSet<usize> = HashSet::new();
        to_json_value(self, &mut ancestors).unwrap_or(Json::Null)
    }

    /// Build a tree from plain JSON. Objects become records, arrays lists.
    pub fn from_json(value: &Json) -> StateValue {
        match value {
            Json::Null => StateValue::Null,
            Json::Bool(b) => StateValue::Bool(*b),
            Json::Number(n) => StateValue::Number(n.as_f64().unwrap_or(0.0)),
            Json::String(s) => StateValue::Text(s.clone()),
            Json::Array(items) => StateValue::list(items.iter().map(StateValue::from_json)),
            Json::Object(fields) => StateValue::record(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), StateValue::from_json(v))),
            ),
        }
    }
}

fn clone_value(value: &StateValue, copies: &mut HashMap<usize, StateValue>) -> Option<StateValue> {
    if let Some(addr) = value.node_addr() {
        if let Some(existing) = copies.get(&addr) {
            return Some(existing.clone());
        }
    }

    match value {
        StateValue::Null => Some(StateValue::Null),
        StateValue::Bool(b) => Some(StateValue::Bool(*b)),
        StateValue::Number(n) => Some(StateValue::Number(*n)),
        StateValue::Text(s) => Some(StateValue::Text(s.clone())),
        StateValue::Date(d) => Some(StateValue::Date(*d)),
        StateValue::Callable(_) => None,
        StateValue::List(source) => {
            let target = node(Vec::new());
            copies.insert(
                Rc::as_ptr(source) as *const () as usize,
                StateValue::List(target.clone()),
            );
            let items: Vec<StateValue> = source
                .borrow()
                .iter()
                .filter_map(|item| clone_value(item, copies))
                .collect();
            *target.borrow_mut() = items;
            Some(StateValue::List(target))
        }
        StateValue::Set(source) => {
            let target = node(Vec::new());
            copies.insert(
                Rc::as_ptr(source) as *const () as usize,
                StateValue::Set(target.clone()),
            );
            let members: Vec<StateValue> = source
                .borrow()
                .iter()
                .filter_map(|member| clone_value(member, copies))
                .collect();
            *target.borrow_mut() = members;
            Some(StateValue::Set(target))
        }
        StateValue::Record(source) => {
            let target = node(BTreeMap::new());
            copies.insert(
                Rc::as_ptr(source) as *const () as usize,
                StateValue::Record(target.clone()),
            );
            let fields: BTreeMap<String, StateValue> = source
                .borrow()
                .iter()
                .filter_map(|(k, v)| clone_value(v, copies).map(|v| (k.clone(), v)))
                .collect();
            *target.borrow_mut() = fields;
            Some(StateValue::Record(target))
        }
        StateValue::Map(source) => {
            let target = node(Vec::new());
            copies.insert(
                Rc::as_ptr(source) as *const () as usize,
                StateValue::Map(target.clone()),
            );
            let entries: Vec<(StateValue, StateValue)> = source
                .borrow()
                .iter()
                .filter_map(|(k, v)| {
                    let key = clone_value(k, copies)?;
                    let value = clone_value(v, copies)?;
                    Some((key, value))
                })
                .collect();
            *target.borrow_mut() = entries;
            Some(StateValue::Map(target))
        }
    }
}

fn eq_value(a: &StateValue, b: &StateValue, assumed: &mut HashSet<(usize, usize)>) -> bool {
    if let (Some(pa), Some(pb)) = (a.node_addr(), b.node_addr()) {
        if pa == pb || !assumed.insert((pa, pb)) {
            return true;
        }
    }

    match (a, b) {
        (StateValue::Null, StateValue::Null) => true,
        (StateValue::Bool(x), StateValue::Bool(y)) => x == y,
        (StateValue::Number(x), StateValue::Number(y)) => x == y || (x.is_nan() && y.is_nan()),
        (StateValue::Text(x), StateValue::Text(y)) => x == y,
        (StateValue::Date(x), StateValue::Date(y)) => x == y,
        (StateValue::Callable(x), StateValue::Callable(y)) => Rc::ptr_eq(x, y),
        (StateValue::List(x), StateValue::List(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| eq_value(l, r, assumed))
        }
        (StateValue::Record(x), StateValue::Record(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter().all(|(k, l)| match y.get(k) {
                    Some(r) => eq_value(l, r, assumed),
                    None => false,
                })
        }
        (StateValue::Map(x), StateValue::Map(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter().zip(y.iter()).all(|((lk, lv), (rk, rv))| {
                    eq_value(lk, rk, assumed) && eq_value(lv, rv, assumed)
                })
        }
        (StateValue::Set(x), StateValue::Set(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter().all(|l| {
                    y.iter().any(|r| {
                        let mut trial = assumed.clone();
                        eq_value(l, r, &mut trial)
                    })
                })
        }
        _ => false,
    }
}

fn number_to_json(n: f64) -> Json {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Json::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Json::Number).unwrap_or(Json::Null)
    }
}

fn to_json_value(value: &StateValue, ancestors: &mut HashSet<usize>) -> Option<Json> {
    let addr = value.node_addr();
    if let Some(addr) = addr {
        if !ancestors.insert(addr) {
            return Some(Json::Null);
        }
    }

    let result = match value {
        StateValue::Null => Some(Json::Null),
        StateValue::Bool(b) => Some(Json::Bool(*b)),
        StateValue::Number(n) => Some(number_to_json(*n)),
        StateValue::Text(s) => Some(Json::String(s.clone())),
        StateValue::Date(d) => Some(Json::String(d.to_rfc3339_opts(SecondsFormat::Millis, true))),
        StateValue::Callable(_) => None,
        StateValue::List(items) | StateValue::Set(items) => Some(Json::Array(
            items
                .borrow()
                .iter()
                .filter_map(|item| to_json_value(item, ancestors))
                .collect(),
        )),
        StateValue::Record(fields) => {
            let mut object = JsonMap::new();
            for (k, v) in fields.borrow().iter() {
                if let Some(v) = to_json_value(v, ancestors) {
                    object.insert(k.clone(), v);
                }
            }
            Some(Json::Object(object))
        }
        StateValue::Map(entries) => {
            let entries = entries.borrow();
            if entries.iter().all(|(k, _)| k.as_str().is_some()) {
                let mut object = JsonMap::new();
                for (k, v) in entries.iter() {
                    if let (Some(k), Some(v)) = (k.as_str(), to_json_value(v, ancestors)) {
                        object.insert(k.to_string(), v);
                    }
                }
                Some(Json::Object(object))
            } else {
                Some(Json::Array(
                    entries
                        .iter()
                        .filter_map(|(k, v)| {
                            let k = to_json_value(k, ancestors)?;
                            let v = to_json_value(v, ancestors)?;
                            Some(Json::Array(vec![k, v]))
                        })
                        .collect(),
                ))
            }
        }
    };

    if let Some(addr) = addr {
        ancestors.remove(&addr);
    }
    result
}

impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        self.structural_eq(other)
    }
}

impl fmt::Debug for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        let mut ancestors = HashSet::new();
        debug_into(self, &mut out, &mut ancestors);
        f.write_str(&out)
    }
}

fn debug_into(value: &StateValue, out: &mut String, ancestors: &mut HashSet<usize>) {
    use std::fmt::Write;

    let addr = value.node_addr();
    if let Some(addr) = addr {
        if !ancestors.insert(addr) {
            out.push_str("<cycle>");
            return;
        }
    }

    match value {
        StateValue::Null => out.push_str("null"),
        StateValue::Bool(b) => {
            let _ = write!(out, "{}", b);
        }
        StateValue::Number(n) => {
            let _ = write!(out, "{}", n);
        }
        StateValue::Text(s) => {
            let _ = write!(out, "{:?}", s);
        }
        StateValue::Date(d) => {
            let _ = write!(out, "Date({})", d.to_rfc3339());
        }
        StateValue::Callable(_) => out.push_str("<callable>"),
        StateValue::List(items) | StateValue::Set(items) => {
            out.push_str(if matches!(value, StateValue::Set(_)) { "Set[" } else { "[" });
            for (i, item) in items.borrow().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                debug_into(item, out, ancestors);
            }
            out.push(']');
        }
        StateValue::Record(fields) => {
            out.push('{');
            for (i, (k, v)) in fields.borrow().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}: ", k);
                debug_into(v, out, ancestors);
            }
            out.push('}');
        }
        StateValue::Map(entries) => {
            out.push_str("Map{");
            for (i, (k, v)) in entries.borrow().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                debug_into(k, out, ancestors);
                out.push_str(" => ");
                debug_into(v, out, ancestors);
            }
            out.push('}');
        }
    }

    if let Some(addr) = addr {
        ancestors.remove(&addr);
    }
}
