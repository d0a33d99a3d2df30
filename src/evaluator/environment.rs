use std::collections::{BTreeMap, HashMap, HashSet};

use crate::ast::Value;

/// Stack of scope frames, innermost last. Frame 0 is the persistent global frame.
///
/// A binding holds the value it was given, not a copy of it. A parameter or `LET` variable
/// initialised from another variable is the same node, and `SETF` on either is seen by both.
#[derive(Debug, Clone)]
pub struct Environment {
    frames: Vec<HashMap<String, Value>>,
    constants: HashSet<String>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        Environment {
            frames: vec![HashMap::new()],
            constants: HashSet::new(),
        }
    }

    pub fn push(&mut self) {
        self.frames.push(HashMap::new());
    }

    /// Push a frame holding `bindings`.
    pub fn push_with(&mut self, bindings: impl IntoIterator<Item = (String, Value)>) {
        self.push();
        for (name, value) in bindings {
            self.define(name, &value);
        }
    }

    /// Pop the innermost frame. The global frame is never popped.
    pub fn pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    /// Number of active frames, the global frame included
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Bind `name` in the innermost frame to `value`.
    pub fn define(&mut self, name: String, value: &Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name, value.clone());
        }
    }

    /// Bind `name` in the global frame to `value`.
    pub fn define_global(&mut self, name: String, value: &Value) {
        if let Some(frame) = self.frames.first_mut() {
            frame.insert(name, value.clone());
        }
    }

    /// The place bound to `name`, searching innermost to outermost.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(name))
            .cloned()
    }

    /// Like [`Environment::lookup`], but an absent name is created as `NIL` in the
    /// innermost frame.
    pub fn lookup_or_create(&mut self, name: &str) -> Value {
        if let Some(place) = self.lookup(name) {
            return place;
        }
        let place = Value::nil();
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_owned(), place.clone());
        }
        place
    }

    pub fn mark_constant(&mut self, name: &str) {
        self.constants.insert(name.to_owned());
    }

    pub fn is_constant(&self, name: &str) -> bool {
        self.constants.contains(name)
    }

    /// Rendered value of every visible variable; an inner binding shadows outer ones.
    pub fn visible_bindings(&self) -> BTreeMap<String, String> {
        let mut visible = BTreeMap::new();
        for frame in self.frames.iter().rev() {
            for (name, value) in frame {
                visible
                    .entry(name.clone())
                    .or_insert_with(|| value.to_string());
            }
        }
        visible
    }

    /// Get all visible bindings, sorted by name
    pub fn get_all_bindings(&self) -> Vec<(String, Value)> {
        let mut bindings: HashMap<&str, &Value> = HashMap::new();
        for frame in &self.frames {
            for (name, value) in frame {
                bindings.insert(name, value);
            }
        }
        let mut result: Vec<_> = bindings
            .into_iter()
            .map(|(name, value)| (name.to_owned(), value.clone()))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }

    /// Drop every binding and constant, leaving a single empty global frame.
    pub fn reset(&mut self) {
        *self = Environment::new();
    }
}
