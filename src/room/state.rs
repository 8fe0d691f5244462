//! Canonical window state and the delta merge engine.
//!
//! A room's shared state is a flat map of window records keyed by window id,
//! plus a monotonic version counter. Clients propose mutations as deltas
//! (add/remove/update batches); [`CanonicalState::apply`] folds a delta into
//! the state deterministically, so peers that eventually see every delta
//! converge on the same window set regardless of arrival order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One window's shared attributes.
///
/// `id` is the stable key within a room and never changes once the window
/// exists. Every other field is freely replaceable by any peer's update
/// (last-writer-wins per field). Geometry fields are optional so the same
/// type serves both full records (`add`) and partial records (`update`);
/// absent fields are omitted on the wire and in the persisted blob, so an
/// upserted partial record round-trips with exactly the fields it was given.
///
/// Anything beyond the known fields lands in the flattened property bag.
/// Bag values are replaced wholesale on update, never deep-merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    /// Stable unique key, assigned by the originating client.
    pub id: String,
    /// Tag naming the window kind (e.g. "terminal").
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h: Option<i64>,
    /// Open-ended bag of additional named fields.
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

impl WindowState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: None,
            x: None,
            y: None,
            w: None,
            h: None,
            props: Map::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_pos(mut self, x: i64, y: i64) -> Self {
        self.x = Some(x);
        self.y = Some(y);
        self
    }

    pub fn with_size(mut self, w: i64, h: i64) -> Self {
        self.w = Some(w);
        self.h = Some(h);
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    /// Shallow-merge an update record over this one.
    ///
    /// Only fields present in `update` are touched; `id` is never replaced.
    /// Property-bag entries are overwritten as whole values.
    pub fn merge_from(&mut self, update: &WindowState) {
        if update.kind.is_some() {
            self.kind = update.kind.clone();
        }
        if update.x.is_some() {
            self.x = update.x;
        }
        if update.y.is_some() {
            self.y = update.y;
        }
        if update.w.is_some() {
            self.w = update.w;
        }
        if update.h.is_some() {
            self.h = update.h;
        }
        for (key, value) in &update.props {
            self.props.insert(key.clone(), value.clone());
        }
    }
}

/// A client-proposed mutation batch. Transient, never persisted.
///
/// A single delta may carry all three kinds of change; they are applied in
/// the fixed order add -> remove -> update so that within one delta a later
/// phase wins over an earlier one touching the same id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<WindowState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update: Vec<WindowState>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.update.is_empty()
    }
}

/// A room's full agreed-upon state: the window set plus a version counter.
///
/// `version` starts at 0 and increments by exactly one per applied delta,
/// empty deltas included; it acts as a logical clock, not a content hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalState {
    #[serde(default)]
    pub windows: BTreeMap<String, WindowState>,
    #[serde(default)]
    pub version: u64,
}

impl CanonicalState {
    /// Fold a delta into the state. Pure: same `(state, delta)` pair always
    /// yields the same next state.
    ///
    /// 1. `add`: insert/overwrite unconditionally. An add for an existing id
    ///    behaves like a full-record update, which keeps client logic simple.
    /// 2. `remove`: delete if present; removing a missing id is a no-op.
    /// 3. `update`: shallow-merge over an existing record, or upsert the
    ///    record as given when the id is missing.
    pub fn apply(mut self, delta: &StateDelta) -> CanonicalState {
        for win in &delta.add {
            self.windows.insert(win.id.clone(), win.clone());
        }
        for id in &delta.remove {
            self.windows.remove(id);
        }
        for win in &delta.update {
            match self.windows.get_mut(&win.id) {
                Some(existing) => existing.merge_from(win),
                None => {
                    self.windows.insert(win.id.clone(), win.clone());
                }
            }
        }
        self.version += 1;
        self
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn terminal(id: &str) -> WindowState {
        WindowState::new(id)
            .with_kind("terminal")
            .with_pos(0, 0)
            .with_size(80, 24)
    }

    fn add_delta(win: WindowState) -> StateDelta {
        StateDelta {
            add: vec![win],
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_scenario_chain() {
        let state = CanonicalState::default();

        let state = state.apply(&add_delta(terminal("w1")));
        assert_eq!(state.version, 1);
        assert_eq!(state.window_count(), 1);

        let update = StateDelta {
            update: vec![WindowState::new("w1").with_pos(10, 0)],
            ..Default::default()
        };
        let state = state.apply(&update);
        assert_eq!(state.version, 2);
        let w1 = &state.windows["w1"];
        assert_eq!(w1.x, Some(10));
        assert_eq!(w1.w, Some(80));
        assert_eq!(w1.kind.as_deref(), Some("terminal"));

        let remove = StateDelta {
            remove: vec!["w1".to_string()],
            ..Default::default()
        };
        let state = state.apply(&remove);
        assert_eq!(state.version, 3);
        assert_eq!(state.window_count(), 0);

        // Removing a missing id is a no-op, but version still ticks.
        let state = state.apply(&remove);
        assert_eq!(state.version, 4);
        assert_eq!(state.window_count(), 0);
    }

    #[test]
    fn test_add_then_remove_same_delta() {
        let delta = StateDelta {
            add: vec![terminal("w1")],
            remove: vec!["w1".to_string()],
            ..Default::default()
        };
        let state = CanonicalState::default().apply(&delta);
        assert!(!state.windows.contains_key("w1"));
        assert_eq!(state.version, 1);
    }

    #[test]
    fn test_remove_then_update_resurrects() {
        let state = CanonicalState::default().apply(&add_delta(terminal("w1")));
        let delta = StateDelta {
            remove: vec!["w1".to_string()],
            update: vec![WindowState::new("w1").with_pos(5, 0)],
            ..Default::default()
        };
        let state = state.apply(&delta);
        let w1 = &state.windows["w1"];
        assert_eq!(w1.x, Some(5));
        // Resurrected from the update record alone; the old geometry is gone.
        assert_eq!(w1.w, None);
    }

    #[test]
    fn test_update_upserts_exact_fields() {
        let delta = StateDelta {
            update: vec![WindowState::new("w9").with_pos(3, 4)],
            ..Default::default()
        };
        let state = CanonicalState::default().apply(&delta);
        let w9 = &state.windows["w9"];
        assert_eq!(w9.x, Some(3));
        assert_eq!(w9.y, Some(4));
        assert_eq!(w9.kind, None);
        assert_eq!(w9.w, None);
        assert_eq!(w9.h, None);

        // No default-filling on the wire either.
        let encoded = serde_json::to_value(w9).unwrap();
        assert_eq!(encoded, json!({"id": "w9", "x": 3, "y": 4}));
    }

    #[test]
    fn test_repeat_delta_idempotent_on_content() {
        let delta = StateDelta {
            add: vec![terminal("w1")],
            update: vec![WindowState::new("w2").with_pos(1, 2)],
            ..Default::default()
        };
        let once = CanonicalState::default().apply(&delta);
        let twice = once.clone().apply(&delta);
        assert_eq!(once.windows, twice.windows);
        assert_eq!(twice.version, once.version + 1);
    }

    #[test]
    fn test_disjoint_deltas_order_insensitive() {
        let a = add_delta(terminal("w1"));
        let b = StateDelta {
            update: vec![WindowState::new("w2").with_pos(7, 7)],
            ..Default::default()
        };
        let c = StateDelta {
            remove: vec!["w3".to_string()],
            ..Default::default()
        };

        let forward = CanonicalState::default().apply(&a).apply(&b).apply(&c);
        let backward = CanonicalState::default().apply(&c).apply(&b).apply(&a);
        let shuffled = CanonicalState::default().apply(&b).apply(&c).apply(&a);

        assert_eq!(forward.windows, backward.windows);
        assert_eq!(forward.windows, shuffled.windows);
        assert_eq!(forward.version, 3);
        assert_eq!(backward.version, 3);
    }

    #[test]
    fn test_empty_delta_bumps_version() {
        let delta = StateDelta::default();
        assert!(delta.is_empty());
        let state = CanonicalState::default().apply(&delta);
        assert_eq!(state.version, 1);
        assert_eq!(state.window_count(), 0);
    }

    #[test]
    fn test_merge_keeps_id_and_replaces_props_wholesale() {
        let mut win = terminal("w1").with_prop("theme", json!({"fg": "green", "bg": "black"}));

        // An update record with a mismatched id cannot rename the window.
        let mut update = WindowState::new("other").with_prop("theme", json!({"fg": "amber"}));
        update.kind = Some("editor".to_string());
        win.merge_from(&update);

        assert_eq!(win.id, "w1");
        assert_eq!(win.kind.as_deref(), Some("editor"));
        // Nested bag values are replaced as whole values, not deep-merged.
        assert_eq!(win.props["theme"], json!({"fg": "amber"}));
    }

    #[test]
    fn test_window_roundtrip_with_props() {
        let win = terminal("w1").with_prop("title", json!("htop"));
        let text = serde_json::to_string(&win).unwrap();
        let back: WindowState = serde_json::from_str(&text).unwrap();
        assert_eq!(win, back);

        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "terminal");
        assert_eq!(value["title"], "htop");
    }

    #[test]
    fn test_canonical_state_json_roundtrip() {
        let state = CanonicalState::default()
            .apply(&add_delta(terminal("w1")))
            .apply(&add_delta(terminal("w2")));
        let bytes = serde_json::to_vec(&state).unwrap();
        let back: CanonicalState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(state, back);
    }
}
