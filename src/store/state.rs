//! The shared workflow blackboard.
//!
//! One `WorkflowState` exists per invocation. The controller and every task
//! unit communicate exclusively through it: sequential steps observe each
//! predecessor's committed writes, concurrent fan-out units write disjoint
//! keys, and the append-only slots (evidence registry, audit trail) serialize
//! through the interior lock so an append plus its counter increment is one
//! indivisible step.

use crate::errors::StoreError;
use crate::store::{KeyValueStore, MemoryStore, keys};
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Shared, lock-protected workflow state.
pub struct WorkflowState {
    inner: Mutex<Box<dyn KeyValueStore>>,
}

/// Current UTC time, second precision, as stored in audit events and facts.
pub(crate) fn utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Required keys and their documented defaults.
fn default_slots() -> Vec<(&'static str, Value)> {
    vec![
        (keys::EVIDENCE_REGISTRY, json!([])),
        (keys::EVIDENCE_SEQUENCES, json!({})),
        (keys::PERSONA_ANALYSES, json!([])),
        (keys::NULL_HYPOTHESES, json!([])),
        (keys::NULL_HYPOTHESES_RESULT, json!({})),
        (keys::RESEARCH_OBJECTIVES, json!([])),
        (keys::ADJUDICATIONS, json!({})),
        (keys::AUDIT_TRAIL, json!([])),
    ]
}

/// Coerce a list slot to an array where a documented safe coercion exists.
///
/// Returns the (possibly rewritten) value and a note describing the coercion,
/// `None` when the value was already conformant.
fn coerce_list_slot(key: &str, value: Value) -> (Value, Option<String>) {
    match value {
        Value::Array(_) => (value, None),
        Value::Object(map) => {
            if let Some(inner) = map.get(key) {
                if inner.is_array() {
                    return (
                        inner.clone(),
                        Some(format!("unwrapped single-field wrapper object around '{key}'")),
                    );
                }
            }
            (
                json!([]),
                Some(format!("replaced non-list object in '{key}' with empty list")),
            )
        }
        Value::Null => (json!([]), Some(format!("replaced null in '{key}' with empty list"))),
        other => (
            json!([other]),
            Some(format!("wrapped scalar value in '{key}' into a one-element list")),
        ),
    }
}

/// Coerce a map slot to an object where a documented safe coercion exists.
fn coerce_map_slot(key: &str, value: Value) -> (Value, Option<String>) {
    match value {
        Value::Object(_) => (value, None),
        Value::Null => (json!({}), Some(format!("replaced null in '{key}' with empty map"))),
        other => (
            json!({}),
            Some(format!(
                "replaced non-object value in '{key}' with empty map (was: {other})"
            )),
        ),
    }
}

/// Which required keys are absent, using the richest capability the backend
/// offers: full enumeration, else canonical-map conversion, else per-key
/// probing. A missing capability never fails the whole check.
fn missing_required_keys(store: &dyn KeyValueStore) -> Vec<&'static str> {
    let required: Vec<&'static str> = default_slots().iter().map(|(k, _)| *k).collect();

    if let Some(present) = store.enumerate() {
        return required
            .into_iter()
            .filter(|k| !present.iter().any(|p| p.as_str() == *k))
            .collect();
    }
    if let Some(map) = store.as_map() {
        return required.into_iter().filter(|k| !map.contains_key(*k)).collect();
    }
    required.into_iter().filter(|k| !store.contains(k)).collect()
}

fn append_audit_locked(store: &mut dyn KeyValueStore, event: &str, fields: Map<String, Value>) {
    let mut entry = Map::new();
    entry.insert("timestamp".to_string(), json!(utc_timestamp()));
    entry.insert("event".to_string(), json!(event));
    entry.extend(fields);

    let current = store.get(keys::AUDIT_TRAIL).unwrap_or_else(|| json!([]));
    let (coerced, _) = coerce_list_slot(keys::AUDIT_TRAIL, current);
    match coerced {
        Value::Array(mut trail) => {
            trail.push(Value::Object(entry));
            store.set(keys::AUDIT_TRAIL, Value::Array(trail));
        }
        _ => warn!(event, "audit trail slot unusable, dropping audit event"),
    }
}

impl WorkflowState {
    pub fn new(store: Box<dyn KeyValueStore>) -> Self {
        Self {
            inner: Mutex::new(store),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()))
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn KeyValueStore>> {
        // A poisoned lock means a task panicked mid-write; the pipeline is
        // fail-open, so recover the guard rather than propagate the panic.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key)
    }

    pub fn set(&self, key: &str, value: Value) {
        self.lock().set(key, value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    /// Run a closure under the state lock. This is how the registry makes an
    /// append plus its sequence-counter increment indivisible.
    pub(crate) fn with_store<R>(&self, f: impl FnOnce(&mut dyn KeyValueStore) -> R) -> R {
        let mut guard = self.lock();
        f(guard.as_mut())
    }

    /// Idempotently backfill missing required keys and re-enforce slot type
    /// invariants. Existing values are never overwritten; wrapper objects
    /// around list slots are unwrapped with a structured warning recorded in
    /// the audit trail.
    pub fn initialize_defaults(&self) {
        let mut guard = self.lock();
        let store = guard.as_mut();

        let missing = missing_required_keys(store);
        for (key, default) in default_slots() {
            if missing.contains(&key) {
                debug!(key, "backfilling default state slot");
                store.set(key, default);
            }
        }

        let mut coercions: Vec<(&'static str, String)> = Vec::new();
        for key in keys::LIST_SLOTS {
            if let Some(value) = store.get(key) {
                let (coerced, note) = coerce_list_slot(key, value);
                if let Some(note) = note {
                    store.set(key, coerced);
                    coercions.push((key, note));
                }
            }
        }
        for key in keys::MAP_SLOTS {
            if let Some(value) = store.get(key) {
                let (coerced, note) = coerce_map_slot(key, value);
                if let Some(note) = note {
                    store.set(key, coerced);
                    coercions.push((key, note));
                }
            }
        }

        for (key, note) in coercions {
            warn!(slot = key, detail = %note, "coerced state slot");
            let mut fields = Map::new();
            fields.insert("slot".to_string(), json!(key));
            fields.insert("detail".to_string(), json!(note));
            append_audit_locked(store, "state_coercion", fields);
        }
    }

    /// Append an event to the audit trail. Best-effort: an unusable trail
    /// slot drops the event with a log, never an error.
    pub fn append_audit_event(&self, event: &str, fields: Map<String, Value>) {
        let mut guard = self.lock();
        append_audit_locked(guard.as_mut(), event, fields);
    }

    /// All audit events recorded so far, oldest first.
    pub fn audit_trail(&self) -> Vec<Value> {
        match self.get(keys::AUDIT_TRAIL) {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        }
    }

    /// Register a persona judgment: replaces any prior entry with the same
    /// `persona_id` in the analyses list, then appends an audit event.
    pub fn record_persona_judgment(&self, judgment: Value) -> Result<Value, StoreError> {
        let persona_id = judgment
            .get("persona_id")
            .and_then(Value::as_str)
            .ok_or(StoreError::MissingPersonaId)?
            .to_string();

        let mut guard = self.lock();
        let store = guard.as_mut();

        let current = store
            .get(keys::PERSONA_ANALYSES)
            .unwrap_or_else(|| json!([]));
        let (current, _) = coerce_list_slot(keys::PERSONA_ANALYSES, current);
        let mut entries = match current {
            Value::Array(entries) => entries,
            _ => Vec::new(),
        };
        entries.retain(|entry| {
            entry.get("persona_id").and_then(Value::as_str) != Some(persona_id.as_str())
        });
        entries.push(judgment.clone());
        store.set(keys::PERSONA_ANALYSES, Value::Array(entries));

        let mut fields = Map::new();
        fields.insert("persona_id".to_string(), json!(persona_id));
        append_audit_locked(store, "record_persona_judgment", fields);

        Ok(judgment)
    }

    /// Flat snapshot of the state document, keys sorted for stable output.
    ///
    /// Backends that can enumerate contribute every key they hold; otherwise
    /// the documented fixed key set is probed.
    pub fn snapshot(&self) -> Value {
        let guard = self.lock();
        let store = guard.as_ref();

        let key_list: Vec<String> = match store.enumerate() {
            Some(present) => present,
            None => default_slots()
                .iter()
                .map(|(k, _)| k.to_string())
                .chain(keys::PHASE_OUTPUTS.iter().map(|k| k.to_string()))
                .filter(|k| store.contains(k))
                .collect(),
        };

        let mut sorted: BTreeMap<String, Value> = BTreeMap::new();
        for key in key_list {
            if let Some(value) = store.get(&key) {
                sorted.insert(key, value);
            }
        }

        let mut doc = Map::new();
        for (key, value) in sorted {
            doc.insert(key, value);
        }
        Value::Object(doc)
    }

    /// Overlay a snapshot document onto the state, then backfill any keys the
    /// snapshot lacked with their documented defaults.
    pub fn restore(&self, snapshot: &Value) {
        if let Value::Object(entries) = snapshot {
            let mut guard = self.lock();
            let store = guard.as_mut();
            for (key, value) in entries {
                store.set(key, value.clone());
            }
        } else {
            warn!("snapshot is not an object, ignoring");
        }
        self.initialize_defaults();
    }

    /// Persist the snapshot to disk as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        let rendered =
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize state snapshot")?;
        std::fs::write(path, rendered)
            .with_context(|| format!("Failed to write state snapshot to {}", path.display()))?;
        Ok(())
    }

    /// Load a snapshot from disk, overlaying it onto the current state.
    pub fn load(&self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state snapshot from {}", path.display()))?;
        let snapshot: Value =
            serde_json::from_str(&raw).context("Failed to parse state snapshot")?;
        self.restore(&snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeyValueStore;
    use serde_json::json;
    use tempfile::tempdir;

    /// Adapter with no enumeration or map capability: only point lookups.
    struct ProbeOnlyStore(Map<String, Value>);

    impl KeyValueStore for ProbeOnlyStore {
        fn get(&self, key: &str) -> Option<Value> {
            self.0.get(key).cloned()
        }
        fn set(&mut self, key: &str, value: Value) {
            self.0.insert(key.to_string(), value);
        }
    }

    #[test]
    fn test_initialize_defaults_backfills_required_keys() {
        let state = WorkflowState::in_memory();
        state.initialize_defaults();
        assert_eq!(state.get(keys::EVIDENCE_REGISTRY), Some(json!([])));
        assert_eq!(state.get(keys::EVIDENCE_SEQUENCES), Some(json!({})));
        assert_eq!(state.get(keys::NULL_HYPOTHESES), Some(json!([])));
        assert_eq!(state.get(keys::ADJUDICATIONS), Some(json!({})));
    }

    #[test]
    fn test_initialize_defaults_is_noop_on_populated_store() {
        let state = WorkflowState::in_memory();
        state.set(keys::EVIDENCE_REGISTRY, json!([{"fact_id": "20250101-001"}]));
        state.set(keys::NULL_HYPOTHESES, json!([{"hypothesis_id": "NH-01"}]));
        state.initialize_defaults();
        let before = state.snapshot();
        state.initialize_defaults();
        assert_eq!(state.snapshot(), before);
        assert_eq!(
            state.get(keys::EVIDENCE_REGISTRY),
            Some(json!([{"fact_id": "20250101-001"}]))
        );
    }

    #[test]
    fn test_wrapper_object_unwraps_to_list() {
        let state = WorkflowState::in_memory();
        state.set(
            keys::NULL_HYPOTHESES,
            json!({"null_hypotheses": [{"hypothesis_id": "NH-01"}]}),
        );
        state.initialize_defaults();
        assert_eq!(
            state.get(keys::NULL_HYPOTHESES),
            Some(json!([{"hypothesis_id": "NH-01"}]))
        );
    }

    #[test]
    fn test_empty_object_coerces_to_empty_list() {
        let state = WorkflowState::in_memory();
        state.set(keys::NULL_HYPOTHESES, json!({}));
        state.initialize_defaults();
        assert_eq!(state.get(keys::NULL_HYPOTHESES), Some(json!([])));
    }

    #[test]
    fn test_coercion_records_audit_warning() {
        let state = WorkflowState::in_memory();
        state.set(keys::NULL_HYPOTHESES, json!({"null_hypotheses": []}));
        state.initialize_defaults();
        let trail = state.audit_trail();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0]["event"], json!("state_coercion"));
        assert_eq!(trail[0]["slot"], json!(keys::NULL_HYPOTHESES));
    }

    #[test]
    fn test_scalar_in_list_slot_wraps_without_loss() {
        let state = WorkflowState::in_memory();
        state.set(keys::RESEARCH_OBJECTIVES, json!("objective-1"));
        state.initialize_defaults();
        assert_eq!(
            state.get(keys::RESEARCH_OBJECTIVES),
            Some(json!(["objective-1"]))
        );
    }

    #[test]
    fn test_map_slot_coercion() {
        let state = WorkflowState::in_memory();
        state.set(keys::ADJUDICATIONS, json!([1, 2]));
        state.initialize_defaults();
        assert_eq!(state.get(keys::ADJUDICATIONS), Some(json!({})));
        assert!(!state.audit_trail().is_empty());
    }

    #[test]
    fn test_probe_only_adapter_initializes() {
        let state = WorkflowState::new(Box::new(ProbeOnlyStore(Map::new())));
        state.initialize_defaults();
        assert_eq!(state.get(keys::EVIDENCE_REGISTRY), Some(json!([])));
        assert_eq!(state.get(keys::AUDIT_TRAIL), Some(json!([])));
    }

    #[test]
    fn test_probe_only_adapter_preserves_existing_values() {
        let mut seed = Map::new();
        seed.insert(keys::EVIDENCE_REGISTRY.to_string(), json!([{"fact_id": "x"}]));
        let state = WorkflowState::new(Box::new(ProbeOnlyStore(seed)));
        state.initialize_defaults();
        assert_eq!(
            state.get(keys::EVIDENCE_REGISTRY),
            Some(json!([{"fact_id": "x"}]))
        );
    }

    #[test]
    fn test_audit_event_append_order() {
        let state = WorkflowState::in_memory();
        state.initialize_defaults();
        let mut first = Map::new();
        first.insert("n".to_string(), json!(1));
        state.append_audit_event("first", first);
        let mut second = Map::new();
        second.insert("n".to_string(), json!(2));
        state.append_audit_event("second", second);

        let trail = state.audit_trail();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0]["event"], json!("first"));
        assert_eq!(trail[1]["event"], json!("second"));
        assert!(trail[0]["timestamp"].is_string());
    }

    #[test]
    fn test_record_persona_judgment_replaces_by_id() {
        let state = WorkflowState::in_memory();
        state.initialize_defaults();
        state
            .record_persona_judgment(json!({"persona_id": "a", "answer": "first"}))
            .unwrap();
        state
            .record_persona_judgment(json!({"persona_id": "b", "answer": "other"}))
            .unwrap();
        state
            .record_persona_judgment(json!({"persona_id": "a", "answer": "revised"}))
            .unwrap();

        let analyses = state.get(keys::PERSONA_ANALYSES).unwrap();
        let entries = analyses.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        // Replacement moves the entry to the end; "b" keeps its position.
        assert_eq!(entries[0]["persona_id"], json!("b"));
        assert_eq!(entries[1]["answer"], json!("revised"));
    }

    #[test]
    fn test_record_persona_judgment_requires_id() {
        let state = WorkflowState::in_memory();
        state.initialize_defaults();
        let err = state
            .record_persona_judgment(json!({"answer": "no id"}))
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingPersonaId));
    }

    #[test]
    fn test_snapshot_save_load_round_trips_byte_for_byte() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let state = WorkflowState::in_memory();
        state.initialize_defaults();
        state.set(
            keys::EVIDENCE_REGISTRY,
            json!([{"fact_id": "20250115-001", "statement": "s"}]),
        );
        state.set(keys::EVIDENCE_SEQUENCES, json!({"20250115": 2}));
        state.append_audit_event("register_evidence", Map::new());
        state.save(&path).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();

        let restored = WorkflowState::in_memory();
        restored.load(&path).unwrap();
        let second_path = dir.path().join("state2.json");
        restored.save(&second_path).unwrap();
        let second = std::fs::read_to_string(&second_path).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_load_backfills_absent_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"evidence_registry": [{"fact_id": "f"}]}"#).unwrap();

        let state = WorkflowState::in_memory();
        state.load(&path).unwrap();
        assert_eq!(
            state.get(keys::EVIDENCE_REGISTRY),
            Some(json!([{"fact_id": "f"}]))
        );
        // Keys absent from the snapshot re-acquire defaults.
        assert_eq!(state.get(keys::EVIDENCE_SEQUENCES), Some(json!({})));
        assert_eq!(state.get(keys::PERSONA_ANALYSES), Some(json!([])));
    }
}
