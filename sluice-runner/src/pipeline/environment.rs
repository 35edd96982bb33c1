//! Environment exported into the box before any step runs

use chrono::{DateTime, Utc};
use sluice_core::Environment;
use std::collections::BTreeMap;

use crate::layout::{GUEST_CACHE_DIR, Layout};

/// Variables every pipeline starts with
pub fn base_environment(layout: &Layout, started_by: &str, started_at: DateTime<Utc>) -> Environment {
    let kind = layout.kind();
    let source = layout.guest_source_dir();

    let mut env = Environment::default();
    env.update([
        ("WERCKER", "true".to_string()),
        (kind.flag_env_key(), "true".to_string()),
        ("CI", "true".to_string()),
        (kind.id_env_key(), layout.run_id().to_string()),
        ("WERCKER_ROOT", source.clone()),
        ("WERCKER_SOURCE_DIR", source),
        ("WERCKER_CACHE_DIR", GUEST_CACHE_DIR.to_string()),
        ("WERCKER_OUTPUT_DIR", layout.guest_output_dir()),
        ("WERCKER_PIPELINE_DIR", layout.guest_root().to_string()),
        ("WERCKER_REPORT_DIR", layout.guest_report_dir()),
        ("WERCKER_APPLICATION_ID", layout.application_id().to_string()),
        ("WERCKER_STARTED_BY", started_by.to_string()),
        ("WERCKER_MAIN_PIPELINE_STARTED", started_at.timestamp().to_string()),
    ]);
    env
}

/// Base variables, then the definition's own, then operator pass-through
///
/// Definition values may reference base variables. Hidden pass-through
/// variables stay in the hidden set so they are exported with logs hidden.
pub fn pipeline_environment(
    base: Environment,
    definition_env: &BTreeMap<String, String>,
    operator: &Environment,
) -> Environment {
    let mut env = base;

    for (key, value) in definition_env {
        let value = env.interpolate(value);
        env.add(key.clone(), value);
    }
    for (key, value) in operator.get_passthru().ordered() {
        env.add(key, value);
    }
    for (key, value) in operator.get_hidden_passthru().ordered() {
        env.add_hidden(key, value);
    }

    env
}
