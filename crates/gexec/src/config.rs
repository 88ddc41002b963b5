use std::env;

use serde::{Deserialize, Serialize};

use crate::spec::{MemoryKind, RuntimeError, RuntimeResult};

/// Deployment-wide runtime switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    pub device_id: u32,
    /// Allocate persistent scratch from a per-(session, device, kind) expandable pool.
    pub session_pooled_allocator: bool,
    /// Subtract a graph's zero-copy bytes from its memory requirement.
    pub zero_copy_reuse: bool,
    /// Kinds the deployment mandates a persistent-priority region for.
    pub persistent_priority_kinds: Vec<MemoryKind>,
    /// Trim idle cached blocks before reporting memory exhaustion.
    pub trim_on_exhaustion: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            device_id: 0,
            session_pooled_allocator: false,
            zero_copy_reuse: false,
            persistent_priority_kinds: Vec::new(),
            trim_on_exhaustion: true,
        }
    }
}

impl RuntimeOptions {
    /// Defaults overlaid with `GEXEC_*` environment variables.
    pub fn from_env() -> RuntimeResult<Self> {
        Self::default().overlay(|key| env::var(key).ok())
    }

    pub fn from_json(text: &str) -> RuntimeResult<Self> {
        serde_json::from_str(text)
            .map_err(|err| RuntimeError::parameter(format!("invalid runtime options: {err}")))
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> RuntimeResult<Self> {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(raw) = value("GEXEC_DEVICE_ID") {
            self.device_id = raw.trim().parse().map_err(|_| {
                RuntimeError::parameter(format!("GEXEC_DEVICE_ID must be an integer, got '{raw}'"))
            })?;
        }
        if let Some(raw) = value("GEXEC_SESSION_POOL") {
            self.session_pooled_allocator = parse_bool(&raw);
        }
        if let Some(raw) = value("GEXEC_ZERO_COPY") {
            self.zero_copy_reuse = parse_bool(&raw);
        }
        if let Some(raw) = value("GEXEC_TRIM_ON_EXHAUSTION") {
            self.trim_on_exhaustion = parse_bool(&raw);
        }
        if let Some(raw) = value("GEXEC_PERSISTENT_KINDS") {
            self.persistent_priority_kinds = raw
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(str::parse)
                .collect::<RuntimeResult<Vec<_>>>()?;
        }
        Ok(self)
    }
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn overlay(vars: &[(&str, &str)]) -> RuntimeResult<RuntimeOptions> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RuntimeOptions::default().overlay(|key| vars.get(key).cloned())
    }

    #[test]
    fn env_overlay_reads_switches_and_kinds() {
        let options = overlay(&[
            ("GEXEC_DEVICE_ID", "3"),
            ("GEXEC_SESSION_POOL", "yes"),
            ("GEXEC_ZERO_COPY", "0"),
            ("GEXEC_PERSISTENT_KINDS", "feature, fixed_priority"),
            ("GEXEC_TRIM_ON_EXHAUSTION", "off"),
        ])
        .unwrap();
        assert_eq!(options.device_id, 3);
        assert!(options.session_pooled_allocator);
        assert!(!options.zero_copy_reuse);
        assert!(!options.trim_on_exhaustion);
        assert_eq!(
            options.persistent_priority_kinds,
            vec![MemoryKind::Feature, MemoryKind::FixedPriority]
        );
    }

    #[test]
    fn blank_values_keep_defaults() {
        let options = overlay(&[("GEXEC_SESSION_POOL", "  ")]).unwrap();
        assert_eq!(options, RuntimeOptions::default());
    }

    #[test]
    fn bad_device_id_is_a_parameter_error() {
        let err = overlay(&[("GEXEC_DEVICE_ID", "gpu0")]).unwrap_err();
        assert!(matches!(err, RuntimeError::Parameter { .. }));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let options = RuntimeOptions::from_json(r#"{"zero_copy_reuse": true}"#).unwrap();
        assert!(options.zero_copy_reuse);
        assert!(options.trim_on_exhaustion);
    }
}
