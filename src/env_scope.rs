//! Per-call environment overlay.
//!
//! The overlay writes to the real process environment so that libraries the
//! function calls see it. That environment is shared by every call in the
//! process: two concurrent calls that set the same key race, and the last
//! scope to exit decides what is left behind for that key.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::ffi::OsString;
use tracing::{debug, warn};

/// Guard that applies a set of variables and restores the previous state when
/// dropped, whether the call returned, failed, panicked or was cancelled.
#[derive(Debug)]
pub struct EnvScope {
    /// Keys this scope set, with the value each had before (`None` if unset).
    previous: Vec<(String, Option<OsString>)>,
}

impl EnvScope {
    pub fn enter<'a, I>(envs: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut previous = Vec::new();
        for (key, value) in envs {
            if !valid_key(key) || value.contains('\0') {
                warn!("Skipping invalid environment variable {:?}", key);
                continue;
            }
            previous.push((key.clone(), env::var_os(key)));
            env::set_var(key, value);
        }
        if !previous.is_empty() {
            debug!("Entered environment scope with {} variable(s)", previous.len());
        }
        Self { previous }
    }

    /// Keys this scope set.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.previous.iter().map(|(k, _)| k.as_str())
    }
}

impl Drop for EnvScope {
    fn drop(&mut self) {
        for (key, previous) in self.previous.drain(..).rev() {
            match previous {
                Some(value) => env::set_var(&key, value),
                None => env::remove_var(&key),
            }
        }
    }
}

fn valid_key(key: &str) -> bool {
    !key.is_empty() && !key.contains('=') && !key.contains('\0')
}

/// Gateway-wide defaults overlaid by the call's own `envs`; per-call values win.
pub fn merge_envs(
    defaults: &HashMap<String, String>,
    call: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = defaults
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    merged.extend(call.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_scope_sets_and_removes_new_keys() {
        let vars = envs(&[("SERVEGATE_SCOPE_TEST_NEW", "1")]);
        {
            let _scope = EnvScope::enter(&vars);
            assert_eq!(env::var("SERVEGATE_SCOPE_TEST_NEW").unwrap(), "1");
        }
        assert!(env::var_os("SERVEGATE_SCOPE_TEST_NEW").is_none());
    }

    #[test]
    fn test_scope_restores_previous_value() {
        env::set_var("SERVEGATE_SCOPE_TEST_OLD", "before");
        let vars = envs(&[("SERVEGATE_SCOPE_TEST_OLD", "during")]);
        {
            let scope = EnvScope::enter(&vars);
            assert_eq!(scope.keys().collect::<Vec<_>>(), vec!["SERVEGATE_SCOPE_TEST_OLD"]);
            assert_eq!(env::var("SERVEGATE_SCOPE_TEST_OLD").unwrap(), "during");
        }
        assert_eq!(env::var("SERVEGATE_SCOPE_TEST_OLD").unwrap(), "before");
        env::remove_var("SERVEGATE_SCOPE_TEST_OLD");
    }

    #[test]
    fn test_scope_restores_after_panic() {
        let vars = envs(&[("SERVEGATE_SCOPE_TEST_PANIC", "x")]);
        let result = std::panic::catch_unwind(|| {
            let _scope = EnvScope::enter(&vars);
            panic!("inside scope");
        });
        assert!(result.is_err());
        assert!(env::var_os("SERVEGATE_SCOPE_TEST_PANIC").is_none());
    }

    #[test]
    fn test_invalid_keys_skipped() {
        let vars = envs(&[("", "x"), ("A=B", "y"), ("SERVEGATE_SCOPE_TEST_OK", "z")]);
        let scope = EnvScope::enter(&vars);
        assert_eq!(scope.keys().collect::<Vec<_>>(), vec!["SERVEGATE_SCOPE_TEST_OK"]);
    }

    #[test]
    fn test_merge_prefers_call_values() {
        let mut defaults = HashMap::new();
        defaults.insert("REGION".to_string(), "eu".to_string());
        defaults.insert("MODE".to_string(), "prod".to_string());
        let merged = merge_envs(&defaults, &envs(&[("MODE", "test")]));
        assert_eq!(merged["REGION"], "eu");
        assert_eq!(merged["MODE"], "test");
    }
}
