//! Cache of compiled regular expressions

use std::sync::{Arc, OnceLock};

use moka::sync::Cache;
use regex::Regex;

use crate::errors::PipedError;

const DEFAULT_CAPACITY: u64 = 100;

/// Bounded caches of compiled expressions and of expressions known to be
/// invalid. A remembered invalid expression is not compiled again.
pub struct RegexPool {
    compiled: Cache<String, Arc<Regex>>,
    invalid: Cache<String, ()>,
}

impl RegexPool {
    pub fn new(capacity: u64) -> Self {
        Self {
            compiled: Cache::new(capacity),
            invalid: Cache::new(capacity),
        }
    }

    pub fn get(&self, pattern: &str) -> Result<Arc<Regex>, PipedError> {
        if let Some(re) = self.compiled.get(pattern) {
            return Ok(re);
        }
        if self.invalid.contains_key(pattern) {
            return Err(PipedError::Validation(format!(
                "invalid regular expression {:?}",
                pattern
            )));
        }

        match Regex::new(pattern) {
            Ok(re) => {
                let re = Arc::new(re);
                self.compiled.insert(pattern.to_string(), re.clone());
                Ok(re)
            }
            Err(e) => {
                self.invalid.insert(pattern.to_string(), ());
                Err(e.into())
            }
        }
    }
}

impl Default for RegexPool {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Process-wide pool
pub fn default_pool() -> &'static RegexPool {
    static POOL: OnceLock<RegexPool> = OnceLock::new();
    POOL.get_or_init(RegexPool::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_caches_compiled() {
        let pool = RegexPool::new(10);
        let a = pool.get(r"^spec\.template").unwrap();
        let b = pool.get(r"^spec\.template").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_match("spec.template.spec"));
    }

    #[test]
    fn test_pool_remembers_invalid() {
        let pool = RegexPool::new(10);
        assert!(matches!(pool.get("a(b"), Err(PipedError::Regex(_))));
        // The second lookup is answered from the negative set
        assert!(matches!(pool.get("a(b"), Err(PipedError::Validation(_))));
    }

    #[test]
    fn test_invalid_patterns_are_bounded() {
        let pool = RegexPool::new(2);
        for i in 0..20 {
            assert!(pool.get(&format!("a{}(b", i)).is_err());
        }
        pool.invalid.run_pending_tasks();
        assert!(pool.invalid.entry_count() <= 2, "{}", pool.invalid.entry_count());
    }
}
