//! Admission control for the pool: per-user and optional per-language
//! caps on concurrently running executions. The global cap is structural
//! (one container per worker, `pool_size` workers).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use voidrunner_core::models::ScriptLanguage;

#[derive(Default)]
struct Counts {
    users: HashMap<Uuid, usize>,
    languages: HashMap<ScriptLanguage, usize>,
}

pub struct ConcurrencyLimits {
    per_user_cap: usize,
    per_language_cap: Option<usize>,
    counts: Mutex<Counts>,
}

impl ConcurrencyLimits {
    pub fn new(per_user_cap: usize, per_language_cap: Option<usize>) -> Self {
        Self {
            per_user_cap,
            per_language_cap,
            counts: Mutex::new(Counts::default()),
        }
    }

    /// Claims an execution slot for this user and language. `None` when
    /// a cap is hit; the caller nacks without executing.
    pub fn try_acquire(
        self: &Arc<Self>,
        user_id: Uuid,
        language: ScriptLanguage,
    ) -> Option<AdmissionPermit> {
        let mut counts = self.counts.lock().expect("limit counts poisoned");

        let user_running = counts.users.get(&user_id).copied().unwrap_or(0);
        if user_running >= self.per_user_cap {
            return None;
        }
        if let Some(cap) = self.per_language_cap {
            let language_running = counts.languages.get(&language).copied().unwrap_or(0);
            if language_running >= cap {
                return None;
            }
        }

        *counts.users.entry(user_id).or_insert(0) += 1;
        *counts.languages.entry(language).or_insert(0) += 1;
        Some(AdmissionPermit {
            limits: Arc::clone(self),
            user_id,
            language,
        })
    }

    fn release(&self, user_id: Uuid, language: ScriptLanguage) {
        let mut counts = self.counts.lock().expect("limit counts poisoned");
        if let Some(n) = counts.users.get_mut(&user_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                counts.users.remove(&user_id);
            }
        }
        if let Some(n) = counts.languages.get_mut(&language) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                counts.languages.remove(&language);
            }
        }
    }

    pub fn running_for_user(&self, user_id: Uuid) -> usize {
        self.counts
            .lock()
            .expect("limit counts poisoned")
            .users
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Held for the duration of one execution; releases on drop.
pub struct AdmissionPermit {
    limits: Arc<ConcurrencyLimits>,
    user_id: Uuid,
    language: ScriptLanguage,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.limits.release(self.user_id, self.language);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_user_cap_is_enforced_and_released() {
        let limits = Arc::new(ConcurrencyLimits::new(2, None));
        let user = Uuid::new_v4();

        let a = limits.try_acquire(user, ScriptLanguage::Python).unwrap();
        let _b = limits.try_acquire(user, ScriptLanguage::Bash).unwrap();
        assert!(limits.try_acquire(user, ScriptLanguage::Python).is_none());
        assert_eq!(limits.running_for_user(user), 2);

        // A different user has a separate budget.
        let other = Uuid::new_v4();
        let _c = limits.try_acquire(other, ScriptLanguage::Python).unwrap();

        drop(a);
        assert_eq!(limits.running_for_user(user), 1);
        assert!(limits.try_acquire(user, ScriptLanguage::Python).is_some());
    }

    #[test]
    fn per_language_cap_spans_users() {
        let limits = Arc::new(ConcurrencyLimits::new(10, Some(1)));
        let _a = limits
            .try_acquire(Uuid::new_v4(), ScriptLanguage::Go)
            .unwrap();
        assert!(limits
            .try_acquire(Uuid::new_v4(), ScriptLanguage::Go)
            .is_none());
        assert!(limits
            .try_acquire(Uuid::new_v4(), ScriptLanguage::Python)
            .is_some());
    }
}
