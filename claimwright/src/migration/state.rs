use chrono::{DateTime, Utc};

use crate::schema::ClaimsSchema;
use crate::ClaimsError;

/// Phase of one `define_schema` run.
///
/// ```text
/// LockPending -> Locked -> {Reactivate | SkipNoop | Migrate} -> {Committed | RolledBack} -> Unlocked
/// ```
///
/// `SkipNoop` writes nothing and goes straight to `Unlocked`, as does a run that fails before
/// it branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Waiting for the per-key lock
    LockPending,
    /// Lock held, deciding what to do
    Locked,
    /// Reactivating a previously defined version
    Reactivate,
    /// The version is already active
    SkipNoop,
    /// Migrating the population to a new version
    Migrate,
    /// Transaction committed
    Committed,
    /// Transaction rolled back
    RolledBack,
    /// Lock released
    Unlocked,
}

impl MigrationPhase {
    /// Returns the string representation used in log lines
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LockPending => "lock_pending",
            Self::Locked => "locked",
            Self::Reactivate => "reactivate",
            Self::SkipNoop => "skip_noop",
            Self::Migrate => "migrate",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Unlocked => "unlocked",
        }
    }

    /// Whether `next` may directly follow `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::LockPending, Self::Locked)
                | (
                    Self::Locked,
                    Self::Reactivate | Self::SkipNoop | Self::Migrate | Self::Unlocked
                )
                | (
                    Self::Reactivate | Self::Migrate,
                    Self::Committed | Self::RolledBack
                )
                | (
                    Self::SkipNoop | Self::Committed | Self::RolledBack,
                    Self::Unlocked
                )
        )
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What `define_schema` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum MigrationOutcome {
    /// A previously defined version became active again
    Reactivated,
    /// The version was already active; nothing was written
    Skipped,
    /// A new version was created and the population migrated to it
    Migrated,
}

impl MigrationOutcome {
    /// Returns the string representation used in log lines
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reactivated => "reactivated",
            Self::Skipped => "skipped",
            Self::Migrated => "migrated",
        }
    }
}

/// Summary of one `define_schema` run
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct MigrationReport {
    /// The schema that is now active
    pub schema: ClaimsSchema,
    /// Which branch was taken
    pub outcome: MigrationOutcome,
    /// Non-empty identity pages processed
    pub pages: u32,
    /// Identities visited
    pub identities: u64,
    /// Identities whose claim value changed, or that were notified on a notification pass
    pub claims_changed: u64,
    /// Wall-clock duration of the run, lock wait included
    pub duration_ms: i64,
}

/// Counters accumulated while paging through the population.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStats {
    /// Non-empty pages
    pub pages: u32,
    /// Identities visited
    pub identities: u64,
    /// Identities the visitor reported as changed
    pub changed: u64,
}

/// Tracks and logs the phase of one run, rejecting illegal transitions.
pub struct MigrationTracker {
    key: String,
    version: String,
    phase: MigrationPhase,
    started_at: DateTime<Utc>,
}

impl MigrationTracker {
    /// Starts tracking a run for `schema` in [`MigrationPhase::LockPending`].
    #[must_use]
    pub fn new(schema: &ClaimsSchema) -> Self {
        Self {
            key: schema.key.clone(),
            version: schema.short_version().to_string(),
            phase: MigrationPhase::LockPending,
            started_at: Utc::now(),
        }
    }

    /// The current phase.
    #[must_use]
    pub const fn phase(&self) -> MigrationPhase {
        self.phase
    }

    /// Milliseconds since tracking started.
    #[must_use]
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }

    /// Moves to `next`.
    ///
    /// # Errors
    /// - `ClaimsError::Generic` if `next` may not follow the current phase
    pub fn advance(&mut self, next: MigrationPhase) -> Result<(), ClaimsError> {
        if !self.phase.can_transition_to(next) {
            crate::error!(
                "migration.illegal_transition key={} version={} from={} to={} timestamp={}",
                self.key,
                self.version,
                self.phase,
                next,
                Utc::now().to_rfc3339()
            );
            return Err(ClaimsError::Generic {
                message: format!(
                    "illegal migration phase transition {} -> {} for '{}'",
                    self.phase, next, self.key
                ),
            });
        }

        crate::debug!(
            "migration.phase key={} version={} from={} to={} elapsed_ms={} timestamp={}",
            self.key,
            self.version,
            self.phase,
            next,
            self.elapsed_ms(),
            Utc::now().to_rfc3339()
        );
        self.phase = next;
        Ok(())
    }

    /// Records the end of a transaction: `Committed` on success, `RolledBack` otherwise.
    ///
    /// # Errors
    /// - the transaction's own error, or `ClaimsError::Generic` on an illegal transition
    pub fn settle<T>(&mut self, result: Result<T, ClaimsError>) -> Result<T, ClaimsError> {
        match result {
            Ok(value) => {
                self.advance(MigrationPhase::Committed)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(transition_error) = self.advance(MigrationPhase::RolledBack) {
                    crate::error!("migration.settle_failed error={transition_error}");
                }
                Err(e)
            }
        }
    }

    /// Records the lock release, unless the lock was never taken.
    pub fn unlock(&mut self) {
        if self.phase == MigrationPhase::LockPending {
            return;
        }
        if let Err(e) = self.advance(MigrationPhase::Unlocked) {
            crate::error!("migration.unlock_failed error={e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> MigrationTracker {
        MigrationTracker::new(&ClaimsSchema {
            key: "email".to_string(),
            scope: "email".to_string(),
            description: None,
            validation: "\"email\"".to_string(),
            migration: None,
            seed: "null".to_string(),
            version: "abcdef0123456789".to_string(),
            parent_version: None,
            active: false,
        })
    }

    #[test]
    fn test_happy_paths() {
        for branch in [MigrationPhase::Reactivate, MigrationPhase::Migrate] {
            let mut tracker = tracker();
            tracker.advance(MigrationPhase::Locked).unwrap();
            tracker.advance(branch).unwrap();
            assert_eq!(tracker.settle(Ok(1)).unwrap(), 1);
            assert_eq!(tracker.phase(), MigrationPhase::Committed);
            tracker.unlock();
            assert_eq!(tracker.phase(), MigrationPhase::Unlocked);
        }

        let mut tracker = tracker();
        tracker.advance(MigrationPhase::Locked).unwrap();
        tracker.advance(MigrationPhase::SkipNoop).unwrap();
        tracker.unlock();
        assert_eq!(tracker.phase(), MigrationPhase::Unlocked);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let mut tracker = tracker();
        tracker.advance(MigrationPhase::Locked).unwrap();
        tracker.advance(MigrationPhase::Migrate).unwrap();
        let result: Result<(), ClaimsError> = tracker.settle(Err(ClaimsError::Generic {
            message: "boom".to_string(),
        }));
        assert!(result.is_err());
        assert_eq!(tracker.phase(), MigrationPhase::RolledBack);
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let mut tracker = tracker();
        assert!(tracker.advance(MigrationPhase::Migrate).is_err());
        assert_eq!(tracker.phase(), MigrationPhase::LockPending);

        tracker.advance(MigrationPhase::Locked).unwrap();
        tracker.advance(MigrationPhase::SkipNoop).unwrap();
        assert!(tracker.advance(MigrationPhase::Committed).is_err());
    }

    #[test]
    fn test_unlock_without_lock_is_noop() {
        let mut tracker = tracker();
        tracker.unlock();
        assert_eq!(tracker.phase(), MigrationPhase::LockPending);
    }
}
