use crate::context::InstallContext;
use crate::CoreError;
use stackwright_schema::{find_feature, Feature, PhaseNumber};
use stackwright_store::Checkpoint;
use std::collections::BTreeSet;

/// One idempotent provisioning step.
///
/// `run` must be safe to call again after it has completed, and after it has
/// failed partway through.
pub trait Phase {
    /// Stable identity, persisted in checkpoints. Never reuse or rename.
    fn key(&self) -> &'static str;

    fn name(&self) -> &'static str;

    fn run(&self, ctx: &InstallContext<'_>) -> Result<(), CoreError>;
}

/// Whether a phase always runs or can be excluded by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Required,
    Optional(&'static Feature),
}

pub struct PhaseEntry {
    number: PhaseNumber,
    gate: Gate,
    phase: Box<dyn Phase>,
}

impl PhaseEntry {
    pub fn number(&self) -> PhaseNumber {
        self.number
    }

    pub fn key(&self) -> &'static str {
        self.phase.key()
    }

    pub fn name(&self) -> &'static str {
        self.phase.name()
    }

    pub fn gate(&self) -> Gate {
        self.gate
    }

    pub fn feature(&self) -> Option<&'static Feature> {
        match self.gate {
            Gate::Required => None,
            Gate::Optional(f) => Some(f),
        }
    }

    pub(crate) fn phase(&self) -> &dyn Phase {
        self.phase.as_ref()
    }
}

impl std::fmt::Debug for PhaseEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseEntry")
            .field("number", &self.number)
            .field("key", &self.key())
            .field("gate", &self.gate)
            .finish()
    }
}

/// Phases in execution order. Immutable once built.
#[derive(Debug)]
pub struct PhaseRegistry {
    entries: Vec<PhaseEntry>,
}

impl PhaseRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn entries(&self) -> &[PhaseEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_number(&self) -> Option<PhaseNumber> {
        self.entries.first().map(PhaseEntry::number)
    }

    pub fn find_key(&self, key: &str) -> Option<&PhaseEntry> {
        self.entries.iter().find(|e| e.key() == key)
    }

    pub fn find_number(&self, number: PhaseNumber) -> Option<&PhaseEntry> {
        self.entries.iter().find(|e| e.number == number)
    }

    /// The phase to run after `checkpoint`, or `None` when it was the last one.
    ///
    /// The stable key wins over the number, so renumbering a phase does not
    /// shift the resume point. When the key is gone, the first phase numbered
    /// above the checkpoint is next.
    pub fn resume_point(&self, checkpoint: &Checkpoint) -> Option<PhaseNumber> {
        if let Some(key) = checkpoint.phase_key.as_deref() {
            if let Some(idx) = self.entries.iter().position(|e| e.key() == key) {
                return self.entries.get(idx + 1).map(PhaseEntry::number);
            }
        }
        self.entries
            .iter()
            .find(|e| e.number > checkpoint.phase_id)
            .map(PhaseEntry::number)
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<PhaseEntry>,
    errors: Vec<String>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn required(mut self, number: f64, phase: impl Phase + 'static) -> Self {
        self.entries.push(PhaseEntry {
            number: PhaseNumber::new(number),
            gate: Gate::Required,
            phase: Box::new(phase),
        });
        self
    }

    /// Register a phase that runs only while `feature` is not excluded.
    #[must_use]
    pub fn optional(mut self, number: f64, feature: &str, phase: impl Phase + 'static) -> Self {
        match find_feature(feature) {
            Some(f) => self.entries.push(PhaseEntry {
                number: PhaseNumber::new(number),
                gate: Gate::Optional(f),
                phase: Box::new(phase),
            }),
            None => self.errors.push(format!(
                "phase '{}' is gated on unknown feature '{feature}'",
                phase.key()
            )),
        }
        self
    }

    pub fn build(mut self) -> Result<PhaseRegistry, CoreError> {
        for entry in &self.entries {
            if !entry.number.is_valid() {
                self.errors.push(format!(
                    "phase '{}' has invalid number {}",
                    entry.key(),
                    entry.number
                ));
            }
        }
        self.entries.sort_by_key(PhaseEntry::number);

        let mut keys = BTreeSet::new();
        for pair in self.entries.windows(2) {
            if pair[0].number == pair[1].number {
                self.errors.push(format!(
                    "phases '{}' and '{}' share number {}",
                    pair[0].key(),
                    pair[1].key(),
                    pair[0].number
                ));
            }
        }
        for entry in &self.entries {
            if !keys.insert(entry.key()) {
                self.errors
                    .push(format!("phase key '{}' is registered twice", entry.key()));
            }
        }
        if self.entries.is_empty() {
            self.errors.push("no phases registered".to_owned());
        }

        if self.errors.is_empty() {
            Ok(PhaseRegistry {
                entries: self.entries,
            })
        } else {
            Err(CoreError::Registry(self.errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackwright_store::PhaseStatus;

    struct Named(&'static str);

    impl Phase for Named {
        fn key(&self) -> &'static str {
            self.0
        }

        fn name(&self) -> &'static str {
            self.0
        }

        fn run(&self, _ctx: &InstallContext<'_>) -> Result<(), CoreError> {
            Ok(())
        }
    }

    fn registry() -> PhaseRegistry {
        PhaseRegistry::builder()
            .required(3.0, Named("three"))
            .required(1.0, Named("one"))
            .optional(2.5, "log-rotation", Named("two-and-a-half"))
            .required(2.0, Named("two"))
            .build()
            .unwrap()
    }

    fn checkpoint(number: f64, key: Option<&str>) -> Checkpoint {
        let cp = Checkpoint::new(
            PhaseNumber::new(number),
            "x",
            serde_json::json!({}),
            PhaseStatus::Completed,
        );
        match key {
            Some(k) => cp.with_key(k),
            None => cp,
        }
    }

    #[test]
    fn entries_are_sorted_by_number() {
        let keys: Vec<&str> = registry().entries().iter().map(PhaseEntry::key).collect();
        assert_eq!(keys, ["one", "two", "two-and-a-half", "three"]);
    }

    #[test]
    fn optional_phase_carries_its_feature() {
        let reg = registry();
        let entry = reg.find_key("two-and-a-half").unwrap();
        assert_eq!(entry.feature().unwrap().id, "log-rotation");
        assert_eq!(reg.find_key("one").unwrap().gate(), Gate::Required);
    }

    #[test]
    fn unknown_feature_is_rejected() {
        let err = PhaseRegistry::builder()
            .required(1.0, Named("one"))
            .optional(2.0, "telepathy", Named("two"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("telepathy"));
    }

    #[test]
    fn duplicate_numbers_and_keys_are_rejected() {
        let err = PhaseRegistry::builder()
            .required(1.0, Named("one"))
            .required(1.0, Named("uno"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("share number"));

        let err = PhaseRegistry::builder()
            .required(1.0, Named("one"))
            .required(2.0, Named("one"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("registered twice"));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(PhaseRegistry::builder()
                .required(bad, Named("bad"))
                .build()
                .is_err());
        }
        assert!(PhaseRegistry::builder().build().is_err());
    }

    #[test]
    fn resume_prefers_the_key() {
        let reg = registry();
        // Number says 1, key says "two": the key wins.
        let next = reg.resume_point(&checkpoint(1.0, Some("two"))).unwrap();
        assert_eq!(next, PhaseNumber::new(2.5));
    }

    #[test]
    fn resume_falls_back_to_the_number() {
        let reg = registry();
        assert_eq!(
            reg.resume_point(&checkpoint(2.0, None)),
            Some(PhaseNumber::new(2.5))
        );
        // A phase that was since removed: continue after its number.
        assert_eq!(
            reg.resume_point(&checkpoint(2.7, Some("removed"))),
            Some(PhaseNumber::new(3.0))
        );
    }

    #[test]
    fn resume_after_last_phase_is_complete() {
        let reg = registry();
        assert_eq!(reg.resume_point(&checkpoint(3.0, Some("three"))), None);
        assert_eq!(reg.resume_point(&checkpoint(99.0, None)), None);
    }
}
