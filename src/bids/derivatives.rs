//! Deferred attachment of pre-existing derivative files to work units.
//!
//! Derivatives may be visited before or after the raw files of their unit,
//! so they are queued during the walk and resolved once all units exist.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::work_unit::{UnitKey, WorkUnit};
use crate::error::DiscoveryWarning;

/// Artifact kind holding region-of-interest masks.
pub const MASK_KIND: &str = "mask";

/// A derivative file waiting for its owning unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDerivative {
    pub software: String,
    pub kind: String,
    pub subject: String,
    pub session: Option<String>,
    pub acquisition: Option<String>,
    pub run: Option<String>,
    pub path: PathBuf,
}

impl PendingDerivative {
    pub fn key(&self) -> UnitKey {
        UnitKey::new(
            self.subject.clone(),
            self.session.clone(),
            self.acquisition.clone(),
            self.run.clone(),
        )
    }

    /// True when every entity the derivative carries agrees with `key`.
    /// Entities the derivative lacks match anything.
    pub fn is_compatible_with(&self, key: &UnitKey) -> bool {
        fn agrees(mine: &Option<String>, theirs: &Option<String>) -> bool {
            mine.is_none() || mine == theirs
        }
        self.subject == key.subject
            && agrees(&self.session, &key.session)
            && agrees(&self.acquisition, &key.acquisition)
            && agrees(&self.run, &key.run)
    }
}

/// How a derivative without an exact key match is attached.
///
/// Some datasets store subject-level derivatives (one reference volume or
/// mask shared by all acquisitions of a subject) without per-run entities.
/// This is dataset policy, not something inferred per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentPolicy {
    /// Attach to every compatible unit of the subject.
    Broadcast,
    /// Attach to the first compatible unit of the subject in sort order.
    FirstRun,
}

/// Selects the attachment policy for an artifact kind: masks broadcast,
/// reconstruction references attach to the first run only.
pub fn attachment_policy(kind: &str) -> AttachmentPolicy {
    if kind == MASK_KIND {
        AttachmentPolicy::Broadcast
    } else {
        AttachmentPolicy::FirstRun
    }
}

/// Resolves queued derivatives against the unit index.
///
/// An exact key match always wins; otherwise [`attachment_policy`] picks
/// among the compatible units. Derivatives with no candidate never create a
/// unit and are reported as orphans.
pub fn resolve_pending(
    index: &mut HashMap<UnitKey, WorkUnit>,
    pending: Vec<PendingDerivative>,
) -> Vec<DiscoveryWarning> {
    let mut warnings = Vec::new();

    for derivative in pending {
        let targets = select_targets(index, &derivative);

        if targets.is_empty() {
            let warning = DiscoveryWarning::Orphan {
                path: derivative.path.clone(),
                software: derivative.software.clone(),
                kind: derivative.kind.clone(),
            };
            warn!("{}", warning);
            warnings.push(warning);
            continue;
        }

        for key in targets {
            if let Some(unit) = index.get_mut(&key) {
                debug!(unit = %key, path = %derivative.path.display(), "Attaching derivative");
                attach(unit, &derivative);
            }
        }
    }

    warnings
}

fn select_targets(
    index: &HashMap<UnitKey, WorkUnit>,
    derivative: &PendingDerivative,
) -> Vec<UnitKey> {
    let exact = derivative.key();
    if index.get(&exact).is_some_and(WorkUnit::has_raw_payload) {
        return vec![exact];
    }

    let mut candidates: Vec<&UnitKey> = index
        .iter()
        .filter(|(key, unit)| unit.has_raw_payload() && derivative.is_compatible_with(key))
        .map(|(key, _)| key)
        .collect();
    candidates.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    match attachment_policy(&derivative.kind) {
        AttachmentPolicy::Broadcast => candidates.into_iter().cloned().collect(),
        AttachmentPolicy::FirstRun => candidates.into_iter().take(1).cloned().collect(),
    }
}

fn attach(unit: &mut WorkUnit, derivative: &PendingDerivative) {
    if derivative.kind == MASK_KIND {
        unit.add_mask(derivative.path.clone());
    } else {
        unit.add_derivative(&derivative.software, &derivative.kind, derivative.path.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bids::entities::{FileKind, Part};

    fn raw_unit(acq: &str, run: Option<&str>) -> WorkUnit {
        let mut unit = WorkUnit::new(UnitKey::new(
            "1",
            None,
            Some(acq.to_string()),
            run.map(str::to_string),
        ));
        unit.add_file(Part::Mag, FileKind::Image, format!("{}-{:?}.nii", acq, run).into());
        unit
    }

    fn index_of(units: Vec<WorkUnit>) -> HashMap<UnitKey, WorkUnit> {
        units.into_iter().map(|u| (u.key(), u)).collect()
    }

    fn pending(kind: &str, acq: Option<&str>, run: Option<&str>) -> PendingDerivative {
        PendingDerivative {
            software: "qsm-forward".to_string(),
            kind: kind.to_string(),
            subject: "1".to_string(),
            session: None,
            acquisition: acq.map(str::to_string),
            run: run.map(str::to_string),
            path: format!("derivatives/qsm-forward/sub-1/anat/{}.nii", kind).into(),
        }
    }

    #[test]
    fn test_attachment_policy() {
        assert_eq!(attachment_policy("mask"), AttachmentPolicy::Broadcast);
        assert_eq!(attachment_policy("Chimap"), AttachmentPolicy::FirstRun);
        assert_eq!(attachment_policy("aseg"), AttachmentPolicy::FirstRun);
    }

    #[test]
    fn test_exact_match_wins() {
        let mut index = index_of(vec![raw_unit("A", Some("1")), raw_unit("A", Some("2"))]);
        let warnings = resolve_pending(&mut index, vec![pending("mask", Some("A"), Some("2"))]);

        assert!(warnings.is_empty());
        let k1 = UnitKey::new("1", None, Some("A".into()), Some("1".into()));
        let k2 = UnitKey::new("1", None, Some("A".into()), Some("2".into()));
        assert!(index[&k1].mask.is_none());
        assert!(index[&k2].mask.is_some());
    }

    #[test]
    fn test_mask_broadcasts_to_every_run() {
        let mut index = index_of(vec![
            raw_unit("1", None),
            raw_unit("2", None),
            raw_unit("3", None),
        ]);
        resolve_pending(&mut index, vec![pending("mask", None, None)]);
        assert!(index.values().all(|u| u.mask.is_some()));
    }

    #[test]
    fn test_reference_attaches_to_first_run_only() {
        let mut index = index_of(vec![
            raw_unit("2", None),
            raw_unit("1", None),
            raw_unit("3", None),
        ]);
        resolve_pending(&mut index, vec![pending("Chimap", None, None)]);

        let with_chimap: Vec<_> = index
            .values()
            .filter(|u| !u.derivatives.is_empty())
            .map(|u| u.acquisition.clone())
            .collect();
        assert_eq!(with_chimap, vec![Some("1".to_string())]);
    }

    #[test]
    fn test_orphan_creates_no_unit() {
        let mut index = index_of(vec![raw_unit("A", None)]);
        let mut orphan = pending("Chimap", None, None);
        orphan.subject = "9".to_string();

        let warnings = resolve_pending(&mut index, vec![orphan]);
        assert_eq!(warnings.len(), 1);
        assert!(matches!(warnings[0], DiscoveryWarning::Orphan { .. }));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_compatibility_requires_matching_entities() {
        let d = pending("mask", Some("A"), None);
        assert!(d.is_compatible_with(&UnitKey::new("1", None, Some("A".into()), Some("3".into()))));
        assert!(!d.is_compatible_with(&UnitKey::new("1", None, Some("B".into()), None)));
        assert!(!d.is_compatible_with(&UnitKey::new("2", None, Some("A".into()), None)));
    }
}
