//! Dataset family detection and run selection.
//!
//! COSMOS-style datasets label each head orientation with a numeric
//! acquisition (`acq-1`, `acq-2`, ...); synthetic datasets use descriptive
//! labels (`acq-1p0mm`). Only the former support run selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::work_unit::WorkUnit;

/// Family of a grouped dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetFamily {
    Cosmos,
    Synthetic,
}

impl DatasetFamily {
    /// Classifies a grouping by its first unit: a purely numeric acquisition
    /// label means COSMOS.
    pub fn detect(units: &[WorkUnit]) -> Self {
        let numeric = units
            .first()
            .and_then(|u| u.acquisition.as_deref())
            .is_some_and(|acq| !acq.is_empty() && acq.chars().all(|c| c.is_ascii_digit()));
        if numeric {
            DatasetFamily::Cosmos
        } else {
            DatasetFamily::Synthetic
        }
    }
}

impl fmt::Display for DatasetFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetFamily::Cosmos => write!(f, "cosmos"),
            DatasetFamily::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// Error parsing a run selection string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid run selection '{0}': expected numbers or ranges like \"1,2,5\" or \"1-3\"")]
pub struct RunSelectionError(pub String);

/// Ordered list of selected run numbers, e.g. `"1,3-4"` -> `[1, 3, 4]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSelection {
    runs: Vec<u32>,
}

impl RunSelection {
    pub fn parse(raw: &str) -> Result<Self, RunSelectionError> {
        let err = || RunSelectionError(raw.to_string());
        let mut runs = Vec::new();

        for part in raw.split(',').map(str::trim) {
            if part.is_empty() {
                return Err(err());
            }
            match part.split_once('-') {
                Some((start, end)) => {
                    let start: u32 = start.trim().parse().map_err(|_| err())?;
                    let end: u32 = end.trim().parse().map_err(|_| err())?;
                    if end < start {
                        return Err(err());
                    }
                    runs.extend(start..=end);
                }
                None => runs.push(part.parse().map_err(|_| err())?),
            }
        }

        Ok(Self { runs })
    }

    pub fn runs(&self) -> &[u32] {
        &self.runs
    }

    /// Picks, for each selected number in order, the first unit whose
    /// acquisition label equals it. Numbers without a unit are skipped.
    pub fn select<'a>(&self, units: &'a [WorkUnit]) -> Vec<&'a WorkUnit> {
        self.runs
            .iter()
            .filter_map(|n| {
                let label = n.to_string();
                units
                    .iter()
                    .find(|u| u.acquisition.as_deref() == Some(label.as_str()))
            })
            .collect()
    }
}

impl FromStr for RunSelection {
    type Err = RunSelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Units to execute: COSMOS datasets honour the selection, every other
/// family runs all units.
pub fn select_units<'a>(units: &'a [WorkUnit], selection: &RunSelection) -> Vec<&'a WorkUnit> {
    match DatasetFamily::detect(units) {
        DatasetFamily::Cosmos => selection.select(units),
        DatasetFamily::Synthetic => units.iter().collect(),
    }
}
