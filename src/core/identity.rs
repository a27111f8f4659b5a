use std::fmt;

use serde::{Deserialize, Serialize};

use super::fingerprint::Fingerprint;
use super::{EventTrains, Recording};
use crate::error::{validate_name, Result};

/// Stable key binding one recording and one set of event trains to their
/// cached extensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisIdentity(String);

impl AnalysisIdentity {
    /// Explicit identity chosen by the caller.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_name("identity", &id)?;
        Ok(Self(id))
    }

    /// Identity derived from the content of the recording and event trains.
    pub fn from_content(recording: &dyn Recording, events: &EventTrains) -> Self {
        let fingerprint = binding_fingerprint(recording, events);
        Self(format!("sha256-{}", &fingerprint[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnalysisIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint of what an identity is bound to.
pub fn binding_fingerprint(recording: &dyn Recording, events: &EventTrains) -> String {
    let mut fp = Fingerprint::new();
    fp.str(&recording.fingerprint()).str(&events.fingerprint());
    fp.finish()
}
