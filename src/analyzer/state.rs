use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one extension inside an analysis.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExtensionState {
    #[default]
    NotRequested,
    Resolving,
    AwaitingDependencies,
    Computing,
    Cached,
    Failed {
        error_code: String,
        message: String,
    },
}

impl ExtensionState {
    pub fn failed(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            error_code: error_code.into(),
            message: message.into(),
        }
    }

    /// Check if transition from current state to target state is valid
    pub fn can_transition_to(&self, target: &ExtensionState) -> bool {
        use ExtensionState::*;

        matches!(
            (self, target),
            // From NotRequested
            (NotRequested, Resolving) |

            // From Resolving
            (Resolving, AwaitingDependencies) |
            (Resolving, Failed { .. }) |

            // From AwaitingDependencies
            (AwaitingDependencies, Computing) |
            (AwaitingDependencies, Cached) |
            (AwaitingDependencies, Failed { .. }) |

            // From Computing
            (Computing, Cached) |
            (Computing, Failed { .. }) |

            // From Cached: a new request, an explicit recompute, an upstream invalidation
            (Cached, Resolving) |
            (Cached, Computing) |
            (Cached, NotRequested) |

            // From Failed
            (Failed { .. }, Resolving) |
            (Failed { .. }, NotRequested)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotRequested => "NotRequested",
            Self::Resolving => "Resolving",
            Self::AwaitingDependencies => "AwaitingDependencies",
            Self::Computing => "Computing",
            Self::Cached => "Cached",
            Self::Failed { .. } => "Failed",
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
