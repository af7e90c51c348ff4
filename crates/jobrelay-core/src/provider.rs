//! Provider configuration types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ProviderId;

/// A configured execution backend.
///
/// Health and load are runtime state owned by the health tracker and are
/// deliberately absent here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    /// Unique provider identifier.
    pub id: ProviderId,

    /// Display name.
    pub name: String,

    /// Backend kind (e.g., "claude-cli", "openai-api").
    pub kind: String,

    /// Disabled providers are never selected.
    pub enabled: bool,

    pub created_at: DateTime<Utc>,
}

impl Provider {
    /// Create a new enabled Provider.
    pub fn new(id: impl Into<ProviderId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: "generic".to_string(),
            enabled: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
