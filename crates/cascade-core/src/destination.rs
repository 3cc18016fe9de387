//! Output destination model.
//!
//! Destination configs have been stored in several shapes over time: a bare
//! legacy object keyed by `outputType`, a loose camelCase list, and the
//! current versioned document. [`Destinations`] accepts all of them and
//! normalizes once at load into [`OutputDestination`]; it always serializes
//! back as the current version, so nothing downstream branches on history.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CascadeError;

/// Current on-disk version of the destination document.
pub const DESTINATIONS_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    ExternalApi,
    InternalDb,
    Webhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationProfile {
    #[default]
    Plain,
    MasterData,
    SsotUpdate,
}

/// Where and how a node's output lands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Field name used when wrapping output for external APIs.
    #[serde(default)]
    pub field_name: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub field_key: Option<String>,
    /// JSON path selecting a sub-value of the output.
    #[serde(default)]
    pub source_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Auto-approve leaf-level (level 4) edits.
    #[serde(default)]
    pub auto_approve_l4: bool,
}

/// Canonical destination representation used by the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDestination {
    pub id: String,
    pub kind: DestinationKind,
    #[serde(default)]
    pub profile: DestinationProfile,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub field_mapping: FieldMapping,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl OutputDestination {
    pub fn external_api(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: DestinationKind::ExternalApi,
            profile: DestinationProfile::Plain,
            enabled: true,
            field_mapping: FieldMapping::default(),
            approval: ApprovalConfig::default(),
            endpoint: None,
        }
    }

    pub fn webhook(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Webhook,
            endpoint: Some(url.into()),
            ..Self::external_api(id)
        }
    }

    pub fn master_data(
        id: impl Into<String>,
        domain: impl Into<String>,
        field_key: impl Into<String>,
    ) -> Self {
        Self {
            kind: DestinationKind::InternalDb,
            profile: DestinationProfile::MasterData,
            field_mapping: FieldMapping {
                domain: Some(domain.into()),
                field_key: Some(field_key.into()),
                ..FieldMapping::default()
            },
            ..Self::external_api(id)
        }
    }

    pub fn ssot_update(id: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::InternalDb,
            profile: DestinationProfile::SsotUpdate,
            ..Self::external_api(id)
        }
    }

    pub fn with_source_path(mut self, path: impl Into<String>) -> Self {
        self.field_mapping.source_path = Some(path.into());
        self
    }

    pub fn with_field_name(mut self, name: impl Into<String>) -> Self {
        self.field_mapping.field_name = Some(name.into());
        self
    }

    pub fn with_auto_approve_l4(mut self) -> Self {
        self.approval.auto_approve_l4 = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check the kind/profile combination and required mapping fields.
    pub fn validate(&self) -> Result<(), CascadeError> {
        let invalid = |msg: &str| Err(CascadeError::InvalidDestination(format!("{}: {}", self.id, msg)));
        match (self.kind, self.profile) {
            (DestinationKind::InternalDb, DestinationProfile::Plain) => {
                return invalid("internal_db requires master_data or ssot_update profile")
            }
            (DestinationKind::ExternalApi | DestinationKind::Webhook, DestinationProfile::MasterData)
            | (DestinationKind::ExternalApi | DestinationKind::Webhook, DestinationProfile::SsotUpdate) => {
                return invalid("master_data and ssot_update profiles require internal_db")
            }
            _ => {}
        }
        if self.profile == DestinationProfile::MasterData
            && (self.field_mapping.domain.is_none() || self.field_mapping.field_key.is_none())
        {
            return invalid("master_data requires domain and field_key");
        }
        if self.kind == DestinationKind::Webhook && self.endpoint.is_none() {
            return invalid("webhook requires an endpoint");
        }
        Ok(())
    }
}

/// Normalized destination list of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDestinations", into = "RawDestinations")]
pub struct Destinations(pub Vec<OutputDestination>);

impl Destinations {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OutputDestination> {
        self.0.iter()
    }
}

/// Every shape a destination config has been persisted in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawDestinations {
    /// Current: `{"version": 2, "destinations": [...]}`.
    Versioned {
        version: u32,
        destinations: Vec<OutputDestination>,
    },
    /// Loose list of legacy entries.
    List(Vec<LegacyDestination>),
    /// Single legacy object keyed by `outputType`.
    Single(LegacyDestination),
}

/// Historical destination entry with camelCase aliases and flattened mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyDestination {
    #[serde(default, alias = "destinationId", alias = "destination_id")]
    pub id: Option<String>,
    #[serde(default, alias = "type", alias = "destinationType")]
    pub kind: Option<String>,
    #[serde(default, alias = "outputType", alias = "output_type")]
    pub profile: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default, alias = "fieldMapping")]
    pub field_mapping: Option<FieldMapping>,
    #[serde(default, alias = "fieldName")]
    pub field_name: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default, alias = "fieldKey")]
    pub field_key: Option<String>,
    #[serde(default, alias = "jsonPath", alias = "sourcePath")]
    pub source_path: Option<String>,
    #[serde(default, alias = "approvalConfig")]
    pub approval_config: Option<ApprovalConfig>,
    #[serde(default, alias = "autoApproveL4")]
    pub auto_approve_l4: Option<bool>,
    #[serde(default, alias = "url", alias = "webhookUrl")]
    pub endpoint: Option<String>,
}

fn parse_kind(s: &str) -> Option<DestinationKind> {
    match s {
        "external_api" | "externalApi" | "api" => Some(DestinationKind::ExternalApi),
        "internal_db" | "internalDb" | "database" => Some(DestinationKind::InternalDb),
        "webhook" => Some(DestinationKind::Webhook),
        _ => None,
    }
}

fn parse_profile(s: &str) -> Option<DestinationProfile> {
    match s {
        "plain" => Some(DestinationProfile::Plain),
        "master_data" | "masterData" => Some(DestinationProfile::MasterData),
        "ssot_update" | "ssotUpdate" | "ssot" => Some(DestinationProfile::SsotUpdate),
        _ => None,
    }
}

impl LegacyDestination {
    fn normalize(self, index: usize) -> Result<OutputDestination, CascadeError> {
        if self.kind.is_none() && self.profile.is_none() {
            return Err(CascadeError::InvalidDestination(format!(
                "entry {} has neither a type nor an outputType",
                index
            )));
        }

        let profile = match self.profile.as_deref() {
            Some(p) => parse_profile(p).ok_or_else(|| {
                CascadeError::InvalidDestination(format!("unknown profile: {}", p))
            })?,
            None => DestinationProfile::Plain,
        };

        let kind = match self.kind.as_deref() {
            Some(k) => parse_kind(k)
                .ok_or_else(|| CascadeError::InvalidDestination(format!("unknown type: {}", k)))?,
            None => match profile {
                DestinationProfile::MasterData | DestinationProfile::SsotUpdate => {
                    DestinationKind::InternalDb
                }
                DestinationProfile::Plain if self.endpoint.is_some() => DestinationKind::Webhook,
                DestinationProfile::Plain => DestinationKind::ExternalApi,
            },
        };

        // Flattened mapping keys override an explicit fieldMapping object.
        let mut field_mapping = self.field_mapping.unwrap_or_default();
        if self.field_name.is_some() {
            field_mapping.field_name = self.field_name;
        }
        if self.domain.is_some() {
            field_mapping.domain = self.domain;
        }
        if self.field_key.is_some() {
            field_mapping.field_key = self.field_key;
        }
        if self.source_path.is_some() {
            field_mapping.source_path = self.source_path;
        }

        let mut approval = self.approval_config.unwrap_or_default();
        if let Some(flag) = self.auto_approve_l4 {
            approval.auto_approve_l4 = flag;
        }

        Ok(OutputDestination {
            id: self.id.unwrap_or_else(|| format!("dest-{}", index)),
            kind,
            profile,
            enabled: self.enabled.unwrap_or(true),
            field_mapping,
            approval,
            endpoint: self.endpoint,
        })
    }
}

impl TryFrom<RawDestinations> for Destinations {
    type Error = CascadeError;

    fn try_from(raw: RawDestinations) -> Result<Self, Self::Error> {
        let list = match raw {
            RawDestinations::Versioned {
                version,
                destinations,
            } => {
                if version > DESTINATIONS_VERSION {
                    return Err(CascadeError::InvalidDestination(format!(
                        "unsupported destinations version {}",
                        version
                    )));
                }
                destinations
            }
            RawDestinations::List(entries) => {
                debug!(count = entries.len(), "Normalizing legacy destination list");
                entries
                    .into_iter()
                    .enumerate()
                    .map(|(i, e)| e.normalize(i))
                    .collect::<Result<Vec<_>, _>>()?
            }
            RawDestinations::Single(entry) => {
                debug!("Normalizing single legacy destination");
                vec![entry.normalize(0)?]
            }
        };

        for dest in &list {
            dest.validate()?;
        }
        Ok(Self(list))
    }
}

impl From<Destinations> for RawDestinations {
    fn from(d: Destinations) -> Self {
        RawDestinations::Versioned {
            version: DESTINATIONS_VERSION,
            destinations: d.0,
        }
    }
}
