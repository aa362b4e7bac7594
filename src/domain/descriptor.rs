//! Agent descriptor ("agent card") types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use super::AgentId;
use crate::error::DiscoveryError;

/// Which variant of a descriptor was fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    /// Public card served without credentials
    #[default]
    Public,
    /// Extended card served to an authenticated caller
    AuthenticatedExtended,
}

/// Interaction modes advertised by a remote agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    /// Agent can answer `message/stream`
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub push_notifications: bool,
}

/// One declared skill of a remote agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Free-text tags used by capability matching
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub examples: Vec<String>,
}

impl CapabilityDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: String::new(),
            tags: BTreeSet::new(),
            examples: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_examples<I, S>(mut self, examples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.examples.extend(examples.into_iter().map(Into::into));
        self
    }
}

/// Metadata describing a remote agent's identity and capabilities.
///
/// Descriptors are immutable once fetched; a refresh replaces the whole value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Base address the agent serves its protocol on
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
    #[serde(default)]
    pub default_input_modes: Vec<String>,
    #[serde(default)]
    pub default_output_modes: Vec<String>,
    /// Declared skills. Required: a card without a skill list is malformed.
    pub skills: Vec<CapabilityDescriptor>,
    #[serde(default)]
    pub supports_authenticated_extended_card: bool,
    /// Set by the resolver, never read from the wire
    #[serde(skip)]
    pub trust: TrustTier,
}

impl AgentDescriptor {
    /// Builds a minimal public descriptor, mostly useful for tests and fakes
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            url: url.into(),
            version: "1.0.0".to_string(),
            capabilities: AgentCapabilities::default(),
            default_input_modes: vec!["text".to_string()],
            default_output_modes: vec!["text".to_string()],
            skills: Vec::new(),
            supports_authenticated_extended_card: false,
            trust: TrustTier::Public,
        }
    }

    pub fn with_skill(mut self, skill: CapabilityDescriptor) -> Self {
        self.skills.push(skill);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.capabilities.streaming = streaming;
        self
    }

    pub fn with_extended_card(mut self, supported: bool) -> Self {
        self.supports_authenticated_extended_card = supported;
        self
    }

    pub fn id(&self) -> AgentId {
        AgentId::new(self.name.clone())
    }

    pub fn supports_streaming(&self) -> bool {
        self.capabilities.streaming
    }

    /// Every tag across every skill, lowercased
    pub fn tags(&self) -> BTreeSet<String> {
        self.skills
            .iter()
            .flat_map(|skill| skill.tags.iter())
            .map(|tag| tag.to_lowercase())
            .collect()
    }

    /// Parses and validates a card fetched from `address`
    pub fn from_card(address: &str, card: Value) -> Result<Self, DiscoveryError> {
        let descriptor: AgentDescriptor =
            serde_json::from_value(card).map_err(|e| DiscoveryError::Malformed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        if descriptor.name.trim().is_empty() {
            return Err(DiscoveryError::Malformed {
                address: address.to_string(),
                reason: "descriptor has an empty name".to_string(),
            });
        }

        if let Some(skill) = descriptor.skills.iter().find(|s| s.id.trim().is_empty()) {
            return Err(DiscoveryError::Malformed {
                address: address.to_string(),
                reason: format!("skill '{}' has an empty id", skill.name),
            });
        }

        Ok(descriptor)
    }
}

/// Roster entry listing an agent by name and description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub name: String,
    pub description: String,
}

impl From<&AgentDescriptor> for AgentSummary {
    fn from(descriptor: &AgentDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
        }
    }
}
