//! Capability matching
//!
//! The router asks a [`CapabilityMatcher`] which registered agents can handle a
//! request. Strategies are pluggable; [`TagMatcher`] is the built-in keyword
//! strategy that compares request words against declared skill tags.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::domain::AgentDescriptor;

/// An agent proposed for a request
#[derive(Debug, Clone)]
pub struct Candidate {
    pub agent: Arc<AgentDescriptor>,
    /// Capability the agent was matched on, if the strategy knows it
    pub capability: Option<String>,
    /// Higher is better; `None` means unranked
    pub score: Option<u32>,
}

impl Candidate {
    pub fn new(agent: Arc<AgentDescriptor>) -> Self {
        Self {
            agent,
            capability: None,
            score: None,
        }
    }

    pub fn for_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_score(mut self, score: u32) -> Self {
        self.score = Some(score);
        self
    }
}

/// Strategy that maps request text to candidate agents.
///
/// Implementations must be stateless with respect to the request: the same
/// input yields the same candidates.
#[async_trait]
pub trait CapabilityMatcher: Send + Sync {
    async fn candidates(&self, text: &str, agents: &[Arc<AgentDescriptor>]) -> Vec<Candidate>;
}

/// Matches request words against skill tags.
///
/// Each canonical tag mentioned by the request is a capability; every agent
/// declaring it becomes a candidate, scored by how many of the request's tags
/// the agent covers.
#[derive(Debug, Clone, Default)]
pub struct TagMatcher {
    /// Extra request words per canonical tag
    aliases: HashMap<String, BTreeSet<String>>,
}

impl TagMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treats every word in `words` as a mention of `tag`
    pub fn with_alias<I, S>(mut self, tag: &str, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entry = self.aliases.entry(tag.to_lowercase()).or_default();
        entry.extend(words.into_iter().map(|w| w.as_ref().to_lowercase()));
        self
    }

    pub fn with_aliases(self, aliases: &HashMap<String, Vec<String>>) -> Self {
        aliases
            .iter()
            .fold(self, |matcher, (tag, words)| matcher.with_alias(tag, words))
    }

    fn mentions(&self, words: &BTreeSet<String>, tag: &str) -> bool {
        if words.contains(tag) || words.contains(&format!("{}s", tag)) {
            return true;
        }
        self.aliases
            .get(tag)
            .map_or(false, |aliases| aliases.iter().any(|a| words.contains(a)))
    }
}

fn words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '-' && c != '_')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl CapabilityMatcher for TagMatcher {
    async fn candidates(&self, text: &str, agents: &[Arc<AgentDescriptor>]) -> Vec<Candidate> {
        let words = words(text);

        // tag -> agents declaring it, in registry order
        let mut by_tag: BTreeMap<String, Vec<&Arc<AgentDescriptor>>> = BTreeMap::new();
        let mut hits: HashMap<String, u32> = HashMap::new();

        for agent in agents {
            for tag in agent.tags() {
                if self.mentions(&words, &tag) {
                    by_tag.entry(tag).or_default().push(agent);
                    *hits.entry(agent.name.clone()).or_default() += 1;
                }
            }
        }

        by_tag
            .into_iter()
            .flat_map(|(tag, agents)| {
                let hits = &hits;
                agents.into_iter().map(move |agent| {
                    Candidate::new(agent.clone())
                        .for_capability(tag.clone())
                        .with_score(hits.get(&agent.name).copied().unwrap_or(0))
                })
            })
            .collect()
    }
}
