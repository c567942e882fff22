//! Community hierarchy produced by the detector
//!
//! Communities live in flat per-level arenas. Parent and child links are
//! indices into the neighbouring level, never references.

use crate::element::EntityKey;
use crate::error::{CoreError, Result};
use crate::hashing::hash_parts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Position of a community in the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommunityId {
    /// 0 is the finest partition
    pub level: u32,
    pub index: u32,
}

impl CommunityId {
    pub fn new(level: u32, index: u32) -> Self {
        Self { level, index }
    }
}

impl fmt::Display for CommunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}C{}", self.level, self.index)
    }
}

impl FromStr for CommunityId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CoreError::Validation(format!("Invalid community id: {}", s));
        let rest = s.strip_prefix('L').ok_or_else(invalid)?;
        let (level, index) = rest.split_once('C').ok_or_else(invalid)?;
        Ok(Self {
            level: level.parse().map_err(|_| invalid())?,
            index: index.parse().map_err(|_| invalid())?,
        })
    }
}

/// A cluster of graph nodes at one level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: CommunityId,
    /// Member node keys, sorted
    pub members: Vec<EntityKey>,
    /// Index of the enclosing community at `level + 1`
    pub parent: Option<u32>,
    /// Indices of the communities at `level - 1` this one absorbed
    pub children: Vec<u32>,
    /// Documents any member was extracted from
    pub documents: BTreeSet<String>,
}

impl Community {
    pub fn level(&self) -> u32 {
        self.id.level
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Hash of level plus membership; stable while the membership is
    pub fn membership_hash(&self) -> String {
        let level = self.id.level.to_string();
        hash_parts(
            std::iter::once(level.as_str()).chain(self.members.iter().map(EntityKey::as_str)),
        )
    }

    /// Whether any member came from one of `documents`
    pub fn touches_any(&self, documents: &[String]) -> bool {
        documents.iter().any(|d| self.documents.contains(d))
    }
}

/// All levels of a detection run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunityHierarchy {
    levels: Vec<Vec<Community>>,
    /// Modularity of the partition at each level
    modularity: Vec<f64>,
}

impl CommunityHierarchy {
    pub fn new(levels: Vec<Vec<Community>>, modularity: Vec<f64>) -> Self {
        Self { levels, modularity }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn level(&self, level: u32) -> &[Community] {
        self.levels
            .get(level as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn levels(&self) -> impl Iterator<Item = &[Community]> {
        self.levels.iter().map(Vec::as_slice)
    }

    pub fn modularity(&self, level: u32) -> Option<f64> {
        self.modularity.get(level as usize).copied()
    }

    /// Every community, finest level first
    pub fn communities(&self) -> impl Iterator<Item = &Community> {
        self.levels.iter().flatten()
    }

    pub fn get(&self, id: CommunityId) -> Option<&Community> {
        self.levels
            .get(id.level as usize)
            .and_then(|level| level.get(id.index as usize))
    }

    pub fn parent(&self, id: CommunityId) -> Option<&Community> {
        let parent = self.get(id)?.parent?;
        self.get(CommunityId::new(id.level + 1, parent))
    }

    pub fn children(&self, id: CommunityId) -> Vec<&Community> {
        let Some(community) = self.get(id) else {
            return Vec::new();
        };
        if id.level == 0 {
            return Vec::new();
        }
        community
            .children
            .iter()
            .filter_map(|&child| self.get(CommunityId::new(id.level - 1, child)))
            .collect()
    }

    /// Community holding `key` at `level`
    pub fn community_of(&self, level: u32, key: &EntityKey) -> Option<&Community> {
        self.level(level)
            .iter()
            .find(|c| c.members.binary_search(key).is_ok())
    }
}

/// Natural-language summary of one community
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunitySummary {
    pub community: CommunityId,
    pub title: String,
    pub summary: String,
    /// Membership hash of the community this summary was written for
    pub membership_hash: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl CommunitySummary {
    pub fn level(&self) -> u32 {
        self.community.level
    }

    /// Title and body as one block for prompts
    pub fn render(&self) -> String {
        format!("# {}\n\n{}", self.title, self.summary)
    }
}
