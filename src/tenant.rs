//! Tenant hierarchy store: the three-level organizational tree allocations
//! flow through. Read-mostly; only provisioning writes here.

use std::fmt;
use std::sync::Arc;

use crate::error::AllocationError;
use crate::utils::{from_cbor, to_cbor};

pub const TENANTS_TREE: &str = "tenants";

/// Hierarchy level. Ordering is authority-first: `Top` outranks `Regional`
/// which outranks `Operating`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    minicbor::Encode,
    minicbor::Decode,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[n(0)]
    Top,
    #[n(1)]
    Regional,
    #[n(2)]
    Operating,
}

impl Level {
    /// The level immediately below, if any.
    pub fn child(self) -> Option<Level> {
        match self {
            Level::Top => Some(Level::Regional),
            Level::Regional => Some(Level::Operating),
            Level::Operating => None,
        }
    }

    /// The level immediately above, if any.
    pub fn parent(self) -> Option<Level> {
        match self {
            Level::Top => None,
            Level::Regional => Some(Level::Top),
            Level::Operating => Some(Level::Regional),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Top => "top",
            Level::Regional => "regional",
            Level::Operating => "operating",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, serde::Serialize)]
pub struct TenantNode {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub level: Level,
    #[n(3)]
    pub parent_id: Option<String>, // None only for Top
}

/// Sled-backed store for the tenant tree. Provisioning is owned by an
/// external collaborator; the engine only reads and link-checks.
pub struct TenantRegistry {
    tenants: sled::Tree,
}

impl TenantRegistry {
    pub fn new(db: Arc<sled::Db>) -> Result<Self, AllocationError> {
        let tenants = db.open_tree(TENANTS_TREE)?;
        Ok(Self { tenants })
    }

    /// Register a tenant node. The parent must already exist and sit exactly
    /// one level above, so the tree is acyclic by construction.
    pub fn register(&self, node: TenantNode) -> Result<TenantNode, AllocationError> {
        match (&node.parent_id, node.level.parent()) {
            (None, None) => {}
            (Some(parent_id), Some(required)) => {
                let parent = self.get(parent_id)?;
                if parent.level != required {
                    return Err(AllocationError::InvalidHierarchy {
                        source_level: parent.level.to_string(),
                        target_level: node.level.to_string(),
                    });
                }
            }
            (None, Some(_)) => {
                return Err(AllocationError::InvalidLevel(format!(
                    "{} tenant requires a parent",
                    node.level
                )));
            }
            (Some(_), None) => {
                return Err(AllocationError::InvalidLevel(
                    "top tenant cannot have a parent".into(),
                ));
            }
        }

        self.tenants.insert(node.id.as_bytes(), to_cbor(&node)?)?;
        Ok(node)
    }

    pub fn get(&self, id: &str) -> Result<TenantNode, AllocationError> {
        match self.tenants.get(id.as_bytes())? {
            Some(bytes) => from_cbor(&bytes),
            None => Err(AllocationError::NotFound(id.to_string())),
        }
    }

    /// Direct children of a tenant, name-ordered.
    pub fn children_of(&self, id: &str) -> Result<Vec<TenantNode>, AllocationError> {
        let mut children = vec![];
        for entry in self.tenants.iter() {
            let (_, bytes) = entry?;
            let node: TenantNode = from_cbor(&bytes)?;
            if node.parent_id.as_deref() == Some(id) {
                children.push(node);
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    /// Check that `target` is a legal recipient for an allocation issued by
    /// `source`: one level below, or same level when peer transfers apply.
    pub fn check_link(
        &self,
        source: &str,
        target: &str,
        peer: bool,
    ) -> Result<(TenantNode, TenantNode), AllocationError> {
        let source = self.get(source)?;
        let target = self.get(target)?;

        let legal = if peer {
            target.level == source.level
        } else {
            Some(target.level) == source.level.child()
        };

        if !legal {
            return Err(AllocationError::InvalidHierarchy {
                source_level: source.level.to_string(),
                target_level: target.level.to_string(),
            });
        }
        Ok((source, target))
    }
}
