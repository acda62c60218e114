//! Group-scoped visibility rules for data items and quotes.
//!
//! A persona's effective read set is `{group_primary} ∪ groups_visible`,
//! with the reserved `*` wildcard expanding to everything. An item with no
//! groups belongs to "General". Ei always reads everything.

use std::collections::BTreeSet;

use crate::schema::{GENERAL_GROUP, PersonaEntity, WILDCARD_GROUP};

/// The groups a persona can read. `Everything` short-circuits intersection
/// checks for wildcard holders and Ei.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadScope {
    Everything,
    Groups(BTreeSet<String>),
}

pub fn effective_scope(persona: &PersonaEntity) -> ReadScope {
    if persona.is_ei() {
        return ReadScope::Everything;
    }
    let mut groups = BTreeSet::new();
    if let Some(primary) = &persona.group_primary {
        if primary == WILDCARD_GROUP {
            return ReadScope::Everything;
        }
        groups.insert(primary.clone());
    }
    for group in &persona.groups_visible {
        if group == WILDCARD_GROUP {
            return ReadScope::Everything;
        }
        groups.insert(group.clone());
    }
    if groups.is_empty() {
        groups.insert(GENERAL_GROUP.to_string());
    }
    ReadScope::Groups(groups)
}

impl ReadScope {
    /// Whether an item tagged with `item_groups` is readable in this scope.
    pub fn can_read(&self, item_groups: &[String]) -> bool {
        match self {
            ReadScope::Everything => true,
            ReadScope::Groups(groups) => {
                if item_groups.is_empty() {
                    // Untagged ≡ ["General"].
                    return groups.contains(GENERAL_GROUP);
                }
                item_groups
                    .iter()
                    .any(|g| g == WILDCARD_GROUP || groups.contains(g))
            }
        }
    }
}

/// Whether writing `groups` on an item makes it globally visible — an empty
/// or wildcard tag. Non-Ei personas doing this trigger a validation task.
pub fn is_global_write(groups: &[String]) -> bool {
    groups.is_empty() || groups.iter().any(|g| g == WILDCARD_GROUP)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
