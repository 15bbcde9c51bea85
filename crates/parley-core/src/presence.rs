use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Identities with a live binding at one point in time.
///
/// Always broadcast whole; receivers replace their copy rather than patch
/// it. Serializes as a sorted JSON array.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OnlineSet(BTreeSet<UserId>);

impl OnlineSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.0.contains(user)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserId> {
        self.0.iter()
    }

    /// The set as seen by `user`: everyone online except themselves.
    pub fn without(&self, user: &UserId) -> Self {
        Self(self.0.iter().filter(|u| *u != user).cloned().collect())
    }
}

impl FromIterator<UserId> for OnlineSet {
    fn from_iter<I: IntoIterator<Item = UserId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
