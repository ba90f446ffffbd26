use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::face::FaceEncoding;
use crate::store::{FaceCandidate, FaceFields, UserRef, UserStore};
use crate::Result;

/// Largest Euclidean distance still accepted as the same face.
pub const DEFAULT_TOLERANCE: f64 = 0.6;

/// How a query face is resolved when several candidates are within tolerance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// First candidate in store order.
    #[default]
    FirstMatch,
    /// Closest candidate overall. Ties keep the earlier one.
    BestMatch,
}

pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Scans `candidates` for one within `tolerance` of `query`.
///
/// Candidates with a different dimension than the query are skipped.
pub fn find_match<'a>(
    query: &[f64],
    candidates: &'a [FaceCandidate],
    tolerance: f64,
    policy: MatchPolicy,
) -> Option<(&'a FaceCandidate, f64)> {
    let mut best: Option<(&FaceCandidate, f64)> = None;
    for c in candidates {
        if c.encoding.len() != query.len() {
            warn!(
                user = c.user.id,
                stored = c.encoding.len(),
                query = query.len(),
                "skipping face encoding with mismatched dimension"
            );
            continue;
        }

        let distance = euclidean_distance(query, &c.encoding);
        if distance > tolerance {
            continue;
        }
        match policy {
            MatchPolicy::FirstMatch => return Some((c, distance)),
            MatchPolicy::BestMatch => {
                if best.map_or(true, |(_, d)| distance < d) {
                    best = Some((c, distance));
                }
            }
        }
    }
    best
}

/// Registers, matches and removes face encodings against a [`UserStore`].
pub struct FaceMatcher {
    store: Arc<dyn UserStore>,
    tolerance: f64,
    policy: MatchPolicy,
}

impl FaceMatcher {
    pub fn new(store: Arc<dyn UserStore>, tolerance: f64, policy: MatchPolicy) -> Self {
        Self {
            store,
            tolerance,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn UserStore> {
        &self.store
    }

    /// Stores `encoding` on the user. Returns false for an unknown user.
    pub fn register(&self, user_id: u64, encoding: FaceEncoding, enable_login: bool) -> Result<bool> {
        let face = FaceFields {
            encoding: Some(encoding.vector),
            image_path: Some(encoding.image_path),
            enabled: enable_login,
        };
        let updated = self.store.update(user_id, face)?;
        if updated {
            info!(user = user_id, enable_login, "face registered");
        }
        Ok(updated)
    }

    pub fn authenticate(&self, query: &[f64]) -> Result<Option<UserRef>> {
        let candidates = self.store.list_face_enabled_with_encoding()?;
        match find_match(query, &candidates, self.tolerance, self.policy) {
            Some((c, distance)) => {
                info!(user = c.user.id, distance, "face matched");
                Ok(Some(c.user.clone()))
            }
            None => {
                debug!(candidates = candidates.len(), "no face within tolerance");
                Ok(None)
            }
        }
    }

    /// Clears the user's face data and deletes the stored image.
    /// Returns false for an unknown user.
    pub fn remove(&self, user_id: u64) -> Result<bool> {
        let user = match self.store.get_by_id(user_id)? {
            Some(u) => u,
            None => return Ok(false),
        };

        if !self.store.update(user_id, FaceFields::default())? {
            return Ok(false);
        }

        if let Some(path) = user.face.image_path {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "deleted face image"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to delete face image"),
            }
        }
        info!(user = user_id, "face removed");
        Ok(true)
    }
}
