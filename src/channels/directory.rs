//! Author directory fed by the inbound channel.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::pipeline::types::{AuthorDirectory, AuthorId, AuthorInfo};

/// Remembers every author the poller has seen.
#[derive(Debug, Default)]
pub struct CachedAuthorDirectory {
    authors: RwLock<HashMap<AuthorId, AuthorInfo>>,
}

impl CachedAuthorDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, author_id: AuthorId, info: AuthorInfo) {
        self.authors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(author_id, info);
    }

    pub fn len(&self) -> usize {
        self.authors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuthorDirectory for CachedAuthorDirectory {
    fn author_info(&self, author_id: AuthorId) -> Option<AuthorInfo> {
        self.authors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&author_id)
            .cloned()
    }
}
