//! Cache keys for minted tokens.
//!
//! A lookup names `(token type, source identity, scopes, audiences)`. Its UID
//! folds the identity hash with a hash over the audience and scope lists;
//! lookups differing in any list must not collide, and a residual 64-bit
//! collision is caught by deep equality on fetch.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use vouch_core::cmp::equal_unordered;

use crate::identity::SourceIdentity;

/// The kind of token a lookup refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Access,
    Id,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Access => write!(f, "access"),
            TokenKind::Id => write!(f, "id"),
        }
    }
}

/// Identifies one cacheable token.
#[derive(Debug, Clone)]
pub struct TokenLookup {
    pub kind: TokenKind,
    pub identity: SourceIdentity,
    pub scopes: Vec<String>,
    pub audiences: Vec<String>,
}

impl TokenLookup {
    /// A lookup without scopes or audiences.
    pub fn new(kind: TokenKind, identity: SourceIdentity) -> Self {
        Self {
            kind,
            identity,
            scopes: Vec::new(),
            audiences: Vec::new(),
        }
    }

    /// A lookup with scope and audience lists (access tokens).
    pub fn with_scopes_and_audiences(
        kind: TokenKind,
        identity: SourceIdentity,
        scopes: Vec<String>,
        audiences: Vec<String>,
    ) -> Self {
        Self {
            kind,
            identity,
            scopes,
            audiences,
        }
    }

    /// A lookup with a single audience and no scopes (identity tokens).
    pub fn with_audience(kind: TokenKind, identity: SourceIdentity, audience: String) -> Self {
        Self {
            kind,
            identity,
            scopes: Vec::new(),
            audiences: vec![audience],
        }
    }

    /// The 64-bit cache key for this lookup.
    pub fn uid(&self) -> TokenUid {
        let mut hasher = DefaultHasher::new();
        for audience in &self.audiences {
            audience.hash(&mut hasher);
            ";".hash(&mut hasher);
        }
        for scope in &self.scopes {
            scope.hash(&mut hasher);
            ";".hash(&mut hasher);
        }
        TokenUid {
            kind: self.kind,
            hash: self.identity.hash64() ^ hasher.finish(),
        }
    }

    /// Deep equality: list comparison is unordered.
    pub fn matches(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.identity == other.identity
            && equal_unordered(&self.scopes, &other.scopes)
            && equal_unordered(&self.audiences, &other.audiences)
    }
}

/// Hash-derived cache key: token kind plus a 64-bit digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenUid {
    kind: TokenKind,
    hash: u64,
}

impl TokenUid {
    /// The raw 64-bit digest, used for shard selection.
    pub fn digest(&self) -> u64 {
        self.hash
    }
}

impl std::fmt::Display for TokenUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.hash)
    }
}
