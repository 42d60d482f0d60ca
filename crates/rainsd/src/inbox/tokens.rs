//! Tokens of queries this server issued itself.
//!
//! Responses carrying one of these tokens jump the normal queue. The set
//! is a bounded LRU and entries expire after a TTL; a token that falls out
//! simply loses its priority.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;

use rains_core::Token;

use crate::conn_cache::{capacity, CacheError};

pub struct ActiveTokens {
    inner: Mutex<LruCache<Token, Instant>>,
    ttl: Option<Duration>,
}

impl ActiveTokens {
    /// `ttl = None` keeps tokens until they are matched or pushed out.
    pub fn new(size: usize, ttl: Option<Duration>) -> Result<Self, CacheError> {
        Ok(Self {
            inner: Mutex::new(LruCache::new(capacity("active token cache", size)?)),
            ttl,
        })
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<Token, Instant>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expired(&self, issued: Instant) -> bool {
        self.ttl.is_some_and(|ttl| issued.elapsed() >= ttl)
    }

    /// Mint and register a fresh token.
    pub fn issue(&self) -> Token {
        let token = Token::random();
        self.insert(token);
        token
    }

    pub fn insert(&self, token: Token) {
        self.lock().put(token, Instant::now());
    }

    /// Whether `token` is live. Expired entries are dropped on the way.
    pub fn is_active(&self, token: &Token) -> bool {
        let mut tokens = self.lock();
        match tokens.peek(token) {
            Some(issued) if self.expired(*issued) => {
                tokens.pop(token);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Remove `token` if live; true means the caller won the match.
    pub fn take(&self, token: &Token) -> bool {
        match self.lock().pop(token) {
            Some(issued) => !self.expired(issued),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
