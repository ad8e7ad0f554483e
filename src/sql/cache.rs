// ABOUTME: Bounded LRU cache of parsed placeholder sets keyed by SQL text
// ABOUTME: Transformation SQL is re-evaluated for every matching row, so parses are reused

use super::placeholders::{parse_placeholders, ParsedSql};
use crate::error::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

struct LruState {
    entries: HashMap<String, Arc<ParsedSql>>,
    order: VecDeque<String>,
}

impl LruState {
    fn touch(&mut self, sql: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == sql) {
            if let Some(key) = self.order.remove(pos) {
                self.order.push_back(key);
            }
        }
    }
}

/// Least-recently-used cache for [`ParsedSql`]
pub struct PlaceholderCache {
    capacity: usize,
    state: Mutex<LruState>,
}

impl PlaceholderCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Parse `sql`, or return the cached parse
    pub fn get_or_parse(&self, sql: &str) -> Result<Arc<ParsedSql>> {
        if let Some(hit) = self.get(sql) {
            return Ok(hit);
        }

        // Parse outside the lock; a racing parse of the same text is harmless
        let parsed = Arc::new(parse_placeholders(sql)?);
        let mut state = self.lock();
        if !state.entries.contains_key(sql) {
            while state.entries.len() >= self.capacity {
                match state.order.pop_front() {
                    Some(oldest) => {
                        state.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
            state.order.push_back(sql.to_string());
        }
        state.entries.insert(sql.to_string(), parsed.clone());
        Ok(parsed)
    }

    pub fn get(&self, sql: &str) -> Option<Arc<ParsedSql>> {
        let mut state = self.lock();
        let hit = state.entries.get(sql).cloned()?;
        state.touch(sql);
        Some(hit)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruState> {
        // A poisoned cache only holds immutable parse results
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PlaceholderCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
