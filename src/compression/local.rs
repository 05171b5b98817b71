//! In-process compression engine.
//!
//! Scores remembered messages heuristically and keeps the most important
//! ones for a query. Used when no external engine is configured.
//!
//! Importance (0.0-1.0) combines three signals:
//!
//! | Signal    | Weight | Meaning                                           |
//! |-----------|--------|---------------------------------------------------|
//! | relevance | 0.5    | share of query terms present in the message       |
//! | recency   | 0.3    | position in the conversation (latest = 1.0)       |
//! | salience  | 0.2    | numbers, paths, code markers, error words         |
//!
//! The latest message is always kept. System messages are kept while they fit
//! the result limit, newest first. Exact duplicate texts collapse onto their
//! latest occurrence.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;

use super::engine::{CompressionEngine, EngineFuture, MemoryMetadata, RecallParams};
use crate::provider::{Message, Role};
use crate::session::MemoryHandle;

const RELEVANCE_WEIGHT: f32 = 0.5;
const RECENCY_WEIGHT: f32 = 0.3;
const SALIENCE_WEIGHT: f32 = 0.2;

const STOPWORDS: &[&str] = &[
    "the", "is", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "as",
    "by", "from", "that", "this", "it", "be", "are", "was", "were", "been", "have", "has", "had",
    "i", "you", "we", "do", "does", "what", "how", "can", "me", "my",
];

#[derive(Debug, Clone)]
struct MemoryEntry {
    message: Message,
    position: u64,
}

/// Heuristic importance-based memory.
#[derive(Debug, Default)]
pub struct LocalEngine {
    memories: DashMap<MemoryHandle, Vec<MemoryEntry>>,
}

impl LocalEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions with stored memory.
    pub fn memory_count(&self) -> usize {
        self.memories.len()
    }

    fn select(&self, memory: &MemoryHandle, query: &str, params: RecallParams) -> Vec<Message> {
        let Some(entries) = self.memories.get(memory).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        if entries.is_empty() {
            return Vec::new();
        }

        // Latest occurrence of each distinct (role, text)
        let mut latest: HashMap<(String, String), usize> = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            latest.insert(
                (entry.message.role.to_string(), entry.message.text()),
                i,
            );
        }

        let query_terms = terms(query);
        let last_index = entries.len() - 1;
        let span = last_index.max(1) as f32;

        let mut system = Vec::new();
        let mut scored = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            let key = (entry.message.role.to_string(), entry.message.text());
            if i == last_index || latest.get(&key) != Some(&i) {
                continue;
            }
            if entry.message.role == Role::System {
                system.push(i);
                continue;
            }

            let score = importance(&entry.message, &query_terms, i as f32 / span);
            if score >= params.min_importance {
                scored.push((i, score));
            }
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.0.cmp(&a.0)));

        // Latest message first, then system messages newest first, then scores
        let mut room = params.limit.max(1) - 1;
        let mut keep = vec![last_index];
        let systems = system.len().min(room);
        keep.extend(system.into_iter().rev().take(systems));
        room -= systems;
        keep.extend(scored.into_iter().take(room).map(|(i, _)| i));
        keep.sort_by_key(|i| entries[*i].position);

        keep.into_iter()
            .map(|i| entries[i].message.clone())
            .collect()
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

fn salience(text: &str) -> f32 {
    let mut score: f32 = 0.0;
    if text.chars().any(|c| c.is_ascii_digit()) {
        score += 0.3;
    }
    if text.contains('/') || text.contains("::") || text.contains("->") || text.contains("```") {
        score += 0.4;
    }
    let lower = text.to_lowercase();
    if ["error", "failed", "panic", "exception"]
        .iter()
        .any(|w| lower.contains(w))
    {
        score += 0.3;
    }
    score.min(1.0)
}

fn importance(message: &Message, query_terms: &HashSet<String>, recency: f32) -> f32 {
    let text = message.text();
    let relevance = if query_terms.is_empty() {
        0.0
    } else {
        let own = terms(&text);
        query_terms.intersection(&own).count() as f32 / query_terms.len() as f32
    };

    RELEVANCE_WEIGHT * relevance + RECENCY_WEIGHT * recency + SALIENCE_WEIGHT * salience(&text)
}

impl CompressionEngine for LocalEngine {
    fn remember<'a>(
        &'a self,
        memory: &'a MemoryHandle,
        message: &'a Message,
        metadata: MemoryMetadata,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.memories
                .entry(memory.clone())
                .or_default()
                .push(MemoryEntry {
                    message: message.clone(),
                    position: metadata.position,
                });
            Ok(())
        })
    }

    fn recall<'a>(
        &'a self,
        memory: &'a MemoryHandle,
        query: &'a str,
        params: RecallParams,
    ) -> EngineFuture<'a, Vec<Message>> {
        Box::pin(async move { Ok(self.select(memory, query, params)) })
    }

    fn forget<'a>(&'a self, memory: &'a MemoryHandle) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.memories.remove(memory);
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
