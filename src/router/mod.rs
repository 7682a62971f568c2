//! In-process topic matcher for event fan-out.
//!
//! A prefix trie keyed on dot-separated words, matching under AMQP topic
//! semantics: `*` consumes exactly one word, `#` consumes zero or more.
//! Handlers are stored at pattern-terminal nodes and returned de-duplicated
//! by identity, so a handler registered under several overlapping patterns
//! fires at most once per topic.

use std::collections::HashMap;
use std::sync::Arc;

const ONE_WORD: &str = "*";
const MANY_WORDS: &str = "#";

/// Topic-pattern trie mapping routing patterns to handlers.
pub struct TopicRouter<H: ?Sized> {
    root: Node<H>,
}

struct Node<H: ?Sized> {
    children: HashMap<String, Node<H>>,
    handlers: Vec<Arc<H>>,
}

impl<H: ?Sized> Default for Node<H> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            handlers: Vec::new(),
        }
    }
}

impl<H: ?Sized> Default for TopicRouter<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ?Sized> TopicRouter<H> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
        }
    }

    /// Register `handler` under `pattern`.
    pub fn insert(&mut self, pattern: &str, handler: Arc<H>) {
        let mut node = &mut self.root;
        for word in words(pattern) {
            node = node.children.entry(word.to_string()).or_default();
        }
        node.handlers.push(handler);
    }

    /// Remove one registration of `handler` under `pattern`.
    ///
    /// Returns `true` when the pattern no longer holds any handler, so the
    /// caller can drop its broker binding. Empty branches are pruned.
    pub fn remove(&mut self, pattern: &str, handler: &Arc<H>) -> bool {
        let path: Vec<&str> = words(pattern).collect();
        Self::remove_at(&mut self.root, &path, handler)
    }

    fn remove_at(node: &mut Node<H>, path: &[&str], handler: &Arc<H>) -> bool {
        match path.split_first() {
            None => {
                if let Some(pos) = node.handlers.iter().position(|h| Arc::ptr_eq(h, handler)) {
                    node.handlers.remove(pos);
                }
                node.handlers.is_empty()
            }
            Some((word, rest)) => {
                let Some(child) = node.children.get_mut(*word) else {
                    return true;
                };
                let empty = Self::remove_at(child, rest, handler);
                if child.handlers.is_empty() && child.children.is_empty() {
                    node.children.remove(*word);
                }
                empty
            }
        }
    }

    /// All handlers whose patterns match `topic`, each at most once, in
    /// the order they are first encountered.
    pub fn matches(&self, topic: &str) -> Vec<Arc<H>> {
        let parts: Vec<&str> = words(topic).collect();
        let mut found = Vec::new();
        Self::collect(&self.root, &parts, &mut found);

        let mut seen = Vec::new();
        let mut unique = Vec::new();
        for handler in found {
            let ptr = Arc::as_ptr(&handler) as *const ();
            if !seen.contains(&ptr) {
                seen.push(ptr);
                unique.push(handler);
            }
        }
        unique
    }

    fn collect(node: &Node<H>, remaining: &[&str], out: &mut Vec<Arc<H>>) {
        if remaining.is_empty() {
            out.extend(node.handlers.iter().cloned());
            // A trailing `#` still matches zero words.
            if let Some(many) = node.children.get(MANY_WORDS) {
                Self::collect(many, remaining, out);
            }
            return;
        }

        let rest = &remaining[1..];
        if let Some(child) = node.children.get(remaining[0]) {
            Self::collect(child, rest, out);
        }
        if let Some(one) = node.children.get(ONE_WORD) {
            Self::collect(one, rest, out);
        }
        if let Some(many) = node.children.get(MANY_WORDS) {
            // `#` absorbs any number of words, including none.
            for skip in 0..=remaining.len() {
                Self::collect(many, &remaining[skip..], out);
            }
        }
    }
}

fn words(key: &str) -> impl Iterator<Item = &str> {
    key.split('.').filter(|w| !w.is_empty())
}
