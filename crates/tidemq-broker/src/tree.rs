//! Topic tree with trie-based wildcard matching.
//!
//! One node per `/`-separated token. Wildcard filters live under the
//! literal child keys `+` and `#`. The same tree answers two questions:
//!
//! - [`TopicTree::match_topic`]: which stored *filters* match a concrete
//!   topic (subscription index);
//! - [`TopicTree::search`]: which stored *concrete topics* are matched
//!   by a filter (retained store).
//!
//! Matching rules: `+` matches exactly one non-empty token, `#` matches
//! zero or more trailing tokens and is only valid as the last token, and
//! wildcards never match into a leading `$` token. An empty topic or
//! token is a literal empty token.

use ahash::AHashMap;

/// Check that a filter is well-formed: `#` only as the final token, and
/// wildcard characters only as whole tokens.
pub fn filter_is_valid(filter: &str) -> bool {
    let tokens: Vec<&str> = filter.split('/').collect();
    for (i, token) in tokens.iter().enumerate() {
        match *token {
            "#" => {
                if i != tokens.len() - 1 {
                    return false;
                }
            }
            "+" => {}
            t => {
                if t.contains(['+', '#']) {
                    return false;
                }
            }
        }
    }
    true
}

/// Check if a concrete topic matches a topic filter.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let topic_tokens: Vec<&str> = topic.split('/').collect();
    let filter_tokens: Vec<&str> = filter.split('/').collect();

    // Wildcards must not leak into the reserved namespace.
    let reserved = topic_tokens[0].starts_with('$');

    let mut ti = 0;
    for (fi, filter_token) in filter_tokens.iter().enumerate() {
        match *filter_token {
            "#" => return !(reserved && fi == 0),
            "+" => {
                if reserved && fi == 0 {
                    return false;
                }
                if ti >= topic_tokens.len() || topic_tokens[ti].is_empty() {
                    return false;
                }
                ti += 1;
            }
            token => {
                if ti >= topic_tokens.len() || topic_tokens[ti] != token {
                    return false;
                }
                ti += 1;
            }
        }
    }

    ti == topic_tokens.len()
}

struct Node<T> {
    children: AHashMap<String, Node<T>>,
    values: Vec<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: AHashMap::new(),
            values: Vec::new(),
        }
    }
}

impl<T> Node<T> {
    fn is_empty(&self) -> bool {
        self.values.is_empty() && self.children.is_empty()
    }
}

/// A trie keyed by topic tokens with values bound at terminal nodes.
pub struct TopicTree<T> {
    root: Node<T>,
}

impl<T> Default for TopicTree<T> {
    fn default() -> Self {
        Self {
            root: Node::default(),
        }
    }
}

impl<T: Clone> TopicTree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value under a filter path.
    pub fn add(&mut self, filter: &str, value: T) {
        let mut node = &mut self.root;
        for token in filter.split('/') {
            node = node.children.entry(token.to_string()).or_default();
        }
        node.values.push(value);
    }

    /// Remove values under a filter path for which `pred` holds.
    pub fn remove(&mut self, filter: &str, pred: impl Fn(&T) -> bool) {
        let tokens: Vec<&str> = filter.split('/').collect();
        remove_at(&mut self.root, &tokens, &|values| {
            values.retain(|v| !pred(v));
        });
    }

    /// Replace the values under an exact path with a single value.
    pub fn set(&mut self, topic: &str, value: T) {
        let mut node = &mut self.root;
        for token in topic.split('/') {
            node = node.children.entry(token.to_string()).or_default();
        }
        node.values = vec![value];
    }

    /// Clear all values under an exact path.
    pub fn clear(&mut self, topic: &str) {
        let tokens: Vec<&str> = topic.split('/').collect();
        remove_at(&mut self.root, &tokens, &|values| values.clear());
    }

    /// Keep only values for which `pred` holds, pruning empty nodes.
    pub fn retain(&mut self, pred: impl Fn(&T) -> bool + Copy) {
        retain_node(&mut self.root, pred);
    }

    /// Values of every stored filter matching the given concrete topic.
    pub fn match_topic(&self, topic: &str) -> Vec<T> {
        let tokens: Vec<&str> = topic.split('/').collect();
        let mut out = Vec::new();
        let skip_wildcards = tokens[0].starts_with('$');
        collect_matches(&self.root, &tokens, skip_wildcards, &mut out);
        out
    }

    /// Values stored under every concrete topic that the given filter
    /// matches.
    pub fn search(&self, filter: &str) -> Vec<T> {
        let tokens: Vec<&str> = filter.split('/').collect();
        let mut out = Vec::new();
        search_node(&self.root, &tokens, true, &mut out);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

fn remove_at<T>(node: &mut Node<T>, tokens: &[&str], edit: &impl Fn(&mut Vec<T>)) -> bool {
    match tokens.split_first() {
        None => edit(&mut node.values),
        Some((token, rest)) => {
            if let Some(child) = node.children.get_mut(*token) {
                if remove_at(child, rest, edit) {
                    node.children.remove(*token);
                }
            }
        }
    }
    node.is_empty()
}

fn retain_node<T>(node: &mut Node<T>, pred: impl Fn(&T) -> bool + Copy) -> bool {
    node.values.retain(pred);
    node.children.retain(|_, child| !retain_node(child, pred));
    node.is_empty()
}

fn collect_matches<T: Clone>(
    node: &Node<T>,
    tokens: &[&str],
    skip_wildcards: bool,
    out: &mut Vec<T>,
) {
    // `#` matches zero or more trailing tokens, so it applies here even
    // when the topic continues or ends at this node.
    if !skip_wildcards {
        if let Some(hash) = node.children.get("#") {
            out.extend(hash.values.iter().cloned());
        }
    }

    let Some((token, rest)) = tokens.split_first() else {
        out.extend(node.values.iter().cloned());
        return;
    };

    if !skip_wildcards && !token.is_empty() {
        if let Some(plus) = node.children.get("+") {
            collect_matches(plus, rest, false, out);
        }
    }

    if let Some(child) = node.children.get(*token) {
        collect_matches(child, rest, false, out);
    }
}

fn search_node<T: Clone>(node: &Node<T>, tokens: &[&str], at_root: bool, out: &mut Vec<T>) {
    let Some((token, rest)) = tokens.split_first() else {
        out.extend(node.values.iter().cloned());
        return;
    };

    match *token {
        "#" => {
            out.extend(node.values.iter().cloned());
            for (key, child) in &node.children {
                if at_root && key.starts_with('$') {
                    continue;
                }
                collect_subtree(child, out);
            }
        }
        "+" => {
            for (key, child) in &node.children {
                if key.is_empty() || (at_root && key.starts_with('$')) {
                    continue;
                }
                search_node(child, rest, false, out);
            }
        }
        _ => {
            if let Some(child) = node.children.get(*token) {
                search_node(child, rest, false, out);
            }
        }
    }
}

fn collect_subtree<T: Clone>(node: &Node<T>, out: &mut Vec<T>) {
    out.extend(node.values.iter().cloned());
    for child in node.children.values() {
        collect_subtree(child, out);
    }
}
