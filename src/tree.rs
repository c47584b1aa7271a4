//! The routing tree: a compressed radix tree with priority-ordered children,
//! `:param` and `*catchall` wildcards, and an iterative match that backtracks
//! through skipped wildcard alternatives.
//!
//! Nodes with a common prefix share a parent, and the child lists are kept
//! ordered by priority (the number of registered routes passing through each
//! child) so the most-traveled edges are tried first. A wildcard child, when
//! present, is always the last entry of the list and is not represented in
//! `indices`.

use std::mem;

use crate::params::{Param, Params};
use crate::path::{find_wildcard, longest_common_prefix};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Static,
    Root,
    Param,
    CatchAll,
}

/// A single node of the routing tree. `T` is the value stored at leaf
/// positions; the engine instantiates the tree with its handler chains.
#[derive(Debug)]
pub(crate) struct Node<T> {
    prefix: Vec<u8>,
    // first byte of each non-wildcard child's prefix, in child order
    indices: Vec<u8>,
    children: Vec<Box<Node<T>>>,
    kind: NodeKind,
    wild_child: bool,
    priority: u32,
    value: Option<T>,
    full_path: String,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Node {
            prefix: Vec::new(),
            indices: Vec::new(),
            children: Vec::new(),
            kind: NodeKind::Static,
            wild_child: false,
            priority: 0,
            value: None,
            full_path: String::new(),
        }
    }
}

/// The outcome of a tree lookup. `tsr` signals that the exact path missed
/// but toggling a trailing slash would hit.
pub(crate) struct MatchValue<'n, T> {
    pub(crate) value: Option<&'n T>,
    pub(crate) tsr: bool,
    pub(crate) full_path: &'n str,
}

/// Pooled backtracking state for a tree walk: the stack of skipped wildcard
/// alternatives plus the child-index trail of the walk's current node.
/// Snapshots hold indices rather than node borrows, which is what lets the
/// buffers live in the pooled request context across dispatches.
#[derive(Debug, Default)]
pub(crate) struct SkippedNodes {
    stack: Vec<SkippedNode>,
    trail: Vec<usize>,
}

impl SkippedNodes {
    pub(crate) fn with_capacity(capacity: usize) -> SkippedNodes {
        SkippedNodes {
            stack: Vec::with_capacity(capacity),
            trail: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.stack.clear();
        self.trail.clear();
    }
}

/// Snapshot of a wildcard alternative that was passed over in favour of a
/// static sibling: where in the matched path the node's prefix began, the
/// node's depth within the walk trail, and how many params had been
/// captured at that point.
#[derive(Debug, Clone, Copy)]
struct SkippedNode {
    offset: usize,
    depth: usize,
    params_count: usize,
}

fn decode_value(raw: &[u8], unescape: bool) -> String {
    if unescape {
        if let Ok(decoded) = percent_encoding::percent_decode(raw).decode_utf8() {
            return decoded.into_owned();
        }
        // fall back to the raw capture on undecodable input
    }
    String::from_utf8_lossy(raw).into_owned()
}

fn wildcard_conflict<T>(path: &[u8], full_path: &str, wild: &Node<T>) -> ! {
    let path_seg = if wild.kind == NodeKind::CatchAll {
        String::from_utf8_lossy(path).into_owned()
    } else {
        let end = path.iter().position(|&c| c == b'/').unwrap_or(path.len());
        String::from_utf8_lossy(&path[..end]).into_owned()
    };
    let wild_prefix = String::from_utf8_lossy(&wild.prefix).into_owned();
    let at = full_path.find(&path_seg).unwrap_or(0);

    panic!(
        "'{}' in new path '{}' conflicts with existing wildcard '{}' in existing prefix '{}{}'",
        path_seg,
        full_path,
        wild_prefix,
        &full_path[..at],
        wild_prefix,
    );
}

impl<T> Node<T> {
    /// Registers a value under `path`. Not concurrency-safe; the tree is
    /// built before serving starts. Any conflict with previously registered
    /// routes panics, naming the offending path.
    pub(crate) fn add_route(&mut self, path: &str, value: T) {
        self.priority += 1;

        // Empty tree
        if self.prefix.is_empty() && self.children.is_empty() {
            self.insert_child(path.as_bytes(), path, value);
            self.kind = NodeKind::Root;
            return;
        }

        self.walk_route(path.as_bytes(), path, value, 0);
    }

    fn walk_route(&mut self, path: &[u8], full_path: &str, value: T, mut parent_len: usize) {
        // Find the longest common prefix.
        // This also implies that the common prefix contains no ':' or '*'
        // since the existing key can't contain those chars.
        let i = longest_common_prefix(path, &self.prefix);

        // Split edge
        if i < self.prefix.len() {
            let child = Node {
                prefix: self.prefix[i..].to_vec(),
                wild_child: self.wild_child,
                kind: NodeKind::Static,
                indices: mem::take(&mut self.indices),
                children: mem::take(&mut self.children),
                value: self.value.take(),
                priority: self.priority - 1,
                full_path: mem::take(&mut self.full_path),
            };

            self.children = vec![Box::new(child)];
            self.indices = vec![self.prefix[i]];
            self.prefix.truncate(i);
            self.wild_child = false;
            self.full_path =
                String::from_utf8_lossy(&full_path.as_bytes()[..parent_len + i]).into_owned();
        }

        // Make new node a child of this node
        if i < path.len() {
            let path = &path[i..];
            let c = path[0];

            // '/' after param
            if self.kind == NodeKind::Param && c == b'/' && self.children.len() == 1 {
                parent_len += self.prefix.len();
                let child = &mut self.children[0];
                child.priority += 1;
                return child.walk_route(path, full_path, value, parent_len);
            }

            // Check if a child with the next path byte exists
            for k in 0..self.indices.len() {
                if self.indices[k] == c {
                    parent_len += self.prefix.len();
                    let k = self.increment_child_priority(k);
                    return self.children[k].walk_route(path, full_path, value, parent_len);
                }
            }

            // Otherwise insert it
            if c != b':' && c != b'*' && self.kind != NodeKind::CatchAll {
                self.indices.push(c);
                let child = Box::new(Node {
                    full_path: full_path.to_string(),
                    ..Node::default()
                });
                self.add_child(child);
                let k = self.increment_child_priority(self.indices.len() - 1);
                return self.children[k].insert_child(path, full_path, value);
            }

            if self.wild_child {
                // inserting a wildcard node; check whether it collides with
                // the one already registered here
                parent_len += self.prefix.len();
                let last = self.children.len() - 1;
                let wild = &mut self.children[last];
                wild.priority += 1;

                if path.len() >= wild.prefix.len()
                    && wild.prefix[..] == path[..wild.prefix.len()]
                    // adding a child to a catch-all is not possible
                    && wild.kind != NodeKind::CatchAll
                    // check for longer wildcard, e.g. :name and :names
                    && (wild.prefix.len() >= path.len() || path[wild.prefix.len()] == b'/')
                {
                    return wild.walk_route(path, full_path, value, parent_len);
                }

                wildcard_conflict(path, full_path, wild);
            }

            return self.insert_child(path, full_path, value);
        }

        // Otherwise register the value at the current node
        if self.value.is_some() {
            panic!("handlers are already registered for path '{}'", full_path);
        }
        self.value = Some(value);
        self.full_path = full_path.to_string();
    }

    // Adds a child node, keeping the wildcard child at the end of the list.
    fn add_child(&mut self, child: Box<Node<T>>) {
        if self.wild_child && !self.children.is_empty() {
            let last = self.children.len() - 1;
            self.children.insert(last, child);
        } else {
            self.children.push(child);
        }
    }

    // Increments the priority of the given child and reorders if necessary.
    fn increment_child_priority(&mut self, pos: usize) -> usize {
        self.children[pos].priority += 1;
        let priority = self.children[pos].priority;

        // move forward past lower-priority siblings
        let mut new_pos = pos;
        while new_pos > 0 && self.children[new_pos - 1].priority < priority {
            self.children.swap(new_pos - 1, new_pos);
            new_pos -= 1;
        }

        // keep the index bytes aligned with the child order
        if new_pos != pos {
            let moved = self.indices.remove(pos);
            self.indices.insert(new_pos, moved);
        }

        new_pos
    }

    fn insert_child(&mut self, path: &[u8], full_path: &str, value: T) {
        let (wildcard, i, valid) = match find_wildcard(path) {
            Some(found) => found,
            None => {
                // If no wildcard was found, simply insert the path and value
                self.prefix = path.to_vec();
                self.value = Some(value);
                self.full_path = full_path.to_string();
                return;
            }
        };

        if !valid {
            panic!(
                "only one wildcard per path segment is allowed, has: '{}' in path '{}'",
                String::from_utf8_lossy(wildcard),
                full_path,
            );
        }

        if wildcard.len() < 2 {
            panic!(
                "wildcards must be named with a non-empty name in path '{}'",
                full_path
            );
        }

        if wildcard[0] == b':' {
            // param
            let mut path = path;
            if i > 0 {
                // insert prefix before the current wildcard
                self.prefix = path[..i].to_vec();
                path = &path[i..];
            }

            let child = Box::new(Node {
                kind: NodeKind::Param,
                prefix: wildcard.to_vec(),
                full_path: full_path.to_string(),
                ..Node::default()
            });
            self.add_child(child);
            self.wild_child = true;

            let last = self.children.len() - 1;
            let child = &mut self.children[last];
            child.priority += 1;

            // If the path doesn't end with the wildcard, then there will be
            // another subpath starting with '/'
            if wildcard.len() < path.len() {
                let rest = &path[wildcard.len()..];
                let grandchild = Box::new(Node {
                    priority: 1,
                    full_path: full_path.to_string(),
                    ..Node::default()
                });
                child.children.push(grandchild);
                return child.children[0].insert_child(rest, full_path, value);
            }

            // Otherwise we're done. Insert the value in the new leaf
            child.value = Some(value);
            return;
        }

        // catch-all
        if i + wildcard.len() != path.len() {
            panic!(
                "catch-all routes are only allowed at the end of the path in path '{}'",
                full_path
            );
        }

        if self.prefix.last() == Some(&b'/') {
            panic!(
                "catch-all conflicts with existing handle for the path segment root in path '{}'",
                full_path
            );
        }

        // the byte before the catch-all must be a '/'
        if i == 0 || path[i - 1] != b'/' {
            panic!("no / before catch-all in path '{}'", full_path);
        }
        let i = i - 1;

        self.prefix = path[..i].to_vec();

        // first node: catch-all node with empty prefix
        let stub = Box::new(Node {
            wild_child: true,
            kind: NodeKind::CatchAll,
            full_path: full_path.to_string(),
            ..Node::default()
        });
        self.add_child(stub);
        self.indices = vec![b'/'];
        let last = self.children.len() - 1;
        let stub = &mut self.children[last];
        stub.priority += 1;

        // second node: node holding the value
        let terminal = Box::new(Node {
            prefix: path[i..].to_vec(),
            kind: NodeKind::CatchAll,
            value: Some(value),
            priority: 1,
            full_path: full_path.to_string(),
            ..Node::default()
        });
        stub.children = vec![terminal];
    }

    /// Looks up the value registered for `path`, writing wildcard captures
    /// into `params` (when given) in path order. Static branches are
    /// preferred; wildcard siblings that were passed over are pushed onto
    /// `skipped` and retried if the static branch dead-ends. If no value can
    /// be found, a TSR (trailing slash redirect) recommendation is made if a
    /// value exists with (without) a trailing slash for the given path.
    pub(crate) fn get_value<'n>(
        &'n self,
        path: &str,
        mut params: Option<&mut Params>,
        skipped: &mut SkippedNodes,
        unescape: bool,
    ) -> MatchValue<'n, T> {
        skipped.clear();

        let full = path.as_bytes();
        let mut n = self;
        let mut pos = 0usize;
        let mut params_count = 0usize;
        let mut force_wild = false;
        let mut value = MatchValue {
            value: None,
            tsr: false,
            full_path: "",
        };

        'walk: loop {
            let prefix: &[u8] = &n.prefix;
            let rest = &full[pos..];

            if rest.len() > prefix.len() && rest[..prefix.len()] == *prefix {
                let start = pos;
                pos += prefix.len();
                let path = &full[pos..];

                if !force_wild {
                    // Try all the non-wildcard children first by matching the
                    // indices
                    let idxc = path[0];
                    for (k, &c) in n.indices.iter().enumerate() {
                        if c == idxc {
                            // remember the wildcard alternative before
                            // committing to the static branch
                            if n.wild_child {
                                skipped.stack.push(SkippedNode {
                                    offset: start,
                                    depth: skipped.trail.len(),
                                    params_count,
                                });
                            }
                            skipped.trail.push(k);
                            n = &n.children[k];
                            continue 'walk;
                        }
                    }
                }
                force_wild = false;

                if !n.wild_child {
                    // the static branch dead-ended; retry from the most
                    // recently skipped wildcard before giving up
                    if path != [b'/'] {
                        if let Some((node, skip)) = self.backtrack(skipped, pos) {
                            pos = skip.offset;
                            n = node;
                            if let Some(ps) = params.as_mut() {
                                ps.truncate(skip.params_count);
                            }
                            params_count = skip.params_count;
                            force_wild = true;
                            continue 'walk;
                        }
                    }

                    // Nothing found.
                    // We can recommend to redirect to the same URL without a
                    // trailing slash if a leaf exists for that path.
                    value.tsr = path == [b'/'] && n.value.is_some();
                    return value;
                }

                // handle the wildcard child, which is always at the end of
                // the child list
                let last = n.children.len() - 1;
                skipped.trail.push(last);
                n = &n.children[last];
                params_count += 1;

                match n.kind {
                    NodeKind::Param => {
                        // find param end (either '/' or path end)
                        let mut end = 0;
                        while end < path.len() && path[end] != b'/' {
                            end += 1;
                        }

                        // save param value
                        if let Some(ps) = params.as_mut() {
                            let key = String::from_utf8_lossy(&n.prefix[1..]).into_owned();
                            ps.push(Param::new(key, decode_value(&path[..end], unescape)));
                        }

                        // we need to go deeper!
                        if end < path.len() {
                            if !n.children.is_empty() {
                                pos += end;
                                skipped.trail.push(0);
                                n = &n.children[0];
                                continue 'walk;
                            }

                            // ... but we can't
                            value.tsr = path.len() == end + 1;
                            return value;
                        }

                        if let Some(v) = &n.value {
                            value.value = Some(v);
                            value.full_path = &n.full_path;
                            return value;
                        }
                        if n.children.len() == 1 {
                            // No value found. Check if a value for this path
                            // plus a trailing slash exists for TSR
                            // recommendation
                            let child = &n.children[0];
                            value.tsr = (child.prefix == b"/" && child.value.is_some())
                                || (child.prefix.is_empty() && child.indices == b"/");
                        }
                        return value;
                    }
                    NodeKind::CatchAll => {
                        // save param value; the '/' in front of the catch-all
                        // only separates it from the parent segment
                        if let Some(ps) = params.as_mut() {
                            let key = String::from_utf8_lossy(&n.prefix[2..]).into_owned();
                            let raw = match path.first() {
                                Some(&b'/') => &path[1..],
                                _ => path,
                            };
                            ps.push(Param::new(key, decode_value(raw, unescape)));
                        }

                        value.value = n.value.as_ref();
                        value.full_path = &n.full_path;
                        return value;
                    }
                    _ => unreachable!("invalid node kind"),
                }
            } else if rest == prefix {
                // The value may sit behind a wildcard that was skipped in
                // favour of this now-valueless static branch
                if n.value.is_none() && rest != [b'/'] {
                    if let Some((node, skip)) = self.backtrack(skipped, pos) {
                        pos = skip.offset;
                        n = node;
                        if let Some(ps) = params.as_mut() {
                            ps.truncate(skip.params_count);
                        }
                        params_count = skip.params_count;
                        force_wild = true;
                        continue 'walk;
                    }
                }

                // We should have reached the node containing the value.
                // Check if this node has a value registered.
                if let Some(v) = &n.value {
                    value.value = Some(v);
                    value.full_path = &n.full_path;
                    return value;
                }

                // If there is no value for this route, but this route has a
                // wildcard child, there must be a value for this path with an
                // additional trailing slash
                if rest == [b'/'] && n.wild_child && n.kind != NodeKind::Root {
                    value.tsr = true;
                    return value;
                }
                if rest == [b'/'] && n.kind == NodeKind::Static {
                    value.tsr = true;
                    return value;
                }

                // No value found. Check if a value for this path + a trailing
                // slash exists for trailing slash recommendation
                for (k, &c) in n.indices.iter().enumerate() {
                    if c == b'/' {
                        let child = &n.children[k];
                        value.tsr = (child.prefix.len() == 1 && child.value.is_some())
                            || (child.kind == NodeKind::CatchAll
                                && child.children[0].value.is_some());
                        return value;
                    }
                }

                return value;
            }

            // Nothing found. We can recommend to redirect to the same URL
            // with an extra trailing slash if a leaf exists for that path
            value.tsr = rest == [b'/']
                || (prefix.len() == rest.len() + 1
                    && prefix[rest.len()] == b'/'
                    && *rest == prefix[..prefix.len() - 1]
                    && n.value.is_some());

            if !value.tsr && rest != [b'/'] {
                if let Some((node, skip)) = self.backtrack(skipped, pos) {
                    pos = skip.offset;
                    n = node;
                    if let Some(ps) = params.as_mut() {
                        ps.truncate(skip.params_count);
                    }
                    params_count = skip.params_count;
                    force_wild = true;
                    continue 'walk;
                }
            }

            return value;
        }
    }

    // Pops the most recent viable snapshot and re-resolves its node by
    // replaying the child-index trail from the root. The walk only ever
    // truncates the trail back to a snapshot's depth, so the leading
    // `depth` entries still describe the snapshot node's position.
    fn backtrack<'n>(
        &'n self,
        skipped: &mut SkippedNodes,
        pos: usize,
    ) -> Option<(&'n Node<T>, SkippedNode)> {
        while let Some(skip) = skipped.stack.pop() {
            if skip.offset <= pos && skip.depth <= skipped.trail.len() {
                skipped.trail.truncate(skip.depth);
                let mut node = self;
                for &k in &skipped.trail {
                    node = &node.children[k];
                }
                return Some((node, skip));
            }
        }
        None
    }

    /// Collects the full paths of every registered leaf below this node.
    pub(crate) fn collect_routes(&self, out: &mut Vec<String>) {
        if self.value.is_some() {
            out.push(self.full_path.clone());
        }
        for child in &self.children {
            child.collect_routes(out);
        }
    }

    /// Makes a case-insensitive lookup of the given path and tries to find a
    /// registered route, optionally also repairing trailing slashes. Returns
    /// the case-corrected path on success.
    pub(crate) fn find_case_insensitive_path(
        &self,
        path: &str,
        fix_trailing_slash: bool,
    ) -> Option<String> {
        let mut insensitive_path = Vec::with_capacity(path.len() + 1);
        if self.walk_case_insensitive(
            path.as_bytes(),
            &mut insensitive_path,
            [0; 4],
            fix_trailing_slash,
        ) {
            Some(String::from_utf8_lossy(&insensitive_path).into_owned())
        } else {
            None
        }
    }

    fn walk_case_insensitive(
        &self,
        mut path: &[u8],
        insensitive_path: &mut Vec<u8>,
        mut buf: [u8; 4],
        fix_trailing_slash: bool,
    ) -> bool {
        let lower_path: &[u8] = &path.to_ascii_lowercase();
        if lower_path.len() >= self.prefix.len()
            && (self.prefix.is_empty()
                || lower_path[1..self.prefix.len()].eq_ignore_ascii_case(&self.prefix[1..]))
        {
            insensitive_path.extend_from_slice(&self.prefix);

            path = &path[self.prefix.len()..];

            if !path.is_empty() {
                let cached_lower_path = <&[u8]>::clone(&lower_path);

                // try the static children by the index bytes first
                // skip char bytes already processed
                buf = shift_n_bytes(buf, self.prefix.len());

                if buf[0] != 0 {
                    // old char not finished
                    for k in 0..self.indices.len() {
                        if self.indices[k] == buf[0] {
                            // continue with child node
                            if self.children[k].walk_case_insensitive(
                                path,
                                insensitive_path,
                                buf,
                                fix_trailing_slash,
                            ) {
                                return true;
                            }
                            truncate_to_prev(insensitive_path, &self.children[k].prefix);
                            break;
                        }
                    }
                } else {
                    // process a new char
                    let mut current_char = 0 as char;

                    // find char start; chars are up to 4 bytes long,
                    // -4 would definitely be another char
                    let mut off = 0;
                    for j in 0..self.prefix.len().min(3) {
                        let i = self.prefix.len() - j;
                        if char_start(cached_lower_path[i]) {
                            // read char from cached path
                            current_char = String::from_utf8_lossy(&cached_lower_path[i..])
                                .chars()
                                .next()
                                .unwrap_or('\0');
                            off = j;
                            break;
                        }
                    }

                    current_char.encode_utf8(&mut buf);

                    // skip already processed bytes
                    buf = shift_n_bytes(buf, off);

                    for k in 0..self.indices.len() {
                        // lowercase matches
                        if self.indices[k] == buf[0] {
                            // must use a recursive approach since both the
                            // uppercase byte and the lowercase byte might
                            // exist as an index
                            if self.children[k].walk_case_insensitive(
                                path,
                                insensitive_path,
                                buf,
                                fix_trailing_slash,
                            ) {
                                return true;
                            }
                            truncate_to_prev(insensitive_path, &self.children[k].prefix);
                            break;
                        }
                    }

                    // same for uppercase char, if it differs
                    let up = current_char.to_ascii_uppercase();
                    if up != current_char {
                        up.encode_utf8(&mut buf);
                        buf = shift_n_bytes(buf, off);

                        for k in 0..self.indices.len() {
                            if self.indices[k] == buf[0] {
                                if self.children[k].walk_case_insensitive(
                                    path,
                                    insensitive_path,
                                    buf,
                                    fix_trailing_slash,
                                ) {
                                    return true;
                                }
                                truncate_to_prev(insensitive_path, &self.children[k].prefix);
                                break;
                            }
                        }
                    }
                }

                // nothing found among the static children; fall back to the
                // wildcard child if there is one
                if self.wild_child {
                    let last = self.children.len() - 1;
                    return self.children[last].walk_case_insensitive_wild(
                        path,
                        insensitive_path,
                        buf,
                        fix_trailing_slash,
                    );
                }

                // Nothing found. We can recommend to redirect to the same URL
                // without a trailing slash if a leaf exists for that path
                return fix_trailing_slash && path == [b'/'] && self.value.is_some();
            }

            // We should have reached the node containing the value.
            // Check if this node has a value registered.
            if self.value.is_some() {
                return true;
            }

            // No value found.
            // Try to fix the path by adding a trailing slash
            if fix_trailing_slash {
                for k in 0..self.indices.len() {
                    if self.indices[k] == b'/' {
                        let child = &self.children[k];
                        if (child.prefix.len() == 1 && child.value.is_some())
                            || (child.kind == NodeKind::CatchAll
                                && child.children[0].value.is_some())
                        {
                            insensitive_path.push(b'/');
                            return true;
                        }
                        return false;
                    }
                }
            }
            return false;
        }

        // Nothing found.
        // Try to fix the path by adding / removing a trailing slash
        if fix_trailing_slash {
            if path == [b'/'] {
                return true;
            }
            if lower_path.len() + 1 == self.prefix.len()
                && self.prefix[lower_path.len()] == b'/'
                && lower_path[1..].eq_ignore_ascii_case(&self.prefix[1..lower_path.len()])
                && self.value.is_some()
            {
                insensitive_path.extend_from_slice(&self.prefix);
                return true;
            }
        }

        false
    }

    fn walk_case_insensitive_wild(
        &self,
        mut path: &[u8],
        insensitive_path: &mut Vec<u8>,
        buf: [u8; 4],
        fix_trailing_slash: bool,
    ) -> bool {
        match self.kind {
            NodeKind::Param => {
                // find param end (either '/' or path end)
                let mut end = 0;
                while end < path.len() && path[end] != b'/' {
                    end += 1;
                }

                // add param value to case insensitive path
                insensitive_path.extend_from_slice(&path[..end]);

                if end < path.len() {
                    if !self.children.is_empty() {
                        path = &path[end..];

                        return self.children[0].walk_case_insensitive(
                            path,
                            insensitive_path,
                            buf,
                            fix_trailing_slash,
                        );
                    }

                    // ... but we can't
                    if fix_trailing_slash && path.len() == end + 1 {
                        return true;
                    }
                    return false;
                }

                if self.value.is_some() {
                    return true;
                }
                if fix_trailing_slash && self.children.len() == 1 {
                    // No value found. Check if a value for this path plus a
                    // trailing slash exists
                    let child = &self.children[0];
                    if child.prefix == b"/" && child.value.is_some() {
                        insensitive_path.push(b'/');
                        return true;
                    }
                }

                false
            }
            NodeKind::CatchAll => {
                insensitive_path.extend_from_slice(path);
                true
            }
            _ => unreachable!("invalid node kind"),
        }
    }
}

// Shift bytes in array by n bytes left
fn shift_n_bytes(bytes: [u8; 4], n: usize) -> [u8; 4] {
    match n {
        0 => bytes,
        1 => [bytes[1], bytes[2], bytes[3], 0],
        2 => [bytes[2], bytes[3], 0, 0],
        3 => [bytes[3], 0, 0, 0],
        _ => [0; 4],
    }
}

// Reports whether the byte could be the first byte of an encoded,
// possibly invalid char. Second and subsequent bytes always have
// the top two bits set to 10.
fn char_start(b: u8) -> bool {
    b & 0xC0 != 0x80
}

// Drops a failed child attempt's bytes from the corrected-path buffer.
fn truncate_to_prev(insensitive_path: &mut Vec<u8>, child_prefix: &[u8]) {
    if insensitive_path.len() > child_prefix.len() {
        let prev_len = insensitive_path.len() - child_prefix.len();
        insensitive_path.truncate(prev_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;
    use std::sync::Mutex;

    struct TestRequest {
        path: &'static str,
        miss: bool,
        route: &'static str,
        params: Vec<(&'static str, &'static str)>,
    }

    impl TestRequest {
        fn new(
            path: &'static str,
            miss: bool,
            route: &'static str,
            params: Vec<(&'static str, &'static str)>,
        ) -> TestRequest {
            TestRequest {
                path,
                miss,
                route,
                params,
            }
        }
    }

    fn check_requests(tree: &Node<&'static str>, requests: Vec<TestRequest>) {
        for request in requests {
            let mut params = Params::default();
            let mut skipped = SkippedNodes::default();
            let value = tree.get_value(request.path, Some(&mut params), &mut skipped, false);

            match value.value {
                None => assert!(
                    request.miss,
                    "expected a value for route '{}'",
                    request.path
                ),
                Some(route) => {
                    assert!(!request.miss, "unexpected value for route '{}'", request.path);
                    assert_eq!(
                        *route, request.route,
                        "wrong value for route '{}'",
                        request.path
                    );
                    assert_eq!(
                        value.full_path, request.route,
                        "wrong full path for route '{}'",
                        request.path
                    );
                }
            }

            let expected: Params = request
                .params
                .iter()
                .map(|(k, v)| Param::new(*k, *v))
                .collect();
            assert_eq!(params, expected, "wrong params for route '{}'", request.path);
        }
    }

    fn check_priorities<T>(n: &Node<T>) -> u32 {
        let mut priority = 0;
        for child in &n.children {
            priority += check_priorities(child);
        }

        if n.value.is_some() {
            priority += 1;
        }

        assert_eq!(
            n.priority,
            priority,
            "priority mismatch for node '{}'",
            String::from_utf8_lossy(&n.prefix)
        );

        priority
    }

    fn check_order(n: &Node<&'static str>) {
        // a param node's single continuation child is positional, not indexed
        if n.kind != NodeKind::Param {
            let statics = n.children.len() - usize::from(n.wild_child);
            assert_eq!(
                n.indices.len(),
                statics,
                "indices out of sync at '{}'",
                String::from_utf8_lossy(&n.prefix)
            );

            for k in 0..statics {
                // a catch-all stub child has an empty prefix behind its index
                if !n.children[k].prefix.is_empty() {
                    assert_eq!(
                        n.indices[k], n.children[k].prefix[0],
                        "index byte does not match child prefix"
                    );
                }
                if k > 0 {
                    assert!(
                        n.children[k - 1].priority >= n.children[k].priority,
                        "children not ordered by priority"
                    );
                }
            }
        }

        for child in &n.children {
            check_order(child);
        }
    }

    #[test]
    fn test_tree_add_and_get() {
        let mut tree = Node::default();

        let routes = vec![
            "/hi",
            "/contact",
            "/co",
            "/c",
            "/a",
            "/ab",
            "/doc/",
            "/doc/go_faq.html",
            "/doc/go1.html",
            "/α",
            "/β",
        ];

        for route in routes {
            tree.add_route(route, route);
        }

        check_requests(
            &tree,
            vec![
                TestRequest::new("/a", false, "/a", vec![]),
                TestRequest::new("/", true, "", vec![]),
                TestRequest::new("/hi", false, "/hi", vec![]),
                TestRequest::new("/contact", false, "/contact", vec![]),
                TestRequest::new("/co", false, "/co", vec![]),
                TestRequest::new("/con", true, "", vec![]),  // key mismatch
                TestRequest::new("/cona", true, "", vec![]), // key mismatch
                TestRequest::new("/no", true, "", vec![]),   // no matching child
                TestRequest::new("/ab", false, "/ab", vec![]),
                TestRequest::new("/α", false, "/α", vec![]),
                TestRequest::new("/β", false, "/β", vec![]),
            ],
        );

        check_priorities(&tree);
        check_order(&tree);
    }

    #[test]
    fn test_tree_wildcard() {
        let mut tree = Node::default();

        let routes = vec![
            "/",
            "/cmd/:tool/:sub",
            "/cmd/:tool/",
            "/src/*filepath",
            "/search/",
            "/search/:query",
            "/user_:name",
            "/user_:name/about",
            "/files/:dir/*filepath",
            "/doc/",
            "/doc/go_faq.html",
            "/doc/go1.html",
            "/info/:user/public",
            "/info/:user/project/:project",
        ];

        for route in routes {
            tree.add_route(route, route);
        }

        check_requests(
            &tree,
            vec![
                TestRequest::new("/", false, "/", vec![]),
                TestRequest::new("/cmd/test/", false, "/cmd/:tool/", vec![("tool", "test")]),
                TestRequest::new("/cmd/test", true, "", vec![("tool", "test")]),
                TestRequest::new(
                    "/cmd/test/3",
                    false,
                    "/cmd/:tool/:sub",
                    vec![("tool", "test"), ("sub", "3")],
                ),
                TestRequest::new("/src/", false, "/src/*filepath", vec![("filepath", "")]),
                TestRequest::new(
                    "/src/some/file.png",
                    false,
                    "/src/*filepath",
                    vec![("filepath", "some/file.png")],
                ),
                TestRequest::new("/search/", false, "/search/", vec![]),
                TestRequest::new(
                    "/search/someth!ng+in+ünìcodé",
                    false,
                    "/search/:query",
                    vec![("query", "someth!ng+in+ünìcodé")],
                ),
                TestRequest::new(
                    "/search/someth!ng+in+ünìcodé/",
                    true,
                    "",
                    vec![("query", "someth!ng+in+ünìcodé")],
                ),
                TestRequest::new("/user_rustacean", false, "/user_:name", vec![("name", "rustacean")]),
                TestRequest::new(
                    "/user_rustacean/about",
                    false,
                    "/user_:name/about",
                    vec![("name", "rustacean")],
                ),
                TestRequest::new(
                    "/files/js/inc/framework.js",
                    false,
                    "/files/:dir/*filepath",
                    vec![("dir", "js"), ("filepath", "inc/framework.js")],
                ),
                TestRequest::new(
                    "/info/gordon/public",
                    false,
                    "/info/:user/public",
                    vec![("user", "gordon")],
                ),
                TestRequest::new(
                    "/info/gordon/project/go",
                    false,
                    "/info/:user/project/:project",
                    vec![("user", "gordon"), ("project", "go")],
                ),
            ],
        );

        check_priorities(&tree);
        check_order(&tree);
    }

    #[test]
    fn test_tree_backtracks_to_skipped_wildcard() {
        let mut tree = Node::default();

        let routes = vec![
            "/foo/bar",
            "/foo/:name",
            "/t/static/:x/end",
            "/t/:y/other",
            "/u/:a/x/p",
            "/u/:a/:b/q",
        ];

        for route in routes {
            tree.add_route(route, route);
        }

        check_requests(
            &tree,
            vec![
                // static branch wins when it matches exactly
                TestRequest::new("/foo/bar", false, "/foo/bar", vec![]),
                // falls back to the wildcard sibling
                TestRequest::new("/foo/baz", false, "/foo/:name", vec![("name", "baz")]),
                // captures from the abandoned static branch are rolled back
                TestRequest::new(
                    "/t/static/val/end",
                    false,
                    "/t/static/:x/end",
                    vec![("x", "val")],
                ),
                TestRequest::new("/t/static/val/other", false, "/t/:y/other", vec![("y", "static")]),
                TestRequest::new("/u/A/x/p", false, "/u/:a/x/p", vec![("a", "A")]),
                TestRequest::new(
                    "/u/A/x/q",
                    false,
                    "/u/:a/:b/q",
                    vec![("a", "A"), ("b", "x")],
                ),
                TestRequest::new(
                    "/u/A/y/q",
                    false,
                    "/u/:a/:b/q",
                    vec![("a", "A"), ("b", "y")],
                ),
                // the failed lookup still leaves the rolled-back captures
                TestRequest::new("/u/A/x/nope", true, "", vec![("a", "A"), ("b", "x")]),
            ],
        );

        check_priorities(&tree);
        check_order(&tree);
    }

    #[test]
    fn test_unescape_param_values() {
        let mut tree = Node::default();
        tree.add_route("/files/:name", "/files/:name");
        tree.add_route("/raw/*blob", "/raw/*blob");

        let mut params = Params::default();
        let mut skipped = SkippedNodes::default();
        let value = tree.get_value("/files/hello%20world", Some(&mut params), &mut skipped, true);
        assert!(value.value.is_some());
        assert_eq!(params.get("name"), Some("hello world"));

        params.clear();
        let value = tree.get_value("/raw/a%2Fb/c", Some(&mut params), &mut skipped, true);
        assert!(value.value.is_some());
        assert_eq!(params.get("blob"), Some("a/b/c"));

        // undecodable sequences keep the raw capture
        params.clear();
        let value = tree.get_value("/files/bad%ff%fe", Some(&mut params), &mut skipped, true);
        assert!(value.value.is_some());
        assert_eq!(params.get("name"), Some("bad%ff%fe"));
    }

    #[test]
    fn test_tree_registration_priorities() {
        let mut tree = Node::default();

        // the /ab subtree accumulates more routes than /ac, so the 'b' edge
        // must be tried first
        tree.add_route("/a", "/a");
        tree.add_route("/ab/x", "/ab/x");
        tree.add_route("/ab/y", "/ab/y");
        tree.add_route("/ab/z", "/ab/z");
        tree.add_route("/ac/x", "/ac/x");

        check_priorities(&tree);
        check_order(&tree);

        // root -> "/a" -> children ordered 'b' before 'c'
        let a = &tree;
        assert_eq!(a.indices[0], b'b');
        assert!(a.children[0].priority > a.children[1].priority);
    }

    type TestRoute = (&'static str, bool);

    fn test_routes(routes: Vec<TestRoute>) {
        let tree = Mutex::new(Node::default());

        for route in routes {
            let recv = panic::catch_unwind(|| {
                let mut guard = match tree.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.add_route(route.0, ());
            });

            if route.1 {
                assert!(recv.is_err(), "no panic for conflicting route '{}'", route.0);
            } else {
                assert!(
                    recv.is_ok(),
                    "unexpected panic for route '{}': {:?}",
                    route.0,
                    recv
                );
            }
        }
    }

    #[test]
    fn test_tree_wildcard_conflict() {
        let routes = vec![
            ("/cmd/:tool/:sub", false),
            ("/cmd/vet", false),
            ("/foo/bar", false),
            ("/foo/:name", false),
            ("/foo/:names", true),
            ("/cmd/*path", true),
            ("/cmd/:badvar", true),
            ("/cmd/:tool/names", false),
            ("/cmd/:tool/:badsub/details", true),
            ("/src/*filepath", false),
            ("/src/:file", true),
            ("/src/static.json", true),
            ("/src/*filepathx", true),
            ("/src/", true),
            ("/src/foo/bar", true),
            ("/src1/", false),
            ("/src1/*filepath", true),
            ("/src2*filepath", true),
            ("/search/:query", false),
            ("/search/valid", false),
            ("/user_:name", false),
            ("/user_x", false),
            ("/user_:bar", true),
            ("/id:id", false),
            ("/id/:id", false),
        ];
        test_routes(routes);
    }

    #[test]
    fn test_tree_duplicate_path() {
        let tree = Mutex::new(Node::default());

        let routes = vec!["/", "/doc/", "/src/*filepath", "/search/:query", "/user_:name"];

        for route in routes {
            let mut recv = panic::catch_unwind(|| {
                let mut guard = match tree.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.add_route(route, route);
            });
            assert!(recv.is_ok(), "panic inserting route '{}': {:?}", route, recv);

            recv = panic::catch_unwind(|| {
                let mut guard = match tree.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.add_route(route, route);
            });
            assert!(recv.is_err(), "no panic while inserting duplicate route '{}'", route);
        }

        check_requests(
            &tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
            vec![
                TestRequest::new("/", false, "/", vec![]),
                TestRequest::new("/doc/", false, "/doc/", vec![]),
                TestRequest::new(
                    "/src/some/file.png",
                    false,
                    "/src/*filepath",
                    vec![("filepath", "some/file.png")],
                ),
                TestRequest::new(
                    "/search/someth!ng+in+ünìcodé",
                    false,
                    "/search/:query",
                    vec![("query", "someth!ng+in+ünìcodé")],
                ),
                TestRequest::new(
                    "/user_rustacean",
                    false,
                    "/user_:name",
                    vec![("name", "rustacean")],
                ),
            ],
        );
    }

    #[test]
    fn test_empty_wildcard_name() {
        let tree = Mutex::new(Node::default());
        let routes = vec!["/user:", "/user:/", "/cmd/:/", "/src/*"];

        for route in routes {
            let recv = panic::catch_unwind(|| {
                let mut guard = match tree.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.add_route(route, route);
            });

            assert!(
                recv.is_err(),
                "no panic while inserting route with empty wildcard name '{}'",
                route
            );
        }
    }

    #[test]
    fn test_tree_catch_all_conflict() {
        let routes = vec![
            ("/src/*filepath/x", true),
            ("/src2/", false),
            ("/src2/*filepath/x", true),
        ];

        test_routes(routes);
    }

    #[test]
    fn test_tree_catch_all_conflict_root() {
        let routes = vec![("/", false), ("/*filepath", true)];

        test_routes(routes);
    }

    #[test]
    fn test_tree_double_wildcard() {
        let routes = vec!["/:foo:bar", "/:foo:bar/", "/:foo*bar"];

        for route in routes {
            let tree = Mutex::new(Node::default());
            let recv = panic::catch_unwind(|| {
                let mut guard = match tree.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.add_route(route, route);
            });

            assert!(
                recv.is_err(),
                "no panic while inserting double wildcard route '{}'",
                route
            );
        }
    }

    #[test]
    fn test_tree_trailing_slash_redirect() {
        let tree = Mutex::new(Node::default());
        let routes = vec![
            "/hi",
            "/b/",
            "/search/:query",
            "/cmd/:tool/",
            "/src/*filepath",
            "/x",
            "/x/y",
            "/y/",
            "/y/z",
            "/0/:id",
            "/0/:id/1",
            "/1/:id/",
            "/1/:id/2",
            "/aa",
            "/a/",
            "/admin",
            "/admin/:category",
            "/admin/:category/:page",
            "/doc",
            "/doc/go_faq.html",
            "/doc/go1.html",
            "/no/a",
            "/no/b",
            "/api/hello/:name",
        ];

        for route in routes {
            let recv = panic::catch_unwind(|| {
                let mut guard = match tree.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.add_route(route, route);
            });
            assert!(recv.is_ok(), "panic inserting route '{}': {:?}", route, recv);
        }

        let tsr_routes = vec![
            "/hi/",
            "/b",
            "/search/rustacean/",
            "/cmd/vet",
            "/src",
            "/x/",
            "/y",
            "/0/go/",
            "/1/go",
            "/a",
            "/admin/",
            "/admin/config/",
            "/admin/config/permissions/",
            "/doc/",
        ];

        let guard = tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for route in tsr_routes {
            let mut skipped = SkippedNodes::default();
            let value = guard.get_value(route, None, &mut skipped, false);

            assert!(value.value.is_none(), "non-nil value for TSR route '{}'", route);
            assert!(value.tsr, "expected TSR recommendation for route '{}'", route);
        }

        let no_tsr_routes = vec!["/", "/no", "/no/", "/_", "/_/", "/api/world/abc"];

        for route in no_tsr_routes {
            let mut skipped = SkippedNodes::default();
            let value = guard.get_value(route, None, &mut skipped, false);

            assert!(value.value.is_none(), "non-nil value for no-TSR route '{}'", route);
            assert!(!value.tsr, "expected no TSR recommendation for route '{}'", route);
        }
    }

    #[test]
    fn test_tree_root_trailing_slash_redirect() {
        let mut tree: Node<&'static str> = Node::default();
        tree.add_route("/:test", "/:test");

        let mut skipped = SkippedNodes::default();
        let value = tree.get_value("/", None, &mut skipped, false);

        assert!(value.value.is_none(), "non-nil value");
        assert!(!value.tsr, "expected no TSR recommendation");
    }

    #[test]
    fn test_tree_find_case_insensitive_path() {
        let mut tree = Node::default();

        let routes = vec![
            "/hi",
            "/b/",
            "/ABC/",
            "/search/:query",
            "/cmd/:tool/",
            "/src/*filepath",
            "/x",
            "/x/y",
            "/y/",
            "/y/z",
            "/0/:id",
            "/0/:id/1",
            "/1/:id/",
            "/1/:id/2",
            "/aa",
            "/a/",
            "/doc",
            "/doc/go_faq.html",
            "/doc/go1.html",
            "/doc/go/away",
            "/no/a",
            "/no/b",
        ];

        for route in &routes {
            tree.add_route(route, *route);
        }

        // Check out == in for all registered routes, with and without
        // trailing-slash repair
        for route in &routes {
            let out = tree.find_case_insensitive_path(route, true);
            assert_eq!(out.as_deref(), Some(*route), "route '{}' not found", route);

            let out = tree.find_case_insensitive_path(route, false);
            assert_eq!(out.as_deref(), Some(*route), "route '{}' not found", route);
        }

        // input, expected output, found, needs trailing-slash fix
        let tests: Vec<(&str, &str, bool, bool)> = vec![
            ("/HI", "/hi", true, false),
            ("/HI/", "/hi", true, true),
            ("/B", "/b/", true, true),
            ("/B/", "/b/", true, false),
            ("/abc", "/ABC/", true, true),
            ("/abc/", "/ABC/", true, false),
            ("/aBc", "/ABC/", true, true),
            ("/aBc/", "/ABC/", true, false),
            ("/abC", "/ABC/", true, true),
            ("/abC/", "/ABC/", true, false),
            ("/SEARCH/QUERY", "/search/QUERY", true, false),
            ("/SEARCH/QUERY/", "/search/QUERY", true, true),
            ("/CMD/TOOL/", "/cmd/TOOL/", true, false),
            ("/CMD/TOOL", "/cmd/TOOL/", true, true),
            ("/SRC/FILE/PATH", "/src/FILE/PATH", true, false),
            ("/x/Y", "/x/y", true, false),
            ("/x/Y/", "/x/y", true, true),
            ("/X/y", "/x/y", true, false),
            ("/X/y/", "/x/y", true, true),
            ("/X/Y", "/x/y", true, false),
            ("/X/Y/", "/x/y", true, true),
            ("/Y/", "/y/", true, false),
            ("/Y", "/y/", true, true),
            ("/Y/z", "/y/z", true, false),
            ("/Y/z/", "/y/z", true, true),
            ("/Y/Z", "/y/z", true, false),
            ("/Y/Z/", "/y/z", true, true),
            ("/y/Z", "/y/z", true, false),
            ("/y/Z/", "/y/z", true, true),
            ("/Aa", "/aa", true, false),
            ("/Aa/", "/aa", true, true),
            ("/AA", "/aa", true, false),
            ("/AA/", "/aa", true, true),
            ("/aA", "/aa", true, false),
            ("/aA/", "/aa", true, true),
            ("/A/", "/a/", true, false),
            ("/A", "/a/", true, true),
            ("/DOC", "/doc", true, false),
            ("/DOC/", "/doc", true, true),
            ("/NO", "", false, true),
            ("/DOC/GO", "", false, true),
        ];

        // With fix_trailing_slash = true
        for test in &tests {
            let out = tree.find_case_insensitive_path(test.0, true);
            match out {
                Some(ref fixed) => {
                    assert!(test.2, "found '{}' unexpectedly: {}", test.0, fixed);
                    assert_eq!(fixed, test.1, "wrong result for '{}'", test.0);
                }
                None => assert!(!test.2, "expected to find '{}'", test.0),
            }
        }

        // With fix_trailing_slash = false
        for test in &tests {
            let out = tree.find_case_insensitive_path(test.0, false);
            if test.3 {
                // needs a trailing-slash fix, must not be found without it
                assert!(
                    out.is_none(),
                    "found '{}' without trailing-slash repair: {:?}",
                    test.0,
                    out
                );
            } else {
                match out {
                    Some(ref fixed) => {
                        assert!(test.2, "found '{}' unexpectedly: {}", test.0, fixed);
                        assert_eq!(fixed, test.1, "wrong result for '{}'", test.0);
                    }
                    None => assert!(!test.2, "expected to find '{}'", test.0),
                }
            }
        }
    }

    #[test]
    fn test_tree_wildcard_conflict_message() {
        let conflicts = vec![
            "/who/are/foo",
            "/who/are/foo/",
            "/who/are/foo/bar",
        ];

        for conflict in conflicts {
            // a fresh tree per conflict, the failed insert leaves the tree in
            // an inconsistent state
            let tree = Mutex::new(Node::default());
            {
                let mut guard = tree.lock().unwrap_or_else(|p| p.into_inner());
                for route in ["/con:tact", "/who/are/*you", "/who/foo/hello"] {
                    guard.add_route(route, route);
                }
            }

            let recv = panic::catch_unwind(|| {
                let mut guard = match tree.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.add_route(conflict, conflict);
            });

            let err = recv.expect_err("expected a conflict panic");
            let message = err
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_default();
            assert!(
                message.contains("conflicts with existing wildcard"),
                "unexpected panic message: {}",
                message
            );
        }
    }

    #[test]
    fn test_collect_routes() {
        let mut tree = Node::default();
        for route in ["/", "/users/:id", "/static/*file"] {
            tree.add_route(route, route);
        }

        let mut routes = Vec::new();
        tree.collect_routes(&mut routes);
        routes.sort();

        assert_eq!(routes, vec!["/", "/static/*file", "/users/:id"]);
    }
}
