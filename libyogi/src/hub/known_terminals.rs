// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/*! Hub-side mirror of the node's known-terminals set.

One pump per hub re-registers the node's await-change handler and keeps
a flat record set plus two name trees (absolute and relative paths) for
the subtree query. Sessions that monitor known terminals subscribe here
and get a `KnownTerminalsChanged` notification per delta.
*/

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, Weak},
};

use byteorder::{ByteOrder as _, LittleEndian};
use tracing::debug;
use yogi_protocol::{ChangeType, SessionResponse, Signature, TerminalInfo, TerminalKind};

use crate::{endpoint::Node, hub::session::SessionShared, wire};

/// One `kind, signature, name` record in session responses.
pub(crate) fn push_terminal_record(buf: &mut Vec<u8>, info: &TerminalInfo) {
    buf.push(info.kind as u8);
    let mut signature = [0u8; 4];
    LittleEndian::write_u32(&mut signature, info.signature.0);
    buf.extend_from_slice(&signature);
    wire::put_cstring(buf, &info.name);
}

#[derive(Default)]
struct TreeNode {
    children: BTreeMap<String, TreeNode>,
    terminals: Vec<(TerminalKind, Signature)>,
}

impl TreeNode {
    fn find(&self, path: &str) -> Option<&TreeNode> {
        if path.is_empty() || path == "/" {
            return Some(self);
        }
        let mut node = self;
        for part in path.trim_start_matches('/').split('/') {
            node = node.children.get(part)?;
        }
        Some(node)
    }

    fn insert(&mut self, path: &str, entry: (TerminalKind, Signature)) {
        let mut node = self;
        for part in path.trim_start_matches('/').split('/') {
            node = node.children.entry(String::from(part)).or_default();
        }
        node.terminals.push(entry);
    }

    fn remove(&mut self, path: &str, entry: (TerminalKind, Signature)) {
        fn walk(node: &mut TreeNode, parts: &[&str], entry: (TerminalKind, Signature)) -> bool {
            match parts.split_first() {
                None => {
                    if let Some(pos) = node.terminals.iter().position(|e| *e == entry) {
                        node.terminals.remove(pos);
                    }
                }
                Some((head, rest)) => {
                    if let Some(child) = node.children.get_mut(*head) {
                        if walk(child, rest, entry) {
                            node.children.remove(*head);
                        }
                    }
                }
            }
            node.terminals.is_empty() && node.children.is_empty()
        }

        let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        walk(self, &parts, entry);
    }
}

struct KnownState {
    terminals: Vec<TerminalInfo>,
    absolute: TreeNode,
    relative: TreeNode,
    sessions: Vec<Weak<SessionShared>>,
}

pub(crate) struct KnownTerminalsMonitor {
    node: Node,
    state: Arc<Mutex<KnownState>>,
}

impl KnownTerminalsMonitor {
    pub fn new(node: Node) -> KnownTerminalsMonitor {
        KnownTerminalsMonitor {
            node,
            state: Arc::new(Mutex::new(KnownState {
                terminals: vec![],
                absolute: TreeNode::default(),
                relative: TreeNode::default(),
                sessions: vec![],
            })),
        }
    }

    /// Start draining the node's change deltas. The node queues deltas
    /// from its creation onwards, so nothing is lost before this call.
    pub fn start(&self) {
        pump(self.node.clone(), Arc::clone(&self.state));
    }

    pub fn subscribe(&self, session: &Arc<SessionShared>) {
        let mut st = self.state.lock().unwrap();
        st.sessions.push(Arc::downgrade(session));
    }

    /// All records, concatenated.
    pub fn snapshot(&self) -> Vec<u8> {
        let st = self.state.lock().unwrap();
        let mut buf = Vec::new();
        for info in &st.terminals {
            push_terminal_record(&mut buf, info);
        }
        buf
    }

    /// Immediate children of `path` in the requested tree, each as
    /// `name NUL (kind signature)* 0xFF`.
    pub fn subtree(&self, absolute: bool, path: &str) -> Vec<u8> {
        let st = self.state.lock().unwrap();
        let root = if absolute { &st.absolute } else { &st.relative };
        let mut buf = Vec::new();
        if let Some(node) = root.find(path) {
            for (name, child) in &node.children {
                wire::put_cstring(&mut buf, name);
                for (kind, signature) in &child.terminals {
                    buf.push(*kind as u8);
                    let mut sig = [0u8; 4];
                    LittleEndian::write_u32(&mut sig, signature.0);
                    buf.extend_from_slice(&sig);
                }
                buf.push(0xff);
            }
        }
        buf
    }

    /// Records whose name contains `needle`.
    pub fn find(&self, needle: &str, case_sensitive: bool) -> Vec<u8> {
        let st = self.state.lock().unwrap();
        let needle_lower = needle.to_lowercase();
        let mut buf = Vec::new();
        for info in &st.terminals {
            let hit = if case_sensitive {
                info.name.contains(needle)
            } else {
                info.name.to_lowercase().contains(&needle_lower)
            };
            if hit {
                push_terminal_record(&mut buf, info);
            }
        }
        buf
    }
}

fn pump(node: Node, state: Arc<Mutex<KnownState>>) {
    let next_node = node.clone();
    let result = node.async_await_known_terminals_change(move |res| {
        if let Ok((info, change)) = res {
            on_changed(&state, &info, change);
            pump(next_node, state);
        }
    });
    if let Err(err) = result {
        debug!("not starting known terminals pump: {}", err);
    }
}

fn on_changed(state: &Arc<Mutex<KnownState>>, info: &TerminalInfo, change: ChangeType) {
    debug!(
        "{} {}",
        info,
        if change == ChangeType::Added { "added" } else { "removed" }
    );

    let sessions = {
        let mut guard = state.lock().unwrap();
        let st = &mut *guard;
        let entry = (info.kind, info.signature);
        let tree =
            if info.name.starts_with('/') { &mut st.absolute } else { &mut st.relative };
        match change {
            ChangeType::Added => {
                tree.insert(&info.name, entry);
                st.terminals.push(info.clone());
            }
            ChangeType::Removed => {
                tree.remove(&info.name, entry);
                st.terminals.retain(|i| i != info);
            }
        }

        st.sessions.retain(|weak| weak.strong_count() > 0);
        st.sessions.clone()
    };

    let mut body = vec![change as u8];
    push_terminal_record(&mut body, info);
    for weak in sessions {
        if let Some(session) = weak.upgrade() {
            if session.monitoring_known_terminals() {
                session.notify(SessionResponse::KnownTerminalsChanged, &body);
            }
        }
    }
}
