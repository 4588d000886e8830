//! Action-packet dispatcher: applies server-pushed state mutations.
//!
//! The server-client push stream delivers `{"w":…,"sn":…,"a":[…]}` documents
//! where each element of `a` is one actionpacket tagged by its `a` field.
//! This module drives the [`crate::splitter`] with filters that mutate the
//! node cache and enqueue typed side effects for the application.
//!
//! Every response is applied inside one cache transaction: a failing branch
//! fails the stream, the transaction rolls back, and the previously persisted
//! sequence number stays authoritative — the client simply refetches from it.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use crate::cache::{NodeStore, StateId};
use crate::error::ApiError;
use crate::json::{JsonScanner, name_id};
use crate::node::{Handle, Node, UNDEF, share};
use crate::splitter::{ChunkResult, FilterOutcome, JsonSplitter, SplitterState};
use crate::userattrs::UserAttributeStore;

/// Events that do not mutate the node tree; drained by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    ContactsChanged(String),
    PaymentReceived(String),
    IncomingContactRequest(String),
    OutgoingContactRequest(String),
    ContactRequestUpdated(String),
    SessionChanged(String),
    FileAttrChanged { node: Handle, fa: String },
    UserAttrsChanged { user: Handle, names: Vec<String> },
    PublicLinkChanged { node: Handle, removed: bool },
}

struct ApShared {
    store: Rc<NodeStore>,
    user_attrs: UserAttributeStore,
    effects: VecDeque<SideEffect>,
    ws_url: Option<String>,
    pending_sn: Option<String>,
    last_error: Option<ApiError>,
    packets_processed: usize,
}

/// Streaming parser of the action-packet channel.
pub struct ActionPacketParser {
    splitter: JsonSplitter,
    shared: Rc<RefCell<ApShared>>,
    in_transaction: bool,
}

impl ActionPacketParser {
    pub fn new(store: Rc<NodeStore>) -> Self {
        let shared = Rc::new(RefCell::new(ApShared {
            store,
            user_attrs: UserAttributeStore::new(),
            effects: VecDeque::new(),
            ws_url: None,
            pending_sn: None,
            last_error: None,
            packets_processed: 0,
        }));

        let mut splitter = JsonSplitter::new();

        // one filter per finished actionpacket object
        let s = Rc::clone(&shared);
        splitter.set_filter("{[a{", move |scanner| {
            let mut shared = s.borrow_mut();
            match parse_packet(scanner) {
                Some(packet) => {
                    if apply_packet(&mut shared, &packet) {
                        shared.packets_processed += 1;
                        FilterOutcome::Consumed
                    } else {
                        tracing::error!(tag = %packet.tag, "actionpacket branch failed");
                        FilterOutcome::Fail
                    }
                }
                None => FilterOutcome::Fail,
            }
        });

        // websocket URL for push notifications about further state changes
        let s = Rc::clone(&shared);
        splitter.set_filter("{\"w", move |scanner| {
            let mut url = String::new();
            if !scanner.store_object(Some(&mut url)) {
                return FilterOutcome::Fail;
            }
            let mut shared = s.borrow_mut();
            shared.store.state_put(StateId::StreamUrl as u32, url.as_bytes());
            shared.ws_url = Some(url);
            FilterOutcome::Consumed
        });

        // sequence number: remembered now, persisted when the chunk commits
        let s = Rc::clone(&shared);
        splitter.set_filter("{\"sn", move |scanner| {
            let mut sn = String::new();
            if !scanner.store_object(Some(&mut sn)) {
                return FilterOutcome::Fail;
            }
            s.borrow_mut().pending_sn = Some(sn);
            FilterOutcome::Consumed
        });

        // bare-number response: the channel reported an error
        let s = Rc::clone(&shared);
        splitter.set_filter("#", move |scanner| {
            let error = ApiError(scanner.get_int());
            tracing::warn!(%error, "action-packet channel error");
            s.borrow_mut().last_error = Some(error);
            FilterOutcome::Consumed
        });

        let s = Rc::clone(&shared);
        splitter.set_filter("E", move |_| {
            tracing::error!("action-packet stream failed to parse");
            s.borrow_mut().last_error = Some(ApiError::INTERNAL);
            FilterOutcome::Consumed
        });

        Self {
            splitter,
            shared,
            in_transaction: false,
        }
    }

    /// Feeds arriving bytes. Opens the cache transaction lazily, commits it
    /// (persisting the sequence number) when the document finishes, and rolls
    /// back on failure so the last good sequence number survives.
    pub fn process_chunk(&mut self, chunk: &[u8]) -> ChunkResult {
        if !self.in_transaction {
            self.shared.borrow().store.begin();
            self.in_transaction = true;
        }

        let result = self.splitter.process_chunk(chunk);
        match result.state {
            SplitterState::Finished => {
                let mut shared = self.shared.borrow_mut();
                if let Some(sn) = shared.pending_sn.take() {
                    shared.store.state_put(StateId::SequenceNumber as u32, sn.as_bytes());
                }
                shared.store.commit();
                self.in_transaction = false;
            }
            SplitterState::Failed => {
                let mut shared = self.shared.borrow_mut();
                shared.store.abort();
                shared.pending_sn = None;
                self.in_transaction = false;
            }
            SplitterState::Running | SplitterState::Paused => {}
        }
        result
    }

    /// Resets stream state for the next response; the filter set survives.
    pub fn clear(&mut self) {
        self.splitter.clear();
        let mut shared = self.shared.borrow_mut();
        if self.in_transaction {
            shared.store.abort();
            self.in_transaction = false;
        }
        shared.pending_sn = None;
        shared.last_error = None;
    }

    pub fn has_finished(&self) -> bool {
        self.splitter.has_finished()
    }

    pub fn has_failed(&self) -> bool {
        self.splitter.has_failed()
    }

    pub fn packets_processed(&self) -> usize {
        self.shared.borrow().packets_processed
    }

    pub fn ws_url(&self) -> Option<String> {
        self.shared.borrow().ws_url.clone()
    }

    pub fn last_error(&self) -> Option<ApiError> {
        self.shared.borrow().last_error
    }

    /// Last committed sequence number.
    pub fn sequence_number(&self) -> Option<String> {
        self.shared
            .borrow()
            .store
            .state_get(StateId::SequenceNumber as u32)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn drain_effects(&mut self) -> Vec<SideEffect> {
        self.shared.borrow_mut().effects.drain(..).collect()
    }

    /// Version notes applied by `ua` packets land here.
    pub fn user_attr_version(&self, name: &str) -> Option<String> {
        self.shared
            .borrow()
            .user_attrs
            .version(name)
            .map(str::to_string)
    }
}

/// One decoded actionpacket, before dispatch.
struct RawPacket {
    tag: String,
    raw: String,
    node: Handle,
    user: Handle,
    access: Option<i64>,
    removed: bool,
    attrs: Option<BTreeMap<String, String>>,
    new_nodes: Vec<Node>,
    ua_names: Vec<String>,
    ua_versions: Vec<String>,
    fa: Option<String>,
}

/// Decodes a packet object, consuming exactly its closure.
fn parse_packet(scanner: &mut JsonScanner<'_>) -> Option<RawPacket> {
    let mut raw = String::new();
    scanner.clone().store_object(Some(&mut raw));

    if !scanner.enter_object() {
        return None;
    }

    let mut packet = RawPacket {
        tag: String::new(),
        raw,
        node: UNDEF,
        user: UNDEF,
        access: None,
        removed: false,
        attrs: None,
        new_nodes: Vec::new(),
        ua_names: Vec::new(),
        ua_versions: Vec::new(),
        fa: None,
    };

    loop {
        let id = scanner.get_name_id();
        if id == 0 {
            break;
        }
        if id == name_id("a") {
            let mut tag = String::new();
            if !scanner.store_object(Some(&mut tag)) {
                return None;
            }
            packet.tag = tag;
        } else if id == name_id("n") || id == name_id("h") {
            packet.node = scanner.get_handle(6);
        } else if id == name_id("u") {
            packet.user = scanner.get_handle(8);
        } else if id == name_id("r") {
            packet.access = Some(scanner.get_int());
        } else if id == name_id("d") {
            packet.removed = scanner.get_bool();
        } else if id == name_id("fa") {
            let mut fa = String::new();
            scanner.store_object(Some(&mut fa));
            packet.fa = Some(fa);
        } else if id == name_id("at") {
            packet.attrs = parse_attr_object(scanner);
        } else if id == name_id("t") {
            if !parse_new_tree(scanner, &mut packet.new_nodes) {
                return None;
            }
        } else if id == name_id("ua") {
            parse_string_array(scanner, &mut packet.ua_names);
        } else if id == name_id("v") {
            parse_string_array(scanner, &mut packet.ua_versions);
        } else if !scanner.store_object(None) {
            break;
        }
    }

    if !scanner.leave_object() {
        return None;
    }
    Some(packet)
}

fn parse_attr_object(scanner: &mut JsonScanner<'_>) -> Option<BTreeMap<String, String>> {
    if !scanner.enter_object() {
        scanner.store_object(None);
        return None;
    }
    let mut attrs = BTreeMap::new();
    loop {
        let key = scanner.get_name();
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if !scanner.store_object(Some(&mut value)) {
            break;
        }
        JsonScanner::unescape(&mut value);
        attrs.insert(key, value);
    }
    scanner.leave_object();
    Some(attrs)
}

/// `t:{"f":[…]}` — the node array of a new-tree packet.
fn parse_new_tree(scanner: &mut JsonScanner<'_>, nodes: &mut Vec<Node>) -> bool {
    if !scanner.enter_object() {
        return false;
    }
    loop {
        let id = scanner.get_name_id();
        if id == 0 {
            break;
        }
        if id == name_id("f") {
            if !scanner.enter_array() {
                return false;
            }
            while let Some(node) = Node::from_wire(scanner) {
                nodes.push(node);
            }
            if !scanner.leave_array() {
                return false;
            }
        } else if !scanner.store_object(None) {
            return false;
        }
    }
    scanner.leave_object()
}

fn parse_string_array(scanner: &mut JsonScanner<'_>, out: &mut Vec<String>) {
    if !scanner.enter_array() {
        scanner.store_object(None);
        return;
    }
    let mut value = String::new();
    while scanner.store_object(Some(&mut value)) {
        out.push(std::mem::take(&mut value));
    }
    scanner.leave_array();
}

/// Applies one packet. Returns false to fail the whole response.
fn apply_packet(shared: &mut ApShared, packet: &RawPacket) -> bool {
    match packet.tag.as_str() {
        "u" => apply_update_node(shared, packet),
        "t" => {
            for node in &packet.new_nodes {
                if !shared.store.put_node(node) {
                    return false;
                }
            }
            true
        }
        "d" => {
            if packet.node == UNDEF {
                return false;
            }
            shared.store.remove_node(packet.node)
        }
        "s" | "s2" => apply_share(shared, packet),
        "c" => {
            shared
                .effects
                .push_back(SideEffect::ContactsChanged(packet.raw.clone()));
            true
        }
        "fa" => apply_fileattr(shared, packet),
        "ua" => {
            if packet.user == UNDEF {
                return false;
            }
            for (name, version) in packet.ua_names.iter().zip(&packet.ua_versions) {
                shared.user_attrs.note_version(name, version);
            }
            shared.effects.push_back(SideEffect::UserAttrsChanged {
                user: packet.user,
                names: packet.ua_names.clone(),
            });
            true
        }
        "psts" => {
            shared
                .effects
                .push_back(SideEffect::PaymentReceived(packet.raw.clone()));
            true
        }
        "ipc" => {
            shared
                .effects
                .push_back(SideEffect::IncomingContactRequest(packet.raw.clone()));
            true
        }
        "opc" => {
            shared
                .effects
                .push_back(SideEffect::OutgoingContactRequest(packet.raw.clone()));
            true
        }
        "upci" => {
            shared
                .effects
                .push_back(SideEffect::ContactRequestUpdated(packet.raw.clone()));
            true
        }
        "ph" => apply_public_link(shared, packet),
        "se" => {
            shared
                .effects
                .push_back(SideEffect::SessionChanged(packet.raw.clone()));
            true
        }
        other => {
            // tolerate tags newer than this client
            tracing::debug!(tag = other, "skipping unknown actionpacket");
            true
        }
    }
}

fn apply_update_node(shared: &mut ApShared, packet: &RawPacket) -> bool {
    if packet.node == UNDEF {
        return false;
    }
    let Some(mut node) = shared.store.get(packet.node) else {
        tracing::warn!(handle = packet.node, "updatenode for unknown node");
        return true;
    };
    if let Some(attrs) = &packet.attrs {
        for (key, value) in attrs {
            node.attrs.insert(key.clone(), value.clone());
        }
        if let Some(name) = node.attrs.get(crate::node::attr::NAME) {
            node.name = name.clone();
        }
    }
    shared.store.put_node(&node)
}

fn apply_share(shared: &mut ApShared, packet: &RawPacket) -> bool {
    if packet.node == UNDEF {
        return false;
    }
    let Some(mut node) = shared.store.get(packet.node) else {
        tracing::warn!(handle = packet.node, "share update for unknown node");
        return true;
    };
    match packet.access {
        // an access level grants or keeps a share on the node
        Some(_) if !packet.removed => node.share |= share::OUT_SHARE,
        _ => node.share &= !share::OUT_SHARE,
    }
    shared.store.put_node(&node)
}

fn apply_fileattr(shared: &mut ApShared, packet: &RawPacket) -> bool {
    if packet.node == UNDEF {
        return false;
    }
    let Some(fa) = &packet.fa else {
        return false;
    };
    let Some(mut node) = shared.store.get(packet.node) else {
        tracing::warn!(handle = packet.node, "fileattr for unknown node");
        return true;
    };
    node.attrs.insert("fa".to_string(), fa.clone());
    if !shared.store.put_node(&node) {
        return false;
    }
    shared.effects.push_back(SideEffect::FileAttrChanged {
        node: packet.node,
        fa: fa.clone(),
    });
    true
}

fn apply_public_link(shared: &mut ApShared, packet: &RawPacket) -> bool {
    if packet.node == UNDEF {
        return false;
    }
    let Some(mut node) = shared.store.get(packet.node) else {
        tracing::warn!(handle = packet.node, "public link for unknown node");
        return true;
    };
    if packet.removed {
        node.share &= !share::LINK;
    } else {
        node.share |= share::LINK;
    }
    if !shared.store.put_node(&node) {
        return false;
    }
    shared.effects.push_back(SideEffect::PublicLinkChanged {
        node: packet.node,
        removed: packet.removed,
    });
    true
}
