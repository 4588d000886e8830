//! Engine context: the single-writer core tying the subsystems together.
//!
//! One engine thread owns the node cache, the request dispatcher, the
//! action-packet parser, and the upload throttle; nothing else touches them.
//! Transport threads never call in directly — they enqueue
//! [`TransportEvent`]s through a cloned sender and the engine drains the
//! queue between its other duties. This replaces process-global state with an
//! explicit `init`/`shutdown` lifecycle.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::actionpackets::{ActionPacketParser, SideEffect};
use crate::cache::{DbConfig, NodeStore};
use crate::commands::{Command, ReqIdGen, RequestDispatcher, RetryReason};
use crate::splitter::SplitterState;
use crate::throttle::UploadThrottlingManager;
use crate::transport::{Flow, HttpPump};

/// Engine construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub db: DbConfig,
    /// Fixed idempotency-id seed; defaults to entropy from the clock.
    pub reqid_seed: Option<u64>,
}

/// I/O completion events delivered from transport threads.
#[derive(Debug)]
pub enum TransportEvent {
    /// Response bytes of the command channel.
    CommandChunk(Bytes),
    /// The command-channel transfer finished cleanly.
    CommandComplete,
    /// The command-channel transfer died; retry with the same id.
    CommandFailed(RetryReason),
    /// Bytes of the action-packet stream.
    PacketChunk(Bytes),
}

/// The assembled SDK core.
pub struct Engine {
    store: Rc<NodeStore>,
    dispatcher: Rc<RefCell<RequestDispatcher>>,
    pump: HttpPump,
    packets: ActionPacketParser,
    throttle: UploadThrottlingManager,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    sc_buffer: Vec<u8>,
}

impl Engine {
    /// Opens the cache and wires the pipeline together.
    pub fn init(config: &EngineConfig) -> anyhow::Result<Self> {
        let store = Rc::new(NodeStore::open(&config.db, None)?);

        let reqid = match config.reqid_seed {
            Some(seed) => ReqIdGen::with_seed(seed),
            None => ReqIdGen::new(),
        };
        let dispatcher = Rc::new(RefCell::new(RequestDispatcher::with_reqid(reqid)));
        let pump = HttpPump::new(Rc::clone(&dispatcher));
        let packets = ActionPacketParser::new(Rc::clone(&store));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            store,
            dispatcher,
            pump,
            packets,
            throttle: UploadThrottlingManager::new(),
            events_tx,
            events_rx,
            sc_buffer: Vec::new(),
        })
    }

    /// Sender handed to transport threads; cheap to clone.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.events_tx.clone()
    }

    pub fn store(&self) -> &Rc<NodeStore> {
        &self.store
    }

    pub fn throttle(&mut self) -> &mut UploadThrottlingManager {
        &mut self.throttle
    }

    pub fn packets(&self) -> &ActionPacketParser {
        &self.packets
    }

    /// Queues an outgoing command.
    pub fn submit(&self, cmd: Command) {
        self.dispatcher.borrow_mut().add(cmd);
    }

    /// Bytes and idempotency id of the next (or retried) request to post.
    pub fn next_request(&self) -> Option<(String, String)> {
        self.dispatcher.borrow_mut().server_request()
    }

    pub fn ready_to_send(&self) -> bool {
        self.dispatcher.borrow().ready_to_send()
    }

    pub fn drain_side_effects(&mut self) -> Vec<SideEffect> {
        self.packets.drain_effects()
    }

    /// Drains queued transport events, feeding each channel's bytes into its
    /// parser. Called from the engine loop; everything here runs
    /// sequentially, so no two actionpackets ever apply concurrently.
    pub fn pump_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                TransportEvent::CommandChunk(chunk) => {
                    let _flow: Flow = self.pump.deliver(&chunk);
                }
                TransportEvent::CommandComplete => self.pump.complete(),
                TransportEvent::CommandFailed(reason) => {
                    self.pump.failed();
                    tracing::debug!(?reason, "command transfer failed");
                }
                TransportEvent::PacketChunk(chunk) => self.feed_packet_chunk(&chunk),
            }
        }
    }

    fn feed_packet_chunk(&mut self, chunk: &[u8]) {
        self.sc_buffer.extend_from_slice(chunk);
        loop {
            let result = self.packets.process_chunk(&self.sc_buffer);
            self.sc_buffer.drain(..result.consumed);
            match result.state {
                SplitterState::Finished => {
                    // ready for the next pushed document, which may already
                    // have started in this buffer
                    self.packets.clear();
                    if self.sc_buffer.is_empty() {
                        break;
                    }
                }
                SplitterState::Failed => {
                    tracing::warn!("action-packet stream failed; dropping buffered bytes");
                    self.sc_buffer.clear();
                    self.packets.clear();
                    break;
                }
                SplitterState::Running | SplitterState::Paused => break,
            }
        }
    }

    /// Periodic housekeeping: releases due throttled uploads and expires
    /// idle upload counters.
    pub fn tick<F>(&mut self, start_upload: F)
    where
        F: FnMut(
            std::rc::Weak<crate::throttle::SyncUpload>,
            crate::throttle::VersioningOption,
            bool,
            crate::node::Handle,
        ),
    {
        self.throttle.process_delayed_uploads(start_upload);
        self.throttle.expire_upload_counters();
    }

    /// Tears the engine down. The cache rolls back any open transaction as
    /// it closes; callers decide separately whether to delete the files.
    pub fn shutdown(self) {
        tracing::debug!("engine shutting down");
        drop(self);
    }
}
