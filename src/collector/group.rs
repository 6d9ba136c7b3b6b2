//! PortGroup: a set of Ports fed from one shared target stream.
//!
//! The mux forwards every inbound address to every Port's input channel.
//! Fan-out is deliberately *blocking*: when one Port's input is full the
//! mux waits, coupling the Ports' throughput but never dropping coverage
//! on a single path while the others keep measuring.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::Sender;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::collector::port::{Port, PortHandle};
use crate::probe::Probe;

/// Buffered addresses per Port input.
pub const PORT_INPUT_BUFFER: usize = 10;

struct Member {
    port: Port,
    input_tx: mpsc::Sender<SocketAddr>,
    input_rx: mpsc::Receiver<SocketAddr>,
}

/// A set of Ports sharing a completed-probe sink and a cancellation token.
///
/// The member set is only mutable before [`PortGroup::run`]; running
/// consumes the group, so late additions are a compile error rather than a
/// race.
pub struct PortGroup {
    members: Vec<Member>,
    tosend: mpsc::Receiver<SocketAddr>,
    cbc: Sender<Probe>,
    cancel: CancellationToken,
}

/// Handles for the mux task and every Port's loops.
pub struct PortGroupHandle {
    pub mux_task: tokio::task::JoinHandle<()>,
    pub ports: Vec<PortHandle>,
}

impl PortGroup {
    pub fn new(
        tosend: mpsc::Receiver<SocketAddr>,
        cbc: Sender<Probe>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            members: Vec::new(),
            tosend,
            cbc,
            cancel,
        }
    }

    /// Add an existing Port with its input channel pair.
    pub fn add(
        &mut self,
        port: Port,
        input_tx: mpsc::Sender<SocketAddr>,
        input_rx: mpsc::Receiver<SocketAddr>,
    ) {
        self.members.push(Member {
            port,
            input_tx,
            input_rx,
        });
    }

    /// Bind a new Port on `bind` and add it to the group.
    pub fn add_new(
        &mut self,
        bind: SocketAddr,
        tos: u8,
        cache_timeout: Duration,
        clean_rate: Duration,
        read_timeout: Duration,
    ) -> Result<SocketAddr> {
        let port = Port::bind(
            bind,
            tos,
            cache_timeout,
            clean_rate,
            read_timeout,
            self.cbc.clone(),
            self.cancel.clone(),
        )?;
        let local = port.local_addr();
        let (input_tx, input_rx) = mpsc::channel(PORT_INPUT_BUFFER);
        self.add(port, input_tx, input_rx);
        Ok(local)
    }

    /// Remove the Port bound to `local`, if present.
    pub fn del(&mut self, local: SocketAddr) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.port.local_addr() != local);
        self.members.len() != before
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Start every Port and then the mux loop.
    pub fn run(self) -> PortGroupHandle {
        let mut ports = Vec::with_capacity(self.members.len());
        let mut inputs = Vec::with_capacity(self.members.len());
        for member in self.members {
            ports.push(member.port.spawn(member.input_rx));
            inputs.push(member.input_tx);
        }
        let mux_task = tokio::spawn(mux_loop(self.tosend, inputs, self.cancel));
        PortGroupHandle { mux_task, ports }
    }
}

async fn mux_loop(
    mut tosend: mpsc::Receiver<SocketAddr>,
    inputs: Vec<mpsc::Sender<SocketAddr>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("port group mux stopped");
                return;
            }
            addr = tosend.recv() => {
                let Some(addr) = addr else {
                    debug!("port group target stream closed");
                    return;
                };
                for input in &inputs {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = input.send(addr) => {
                            // A closed input means that Port died; the
                            // others keep their coverage.
                            let _ = sent;
                        }
                    }
                }
            }
        }
    }
}
