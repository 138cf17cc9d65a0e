//! Packet pipeline built from plumbed stage ports
//!
//! Each stage owns a fixed number of ports. Two ports plumbed together form
//! a symmetric channel: a message a stage emits on one port is received by
//! the stage owning the other. Stages never hold references to each other;
//! the [`Pipeline`] owns every stage and dispatches by port index, handing
//! each stage a shared context `C` for node-wide state.
//!
//! Dispatch is iterative and FIFO, so a chain of stages never grows the call
//! stack and fanned-out messages keep their order.

use std::collections::VecDeque;
use std::fmt;
use tracing::{error, trace};
use trellis_core::{Error, Message, Result};

/// Handle to a stage inside a [`Pipeline`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StageId(usize);

/// Handle to one port of one stage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortId(usize);

/// What a stage did with a message it received
#[derive(Debug)]
pub enum Disposition {
    /// Emit on the given local port
    Forward(usize, Message),
    /// Emit several messages, in order
    Fanout(Vec<(usize, Message)>),
    /// Message was absorbed (queued, delivered to the host, or dropped)
    Consumed,
}

/// A processing unit with numbered ports
pub trait Stage<C> {
    /// Name used in logs and errors
    fn name(&self) -> &'static str;

    /// Number of ports this stage exposes
    fn port_count(&self) -> usize {
        2
    }

    /// Handle `msg` arriving on local port `port`.
    ///
    /// Returning an error drops the message; it never travels further.
    fn receive(&mut self, ctx: &mut C, port: usize, msg: Message) -> Result<Disposition>;
}

struct Port {
    stage: usize,
    index: usize,
    peer: Option<usize>,
}

struct Slot<C> {
    stage: Box<dyn Stage<C> + Send>,
    ports: Vec<usize>,
}

/// Arena of stages and the wiring between their ports
pub struct Pipeline<C> {
    stages: Vec<Slot<C>>,
    ports: Vec<Port>,
}

impl<C> Pipeline<C> {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            ports: Vec::new(),
        }
    }

    /// Add a stage, allocating its ports unplumbed.
    pub fn add_stage<S: Stage<C> + Send + 'static>(&mut self, stage: S) -> StageId {
        let id = self.stages.len();
        let ports = (0..stage.port_count())
            .map(|index| {
                self.ports.push(Port {
                    stage: id,
                    index,
                    peer: None,
                });
                self.ports.len() - 1
            })
            .collect();
        self.stages.push(Slot {
            stage: Box::new(stage),
            ports,
        });
        StageId(id)
    }

    /// Port `index` of `stage`.
    pub fn port(&self, stage: StageId, index: usize) -> Result<PortId> {
        let slot = self
            .stages
            .get(stage.0)
            .ok_or_else(|| Error::NotPlumbed(format!("no stage #{}", stage.0)))?;
        slot.ports
            .get(index)
            .copied()
            .map(PortId)
            .ok_or_else(|| Error::NotPlumbed(format!("{} has no port {}", slot.stage.name(), index)))
    }

    /// Connect two ports. Each port can be plumbed once.
    pub fn plumb(&mut self, a: PortId, b: PortId) -> Result<()> {
        if a == b {
            return Err(Error::NotPlumbed(format!(
                "cannot plumb {} to itself",
                self.describe(a.0)
            )));
        }
        for port in [a, b] {
            if self.ports[port.0].peer.is_some() {
                return Err(Error::NotPlumbed(format!(
                    "{} is already plumbed",
                    self.describe(port.0)
                )));
            }
        }
        self.ports[a.0].peer = Some(b.0);
        self.ports[b.0].peer = Some(a.0);
        trace!("plumbed {} <-> {}", self.describe(a.0), self.describe(b.0));
        Ok(())
    }

    /// The port `port` is plumbed to, if any
    pub fn peer(&self, port: PortId) -> Option<PortId> {
        self.ports.get(port.0).and_then(|p| p.peer).map(PortId)
    }

    pub fn is_plumbed(&self, port: PortId) -> bool {
        self.peer(port).is_some()
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Emit `msg` from `from`, as if the owning stage had forwarded it.
    ///
    /// Runs every stage the message reaches and returns the first error any
    /// of them reported.
    pub fn send(&mut self, ctx: &mut C, from: PortId, msg: Message) -> Result<()> {
        let target = self.next_hop(from.0)?;
        self.run(ctx, target, msg)
    }

    /// Deliver `msg` straight into the stage owning `at`, as if it had
    /// arrived from that port's peer.
    pub fn inject(&mut self, ctx: &mut C, at: PortId, msg: Message) -> Result<()> {
        if at.0 >= self.ports.len() {
            return Err(Error::NotPlumbed(format!("no port #{}", at.0)));
        }
        self.run(ctx, at.0, msg)
    }

    fn run(&mut self, ctx: &mut C, at: usize, msg: Message) -> Result<()> {
        let mut work = VecDeque::from([(at, msg)]);
        let mut first_error: Option<Error> = None;

        while let Some((port, msg)) = work.pop_front() {
            let Port { stage, index, .. } = self.ports[port];
            trace!("{} <- port {} ({} bytes)", self.stages[stage].stage.name(), index, msg.len());

            let outcome = self.stages[stage].stage.receive(ctx, index, msg);
            let emitted = match outcome {
                Ok(Disposition::Consumed) => Vec::new(),
                Ok(Disposition::Forward(out, msg)) => vec![(out, msg)],
                Ok(Disposition::Fanout(batch)) => batch,
                Err(e) => {
                    self.record(stage, e, &mut first_error);
                    continue;
                }
            };

            for (out, msg) in emitted {
                let resolved = self.stages[stage]
                    .ports
                    .get(out)
                    .copied()
                    .ok_or_else(|| {
                        Error::NotPlumbed(format!(
                            "{} has no port {}",
                            self.stages[stage].stage.name(),
                            out
                        ))
                    })
                    .and_then(|p| self.next_hop(p));
                match resolved {
                    Ok(next) => work.push_back((next, msg)),
                    Err(e) => self.record(stage, e, &mut first_error),
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn next_hop(&self, port: usize) -> Result<usize> {
        self.ports
            .get(port)
            .and_then(|p| p.peer)
            .ok_or_else(|| Error::NotPlumbed(self.describe(port)))
    }

    fn record(&self, stage: usize, e: Error, first_error: &mut Option<Error>) {
        if e.is_contract_violation() {
            error!("{} violated pipeline contract: {}", self.stages[stage].stage.name(), e);
            debug_assert!(false, "pipeline contract violation: {e}");
        } else {
            trace!("{} dropped message: {}", self.stages[stage].stage.name(), e);
        }
        if first_error.is_none() {
            *first_error = Some(e);
        }
    }

    fn describe(&self, port: usize) -> String {
        match self.ports.get(port) {
            Some(p) => format!("{}:{}", self.stages[p.stage].stage.name(), p.index),
            None => format!("port #{port}"),
        }
    }
}

impl<C> Default for Pipeline<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for Pipeline<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.stages.iter().map(|s| s.stage.name()).collect();
        f.debug_struct("Pipeline").field("stages", &names).finish()
    }
}
