//! Request scripts.
//!
//! A tiny line-oriented language for driving a [`ResourceQueue`] by hand or
//! from tests. Statements are separated by newlines or `;`, and `#` starts a
//! comment:
//!
//! ```text
//! open 0            # open resource 0 on its own
//! open 1 with 2,3   # open 1 in a concurrent group with 2 and 3
//! prewarm 4
//! close 0
//! close-all
//! wait              # resolve everything submitted so far
//! release 1         # drop every lease held on 1
//! sleep 3500        # milliseconds
//! ```
//!
//! Submissions never block, so consecutive statements without a `wait` land
//! in the same batch and get pruned together.

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use coalesce_core::{ResourceId, TableSnapshot};
use coalesce_runtime::{Completion, Lease, OpenOutcome, OpenTicket, QueueError, ResourceQueue};
use thiserror::Error;

/// Script parse errors. Lines are 1-based.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// Statement does not start with a known command
    #[error("line {line}: unknown command `{command}`")]
    UnknownCommand {
        /// Source line
        line: usize,
        /// Offending word
        command: String,
    },

    /// Command is missing its argument
    #[error("line {line}: `{command}` expects {expected}")]
    MissingArgument {
        /// Source line
        line: usize,
        /// Command name
        command: &'static str,
        /// What was expected
        expected: &'static str,
    },

    /// Argument is not a non-negative integer
    #[error("line {line}: invalid number `{value}`")]
    InvalidNumber {
        /// Source line
        line: usize,
        /// Offending text
        value: String,
    },

    /// Trailing input after a complete statement
    #[error("line {line}: unexpected `{token}`")]
    Unexpected {
        /// Source line
        line: usize,
        /// First unexpected token
        token: String,
    },
}

/// One script statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// `open N [with A,B]`
    Open {
        /// Resource to open
        resource: ResourceId,
        /// Other members of its concurrent group
        with: Vec<ResourceId>,
    },
    /// `prewarm N`
    Prewarm(ResourceId),
    /// `close N`
    Close(ResourceId),
    /// `close-all`
    CloseAll,
    /// `release N`
    Release(ResourceId),
    /// `wait`
    Wait,
    /// `sleep MS`
    Sleep(Duration),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { resource, with } if with.is_empty() => write!(f, "open {resource}"),
            Self::Open { resource, with } => {
                let with: Vec<_> = with.iter().map(ToString::to_string).collect();
                write!(f, "open {resource} with {}", with.join(","))
            },
            Self::Prewarm(id) => write!(f, "prewarm {id}"),
            Self::Close(id) => write!(f, "close {id}"),
            Self::CloseAll => write!(f, "close-all"),
            Self::Release(id) => write!(f, "release {id}"),
            Self::Wait => write!(f, "wait"),
            Self::Sleep(duration) => write!(f, "sleep {}", duration.as_millis()),
        }
    }
}

/// A parsed script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    steps: Vec<Step>,
}

impl Script {
    /// Parse script source.
    pub fn parse(source: &str) -> Result<Self, ScriptError> {
        let mut steps = Vec::new();
        for (index, text) in source.lines().enumerate() {
            let line = index + 1;
            let code = text.split('#').next().unwrap_or_default();
            for statement in code.split(';') {
                let tokens: Vec<&str> = statement.split_whitespace().collect();
                if let Some(step) = parse_statement(line, &tokens)? {
                    steps.push(step);
                }
            }
        }
        Ok(Self { steps })
    }

    /// Parsed statements in order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

impl FromStr for Script {
    type Err = ScriptError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        Self::parse(source)
    }
}

fn parse_statement(line: usize, tokens: &[&str]) -> Result<Option<Step>, ScriptError> {
    let Some((command, args)) = tokens.split_first() else {
        return Ok(None);
    };

    let step = match *command {
        "open" => {
            let resource = resource_arg(line, "open", args.first())?;
            let with = match &args[1..] {
                [] => Vec::new(),
                ["with"] => {
                    return Err(ScriptError::MissingArgument {
                        line,
                        command: "open",
                        expected: "resource ids after `with`",
                    });
                },
                ["with", list @ ..] => id_list(line, &list.join(","))?,
                [token, ..] => {
                    return Err(ScriptError::Unexpected { line, token: (*token).to_string() });
                },
            };
            return Ok(Some(Step::Open { resource, with }));
        },
        "prewarm" => Step::Prewarm(resource_arg(line, "prewarm", args.first())?),
        "close" => Step::Close(resource_arg(line, "close", args.first())?),
        "release" => Step::Release(resource_arg(line, "release", args.first())?),
        "close-all" => return no_args(line, args, Step::CloseAll),
        "wait" => return no_args(line, args, Step::Wait),
        "sleep" => {
            let value = args.first().ok_or(ScriptError::MissingArgument {
                line,
                command: "sleep",
                expected: "a duration in milliseconds",
            })?;
            Step::Sleep(Duration::from_millis(number(line, value)?))
        },
        other => return Err(ScriptError::UnknownCommand { line, command: other.to_string() }),
    };

    no_args(line, &args[1..], step)
}

fn no_args(line: usize, rest: &[&str], step: Step) -> Result<Option<Step>, ScriptError> {
    match rest.first() {
        Some(token) => Err(ScriptError::Unexpected { line, token: (*token).to_string() }),
        None => Ok(Some(step)),
    }
}

fn resource_arg(
    line: usize,
    command: &'static str,
    arg: Option<&&str>,
) -> Result<ResourceId, ScriptError> {
    let value =
        arg.ok_or(ScriptError::MissingArgument { line, command, expected: "a resource id" })?;
    resource(line, value)
}

fn id_list(line: usize, list: &str) -> Result<Vec<ResourceId>, ScriptError> {
    list.split(',').filter(|s| !s.is_empty()).map(|s| resource(line, s)).collect()
}

fn resource(line: usize, value: &str) -> Result<ResourceId, ScriptError> {
    value
        .parse::<u32>()
        .map(ResourceId)
        .map_err(|_| ScriptError::InvalidNumber { line, value: value.to_string() })
}

fn number(line: usize, value: &str) -> Result<u64, ScriptError> {
    value.parse().map_err(|_| ScriptError::InvalidNumber { line, value: value.to_string() })
}

/// What a script run observed, one line per event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    lines: Vec<String>,
}

impl Transcript {
    /// Recorded lines, oldest first.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    fn push(&mut self, line: String) {
        tracing::debug!(%line, "script");
        self.lines.push(line);
    }
}

impl fmt::Display for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

enum Inflight<R> {
    Open { label: String, ticket: OpenTicket<R>, parked: bool },
    Done { label: String, completion: Completion },
}

impl<R> Inflight<R> {
    /// Whether this is an open the table currently holds parked.
    fn is_parked_in(&self, table: &TableSnapshot) -> bool {
        match self {
            Self::Open { ticket, .. } => table.pending.iter().any(|p| p.ticket == ticket.ticket()),
            Self::Done { .. } => false,
        }
    }
}

/// Runs scripts against a queue, holding the leases they acquire.
pub struct ScriptRunner<R> {
    queue: ResourceQueue<R>,
    inflight: Vec<Inflight<R>>,
    leases: BTreeMap<ResourceId, Vec<Lease<R>>>,
    transcript: Transcript,
}

impl<R> ScriptRunner<R>
where
    R: Send + Sync + 'static,
{
    /// Create a runner submitting to `queue`.
    pub fn new(queue: ResourceQueue<R>) -> Self {
        Self {
            queue,
            inflight: Vec::new(),
            leases: BTreeMap::new(),
            transcript: Transcript::default(),
        }
    }

    /// Run every step, then wait for whatever is still in flight.
    pub async fn run(&mut self, script: &Script) {
        for step in script.steps() {
            self.step(step).await;
        }
        self.wait().await;
    }

    /// Execute one statement.
    pub async fn step(&mut self, step: &Step) {
        let label = step.to_string();
        match step {
            Step::Open { resource, with } => {
                let submitted = if with.is_empty() {
                    self.queue.open(*resource)
                } else {
                    self.queue.open_shared(*resource, with.iter().copied())
                };
                match submitted {
                    Ok(ticket) => {
                        self.inflight.push(Inflight::Open { label, ticket, parked: false });
                    },
                    Err(err) => self.transcript.push(format!("{label}: rejected ({err})")),
                }
            },
            Step::Prewarm(id) => {
                let submitted = self.queue.prewarm(*id);
                self.track(label, submitted);
            },
            Step::Close(id) => {
                let submitted = self.queue.close(*id);
                self.track(label, submitted);
            },
            Step::CloseAll => {
                let submitted = self.queue.close_all();
                self.track(label, submitted);
            },
            Step::Release(id) => {
                let released = self.leases.remove(id).map_or(0, |leases| leases.len());
                self.transcript.push(format!("{label}: {released} leases released"));
            },
            Step::Wait => self.wait().await,
            Step::Sleep(duration) => tokio::time::sleep(*duration).await,
        }
    }

    /// Resolve everything submitted so far.
    ///
    /// Returns once every request has been settled, except opens parked
    /// waiting for a group member nobody has asked for. Those are reported
    /// once and stay in flight for the next `wait`.
    pub async fn wait(&mut self) {
        let mut updates = self.queue.subscribe();
        let mut remaining = std::mem::take(&mut self.inflight);
        let mut closed = false;

        loop {
            // Mark the current table seen before polling: every caller the
            // worker resolves is followed by a publish.
            let table = updates.borrow_and_update().clone();
            remaining = self.settle(remaining);

            if remaining.is_empty() || closed {
                break;
            }
            if remaining.iter().all(|inflight| inflight.is_parked_in(&table)) {
                self.report_parked(&mut remaining);
                break;
            }
            closed = updates.changed().await.is_err();
        }

        self.inflight = remaining;
    }

    /// Record every request that has been settled; return the rest in order.
    fn settle(&mut self, inflight: Vec<Inflight<R>>) -> Vec<Inflight<R>> {
        let mut remaining = Vec::new();
        for mut item in inflight {
            let settled = match &mut item {
                Inflight::Open { label, ticket, .. } => match ticket.try_outcome() {
                    Some(outcome) => {
                        let line = format!("{label} [{}]", ticket.ticket());
                        self.record_open(line, outcome);
                        true
                    },
                    None => false,
                },
                Inflight::Done { label, completion } => match completion.try_wait() {
                    Some(Ok(())) => {
                        self.transcript.push(format!("{label} [{}]: done", completion.ticket()));
                        true
                    },
                    Some(Err(err)) => {
                        let ticket = completion.ticket();
                        self.transcript.push(format!("{label} [{ticket}]: failed ({err})"));
                        true
                    },
                    None => false,
                },
            };
            if !settled {
                remaining.push(item);
            }
        }
        remaining
    }

    fn record_open(&mut self, line: String, outcome: OpenOutcome<R>) {
        match outcome {
            OpenOutcome::Connected(lease) => {
                let handle = lease.handle();
                self.transcript.push(format!("{line}: connected {handle}"));
                self.leases.entry(handle.id).or_default().push(lease);
            },
            OpenOutcome::Disconnected => self.transcript.push(format!("{line}: disconnected")),
            OpenOutcome::Failed(err) => self.transcript.push(format!("{line}: failed ({err})")),
        }
    }

    fn report_parked(&mut self, inflight: &mut [Inflight<R>]) {
        for item in inflight {
            if let Inflight::Open { label, ticket, parked } = item
                && !*parked
            {
                *parked = true;
                self.transcript.push(format!("{label} [{}]: parked", ticket.ticket()));
            }
        }
    }

    /// Requests submitted but not yet settled, parked opens included.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Leases currently held on `id`, revoked ones included.
    pub fn held(&self, id: ResourceId) -> usize {
        self.leases.get(&id).map_or(0, Vec::len)
    }

    /// Leases currently held that have been revoked.
    pub fn revoked(&self) -> usize {
        self.leases.values().flatten().filter(|lease| lease.is_revoked()).count()
    }

    /// Everything recorded so far.
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// The queue this runner submits to.
    pub fn queue(&self) -> &ResourceQueue<R> {
        &self.queue
    }

    fn track(&mut self, label: String, submitted: Result<Completion, QueueError>) {
        match submitted {
            Ok(completion) => self.inflight.push(Inflight::Done { label, completion }),
            Err(err) => self.transcript.push(format!("{label}: rejected ({err})")),
        }
    }
}
