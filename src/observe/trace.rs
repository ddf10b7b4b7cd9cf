//! Trace capture and JSONL export.
//!
//! [`TraceRecorder`] is an observer that appends one [`TraceRecord`] per
//! hook. Records are plain serializable data (times, ids, names, amounts),
//! so a captured run can be exported as JSONL — one JSON object per line,
//! with a schema version header — and analyzed offline.

use std::io::{self, Write};

use serde::Serialize;

use crate::error::SimError;
use crate::event::Event;
use crate::observe::Observer;
use crate::process::Process;
use crate::resource::Resource;
use crate::types::{Priority, SimTime};

/// Schema version written as the first line of each JSONL export.
const SCHEMA_VERSION: &str = "1.0.0";

/// One observed kernel action.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceRecord {
    /// An event was pushed onto the heap.
    EventScheduled {
        /// Time of observation.
        now: SimTime,
        /// The scheduled event.
        event: u64,
        /// When it will pop.
        at: SimTime,
        /// Its priority class.
        priority: Priority,
    },
    /// An event was triggered with a success outcome.
    EventSucceeded {
        /// Time of observation.
        now: SimTime,
        /// The triggered event.
        event: u64,
    },
    /// An event was triggered with a failure outcome.
    EventFailed {
        /// Time of observation.
        now: SimTime,
        /// The triggered event.
        event: u64,
        /// The failure rendered as text.
        error: String,
    },
    /// The clock advanced and an event fanned.
    Step {
        /// The new clock value.
        now: SimTime,
        /// The fanned event.
        event: u64,
    },
    /// A process's coroutine executed for the first time.
    ProcessStarted {
        /// Time of observation.
        now: SimTime,
        /// The process.
        process: u64,
        /// Its name.
        name: String,
    },
    /// A process suspended waiting on an event.
    ProcessYielded {
        /// Time of observation.
        now: SimTime,
        /// The process.
        process: u64,
        /// The awaited event.
        event: u64,
    },
    /// A process's coroutine settled.
    ProcessCompleted {
        /// Time of observation.
        now: SimTime,
        /// The process.
        process: u64,
    },
    /// An interrupt was scheduled against a live process.
    ProcessInterrupted {
        /// Time of observation.
        now: SimTime,
        /// The process.
        process: u64,
    },
    /// A resource request was enqueued.
    ResourceRequested {
        /// Time of observation.
        now: SimTime,
        /// The resource.
        resource: u64,
        /// Units requested.
        amount: u64,
    },
    /// Resource units were acquired.
    ResourceAcquired {
        /// Time of observation.
        now: SimTime,
        /// The resource.
        resource: u64,
        /// Units acquired.
        amount: u64,
    },
    /// Resource units were released.
    ResourceReleased {
        /// Time of observation.
        now: SimTime,
        /// The resource.
        resource: u64,
        /// Units released.
        amount: u64,
    },
}

/// An observer that records every hook as a [`TraceRecord`].
///
/// Clones share their record buffer: attach one clone to the environment
/// and keep another to read or export after the run.
///
/// # Example
///
/// ```
/// use eventide::{Environment, TraceRecorder};
///
/// let env = Environment::new();
/// let trace = TraceRecorder::new();
/// env.attach_observer(trace.clone());
/// env.timeout(5.0)?;
/// env.run()?;
/// assert!(!trace.records().is_empty());
/// # Ok::<(), eventide::SimError>(())
/// ```
#[derive(Clone, Default)]
pub struct TraceRecorder {
    records: std::rc::Rc<std::cell::RefCell<Vec<TraceRecord>>>,
}

impl TraceRecorder {
    /// Creates a recorder with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the records captured so far.
    #[must_use]
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.borrow().clone()
    }

    fn push(&self, record: TraceRecord) {
        self.records.borrow_mut().push(record);
    }

    /// Writes the captured records as JSONL: a schema version header, then
    /// one JSON object per line.
    ///
    /// # Errors
    ///
    /// I/O errors from the writer; serialization failures surface as
    /// `io::Error` with [`io::ErrorKind::InvalidData`].
    pub fn export_jsonl(&self, writer: &mut impl Write) -> io::Result<()> {
        writeln!(writer, "{{\"schema_version\":\"{SCHEMA_VERSION}\"}}")?;
        for record in self.records.borrow().iter() {
            let line = serde_json::to_string(record)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            writeln!(writer, "{line}")?;
        }
        writer.flush()
    }
}

impl Observer for TraceRecorder {
    fn on_event_scheduled(&mut self, now: SimTime, event: &Event, at: SimTime, priority: Priority) {
        self.push(TraceRecord::EventScheduled {
            now,
            event: event.id().as_u64(),
            at,
            priority,
        });
    }

    fn on_event_succeeded(&mut self, now: SimTime, event: &Event) {
        self.push(TraceRecord::EventSucceeded {
            now,
            event: event.id().as_u64(),
        });
    }

    fn on_event_failed(&mut self, now: SimTime, event: &Event, error: &SimError) {
        self.push(TraceRecord::EventFailed {
            now,
            event: event.id().as_u64(),
            error: error.to_string(),
        });
    }

    fn on_step(&mut self, now: SimTime, event: &Event) {
        self.push(TraceRecord::Step {
            now,
            event: event.id().as_u64(),
        });
    }

    fn on_process_started(&mut self, now: SimTime, process: &Process) {
        self.push(TraceRecord::ProcessStarted {
            now,
            process: process.id().as_u64(),
            name: process.name().to_owned(),
        });
    }

    fn on_process_yielded(&mut self, now: SimTime, process: &Process, event: &Event) {
        self.push(TraceRecord::ProcessYielded {
            now,
            process: process.id().as_u64(),
            event: event.id().as_u64(),
        });
    }

    fn on_process_completed(&mut self, now: SimTime, process: &Process) {
        self.push(TraceRecord::ProcessCompleted {
            now,
            process: process.id().as_u64(),
        });
    }

    fn on_process_interrupted(&mut self, now: SimTime, process: &Process) {
        self.push(TraceRecord::ProcessInterrupted {
            now,
            process: process.id().as_u64(),
        });
    }

    fn on_resource_requested(&mut self, now: SimTime, resource: &Resource, amount: u64) {
        self.push(TraceRecord::ResourceRequested {
            now,
            resource: resource.id().as_u64(),
            amount,
        });
    }

    fn on_resource_acquired(&mut self, now: SimTime, resource: &Resource, amount: u64) {
        self.push(TraceRecord::ResourceAcquired {
            now,
            resource: resource.id().as_u64(),
            amount,
        });
    }

    fn on_resource_released(&mut self, now: SimTime, resource: &Resource, amount: u64) {
        self.push(TraceRecord::ResourceReleased {
            now,
            resource: resource.id().as_u64(),
            amount,
        });
    }
}
