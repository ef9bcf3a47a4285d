//! Source Routing
//!
//! Decides which sinks receive an outbound fragment. The UI sink always
//! receives everything, for dashboard visibility regardless of where a prompt
//! came from. The sinks registered for the fragment's provenance receive it
//! as well.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::warn;

use crate::messages::Provenance;

/// Provenance → sink mapping, built once at startup
#[derive(Clone, Debug)]
pub struct SourceRegistration<S> {
    ui: Option<S>,
    by_provenance: HashMap<Provenance, Vec<S>>,
}

impl<S> Default for SourceRegistration<S> {
    fn default() -> Self {
        Self {
            ui: None,
            by_provenance: HashMap::new(),
        }
    }
}

impl<S: Clone + PartialEq> SourceRegistration<S> {
    /// Registration with the given UI sink
    #[must_use]
    pub fn new(ui: S) -> Self {
        Self {
            ui: Some(ui),
            by_provenance: HashMap::new(),
        }
    }

    /// Registration without a UI sink (headless deployments)
    #[must_use]
    pub fn headless() -> Self {
        Self::default()
    }

    /// Add a sink for a provenance
    #[must_use]
    pub fn register(mut self, provenance: Provenance, sink: S) -> Self {
        let sinks = self.by_provenance.entry(provenance).or_default();
        if !sinks.contains(&sink) {
            sinks.push(sink);
        }
        self
    }

    /// The UI sink, if any
    #[must_use]
    pub fn ui(&self) -> Option<&S> {
        self.ui.as_ref()
    }

    /// Whether any sink is registered for `provenance`
    #[must_use]
    pub fn is_registered(&self, provenance: Provenance) -> bool {
        self.by_provenance
            .get(&provenance)
            .is_some_and(|sinks| !sinks.is_empty())
    }
}

/// Selects the sinks for an outbound fragment
///
/// Read-only after construction apart from the set of provenances already
/// warned about, so it can be shared freely across tasks.
#[derive(Debug)]
pub struct SourceRouter<S> {
    registration: SourceRegistration<S>,
    warned: Mutex<HashSet<Provenance>>,
}

impl<S: Clone + PartialEq> SourceRouter<S> {
    /// Create a router over a fixed registration
    #[must_use]
    pub fn new(registration: SourceRegistration<S>) -> Self {
        Self {
            registration,
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// The registration this router reads
    #[must_use]
    pub fn registration(&self) -> &SourceRegistration<S> {
        &self.registration
    }

    /// Sinks that should receive a fragment of the given provenance
    ///
    /// Always the UI sink, plus the sinks registered for `provenance`. An
    /// unregistered provenance yields only the UI sink and is logged once.
    #[must_use]
    pub fn select_sinks(&self, provenance: Provenance) -> Vec<S> {
        let mut selected: Vec<S> = self.registration.ui.iter().cloned().collect();

        match self.registration.by_provenance.get(&provenance) {
            Some(sinks) if !sinks.is_empty() => {
                for sink in sinks {
                    if !selected.contains(sink) {
                        selected.push(sink.clone());
                    }
                }
            }
            _ if provenance == Provenance::Ui => {}
            _ => {
                if self.warned.lock().insert(provenance) {
                    warn!(provenance = %provenance, "No sink registered for provenance, routing to UI only");
                }
            }
        }

        selected
    }
}
