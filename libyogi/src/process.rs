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

//! The process interface: one per process, owning the process's unique
//! Node, its Scheduler and the observable `Process/*` terminals.
//!
//! | Terminal | Variant | Payload |
//! |---|---|---|
//! | `Process/Operational` | cached producer | 1 byte bool |
//! | `Process/Errors`, `Process/Warnings` | cached producer | NUL separated names |
//! | `Process/Log` | producer | timestamp, severity, JSON metadata, message |
//! | `Process/<sink> Log Verbosity/Max Verbosity` | cached master | 1 byte level |
//! | `Process/<sink> Log Verbosity/Components/<c>` | cached master | 1 byte level |
//!
//! Anomalies (errors and warnings) and operational conditions are plain
//! handles; dropping one deregisters it and republishes the affected
//! terminals. Operational is the conjunction of all conditions.

use std::{
    cell::Cell,
    collections::BTreeMap,
    sync::{Arc, Mutex, Weak},
    time,
};

use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use yogi_protocol::{Signature, TerminalKind};

use crate::{
    config::Configuration,
    connection::LocalConnection,
    endpoint::{Leaf, Node},
    errors::Result,
    path::Path,
    scheduler::Scheduler,
    terminal::Terminal,
    wire,
};

const SIG_BOOL: Signature = Signature(0x0000_0001);
const SIG_STRING_LIST: Signature = Signature(0x0000_040d);
const SIG_LOG: Signature = Signature(0x0000_09cd);
const SIG_VERBOSITY: Signature = Signature(0x0000_000d);

pub type LevelHandle = tracing_subscriber::reload::Handle<
    tracing_subscriber::filter::LevelFilter,
    tracing_subscriber::registry::Registry,
>;

/// Log severities carried on the wire and in the config
/// (`logging.*.max-verbosity`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Fatal = 0,
    Error = 1,
    Warning = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Verbosity {
    pub fn from_name(name: &str) -> Option<Verbosity> {
        match name {
            "FATAL" => Some(Verbosity::Fatal),
            "ERROR" => Some(Verbosity::Error),
            "WARNING" => Some(Verbosity::Warning),
            "INFO" => Some(Verbosity::Info),
            "DEBUG" => Some(Verbosity::Debug),
            "TRACE" => Some(Verbosity::Trace),
            _ => None,
        }
    }

    pub fn from_u8(v: u8) -> Option<Verbosity> {
        match v {
            0 => Some(Verbosity::Fatal),
            1 => Some(Verbosity::Error),
            2 => Some(Verbosity::Warning),
            3 => Some(Verbosity::Info),
            4 => Some(Verbosity::Debug),
            5 => Some(Verbosity::Trace),
            _ => None,
        }
    }

    pub fn level_filter(self) -> tracing_subscriber::filter::LevelFilter {
        use tracing_subscriber::filter::LevelFilter;
        match self {
            Verbosity::Fatal | Verbosity::Error => LevelFilter::ERROR,
            Verbosity::Warning => LevelFilter::WARN,
            Verbosity::Info => LevelFilter::INFO,
            Verbosity::Debug => LevelFilter::DEBUG,
            Verbosity::Trace => LevelFilter::TRACE,
        }
    }

    fn from_tracing(level: &tracing::Level) -> Verbosity {
        match *level {
            tracing::Level::ERROR => Verbosity::Error,
            tracing::Level::WARN => Verbosity::Warning,
            tracing::Level::INFO => Verbosity::Info,
            tracing::Level::DEBUG => Verbosity::Debug,
            tracing::Level::TRACE => Verbosity::Trace,
        }
    }
}

struct PiState {
    next_id: u64,
    errors: BTreeMap<u64, String>,
    warnings: BTreeMap<u64, String>,
    conditions: BTreeMap<u64, bool>,
}

struct PiTerminals {
    operational: Terminal,
    errors: Terminal,
    warnings: Terminal,
    log: Terminal,
    // kept for their cache; remote verbosity changes arrive through
    // the receive pumps
    _stdout_verbosity: Arc<Terminal>,
    _yogi_verbosity: Arc<Terminal>,
    _components: Vec<Arc<Terminal>>,
}

struct PiInner {
    scheduler: Scheduler,
    node: Node,
    leaf: Leaf,
    _leaf_conn: LocalConnection,
    location: Path,
    terminals: PiTerminals,
    state: Mutex<PiState>,
}

impl PiInner {
    fn republish_operational(&self) {
        let operational = {
            let st = self.state.lock().unwrap();
            st.conditions.values().all(|set| *set)
        };
        let _ = self.terminals.operational.publish(&[operational as u8]);
    }

    fn republish_anomalies(&self, errors: bool) {
        let payload = {
            let st = self.state.lock().unwrap();
            let map = if errors { &st.errors } else { &st.warnings };
            map.values().cloned().collect::<Vec<_>>().join("\0").into_bytes()
        };
        let terminal = if errors { &self.terminals.errors } else { &self.terminals.warnings };
        let _ = terminal.publish(&payload);
    }

    fn publish_log(&self, severity: Verbosity, component: &str, message: &str) {
        let timestamp = time::SystemTime::now()
            .duration_since(time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let json = serde_json::json!({ "component": component }).to_string();

        let mut payload = Vec::with_capacity(message.len() + json.len() + 16);
        payload.extend_from_slice(&timestamp.to_le_bytes());
        payload.push(severity as u8);
        wire::put_cstring(&mut payload, &json);
        payload.extend_from_slice(message.as_bytes());

        let _ = self.terminals.log.publish(&payload);
    }
}

/// The explicit process-scope singleton. Create it once at startup and
/// thread it through; there is no implicit global access.
pub struct ProcessInterface {
    inner: Arc<PiInner>,
}

impl ProcessInterface {
    pub fn new(config: &Configuration) -> Result<ProcessInterface> {
        Self::with_log_handle(config, None)
    }

    /// With a reload handle, remote writes to the stdout verbosity
    /// terminals adjust the process log filter.
    pub fn with_log_handle(
        config: &Configuration,
        log_handle: Option<LevelHandle>,
    ) -> Result<ProcessInterface> {
        let scheduler = Scheduler::new();
        let node = Node::new(&scheduler);
        let leaf = Leaf::new(&scheduler);
        let leaf_conn = LocalConnection::new(&leaf, &node)?;
        let location = config.location()?;

        let process = |suffix: &str| -> Result<String> {
            Ok(location.join_str(suffix)?.to_string())
        };

        let operational =
            Terminal::new(&leaf, TerminalKind::CachedProducer, &process("Process/Operational")?, SIG_BOOL)?;
        let errors = Terminal::new(
            &leaf,
            TerminalKind::CachedProducer,
            &process("Process/Errors")?,
            SIG_STRING_LIST,
        )?;
        let warnings = Terminal::new(
            &leaf,
            TerminalKind::CachedProducer,
            &process("Process/Warnings")?,
            SIG_STRING_LIST,
        )?;
        let log =
            Terminal::new(&leaf, TerminalKind::Producer, &process("Process/Log")?, SIG_LOG)?;

        let mut components = Vec::new();
        let stdout_verbosity = Self::verbosity_tree(
            &leaf,
            config,
            &location,
            "Standard Output Log Verbosity",
            "logging.stdout",
            log_handle.clone(),
            &mut components,
        )?;
        let yogi_verbosity = Self::verbosity_tree(
            &leaf,
            config,
            &location,
            "YOGI Log Verbosity",
            "logging.yogi",
            None,
            &mut components,
        )?;

        let inner = Arc::new(PiInner {
            scheduler,
            node,
            leaf,
            _leaf_conn: leaf_conn,
            location,
            terminals: PiTerminals {
                operational,
                errors,
                warnings,
                log,
                _stdout_verbosity: stdout_verbosity,
                _yogi_verbosity: yogi_verbosity,
                _components: components,
            },
            state: Mutex::new(PiState {
                next_id: 1,
                errors: BTreeMap::new(),
                warnings: BTreeMap::new(),
                conditions: BTreeMap::new(),
            }),
        });

        inner.republish_operational();
        inner.republish_anomalies(true);
        inner.republish_anomalies(false);

        Ok(ProcessInterface { inner })
    }

    fn verbosity_tree(
        leaf: &Leaf,
        config: &Configuration,
        location: &Path,
        tree: &str,
        config_prefix: &str,
        handle: Option<LevelHandle>,
        components: &mut Vec<Arc<Terminal>>,
    ) -> Result<Arc<Terminal>> {
        let max_verbosity = config
            .get_optional_string(&format!("{config_prefix}.max-verbosity"))
            .and_then(|s| Verbosity::from_name(&s))
            .unwrap_or(Verbosity::Info);

        let name = location.join_str(&format!("Process/{tree}/Max Verbosity"))?.to_string();
        let terminal =
            Arc::new(Terminal::new(leaf, TerminalKind::CachedMaster, &name, SIG_VERBOSITY)?);
        let _ = terminal.publish(&[max_verbosity as u8]);
        pump_verbosity(&terminal, handle.clone());

        if let Ok(entries) = config.child(&format!("{config_prefix}.component-verbosity")) {
            if let Some(map) = entries.as_object() {
                for (component, level) in map {
                    let verbosity = level
                        .as_str()
                        .and_then(Verbosity::from_name)
                        .unwrap_or(max_verbosity);
                    let name = location
                        .join_str(&format!("Process/{tree}/Components/{component}"))?
                        .to_string();
                    let terminal = Arc::new(Terminal::new(
                        leaf,
                        TerminalKind::CachedMaster,
                        &name,
                        SIG_VERBOSITY,
                    )?);
                    let _ = terminal.publish(&[verbosity as u8]);
                    pump_verbosity(&terminal, None);
                    components.push(terminal);
                }
            }
        }

        Ok(terminal)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn node(&self) -> &Node {
        &self.inner.node
    }

    pub fn leaf(&self) -> &Leaf {
        &self.inner.leaf
    }

    pub fn location(&self) -> &Path {
        &self.inner.location
    }

    /// The conjunction of all operational conditions.
    pub fn operational(&self) -> bool {
        self.inner.state.lock().unwrap().conditions.values().all(|set| *set)
    }

    pub fn add_error(&self, name: &str) -> Anomaly {
        self.add_anomaly(name, true)
    }

    pub fn add_warning(&self, name: &str) -> Anomaly {
        self.add_anomaly(name, false)
    }

    fn add_anomaly(&self, name: &str, error: bool) -> Anomaly {
        let id = {
            let mut st = self.inner.state.lock().unwrap();
            let id = st.next_id;
            st.next_id += 1;
            let map = if error { &mut st.errors } else { &mut st.warnings };
            map.insert(id, String::from(name));
            id
        };
        self.inner.republish_anomalies(error);
        Anomaly { pi: Arc::downgrade(&self.inner), id, error }
    }

    /// A new condition starts unset, so the process becomes
    /// non-operational until it is set.
    pub fn add_operational_condition(&self, _name: &str) -> OperationalCondition {
        let id = {
            let mut st = self.inner.state.lock().unwrap();
            let id = st.next_id;
            st.next_id += 1;
            st.conditions.insert(id, false);
            id
        };
        self.inner.republish_operational();
        OperationalCondition { pi: Arc::downgrade(&self.inner), id }
    }

    /// A tracing layer that republishes every log event on the
    /// `Process/Log` terminal.
    pub fn log_layer(&self) -> ProcessLogLayer {
        ProcessLogLayer { pi: Arc::new(Mutex::new(Arc::downgrade(&self.inner))) }
    }

    /// Wire a layer that was registered with the subscriber before
    /// this interface existed.
    pub fn attach_log_layer(&self, layer: &ProcessLogLayer) {
        *layer.pi.lock().unwrap() = Arc::downgrade(&self.inner);
    }
}

// Cached masters pick up verbosity changes published by remote slaves;
// the stdout tree additionally drives the process log filter. The pump
// closure holds only a weak reference so the terminal can still be
// destroyed.
fn pump_verbosity(terminal: &Arc<Terminal>, handle: Option<LevelHandle>) {
    let weak = Arc::downgrade(terminal);
    // fails only if a pump is already registered
    let _ = terminal.async_receive_message(move |res| {
        if let Ok(message) = res {
            if let Some(handle) = &handle {
                if let Some(verbosity) =
                    message.payload.first().copied().and_then(Verbosity::from_u8)
                {
                    let _ = handle.modify(|filter| *filter = verbosity.level_filter());
                }
            }
            if let Some(terminal) = weak.upgrade() {
                pump_verbosity(&terminal, handle);
            }
        }
    });
}

/// A registered error or warning; deregisters on drop.
pub struct Anomaly {
    pi: Weak<PiInner>,
    id: u64,
    error: bool,
}

impl Drop for Anomaly {
    fn drop(&mut self) {
        if let Some(pi) = self.pi.upgrade() {
            {
                let mut st = pi.state.lock().unwrap();
                let map = if self.error { &mut st.errors } else { &mut st.warnings };
                map.remove(&self.id);
            }
            pi.republish_anomalies(self.error);
        }
    }
}

/// A manually driven operational condition.
pub struct OperationalCondition {
    pi: Weak<PiInner>,
    id: u64,
}

impl OperationalCondition {
    pub fn set(&self) {
        self.put(true);
    }

    pub fn clear(&self) {
        self.put(false);
    }

    fn put(&self, value: bool) {
        if let Some(pi) = self.pi.upgrade() {
            {
                let mut st = pi.state.lock().unwrap();
                if let Some(entry) = st.conditions.get_mut(&self.id) {
                    *entry = value;
                }
            }
            pi.republish_operational();
        }
    }
}

impl Drop for OperationalCondition {
    fn drop(&mut self) {
        if let Some(pi) = self.pi.upgrade() {
            {
                let mut st = pi.state.lock().unwrap();
                st.conditions.remove(&self.id);
            }
            pi.republish_operational();
        }
    }
}

thread_local! {
    // publishing a log entry must not log recursively
    static IN_LOG_PUBLISH: Cell<bool> = const { Cell::new(false) };
}

/// Forwards tracing events to the `Process/Log` terminal.
///
/// The subscriber stack is assembled before the process interface
/// exists, so the layer starts detached and gets wired up with
/// [`ProcessInterface::attach_log_layer`].
#[derive(Clone)]
pub struct ProcessLogLayer {
    pi: Arc<Mutex<Weak<PiInner>>>,
}

impl ProcessLogLayer {
    pub fn detached() -> ProcessLogLayer {
        ProcessLogLayer { pi: Arc::new(Mutex::new(Weak::new())) }
    }
}

impl<S> tracing_subscriber::Layer<S> for ProcessLogLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let Some(pi) = self.pi.lock().unwrap().upgrade() else {
            return;
        };
        IN_LOG_PUBLISH.with(|guard| {
            if guard.get() {
                return;
            }
            guard.set(true);
            let mut visitor = MessageVisitor::default();
            event.record(&mut visitor);
            pi.publish_log(
                Verbosity::from_tracing(event.metadata().level()),
                event.metadata().target(),
                &visitor.message,
            );
            guard.set(false);
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn operational_follows_conditions() {
        let pi = ProcessInterface::new(&Configuration::new()).expect("process interface");
        assert!(pi.operational());

        let oc1 = pi.add_operational_condition("OC 1");
        assert!(!pi.operational());
        oc1.set();
        assert!(pi.operational());

        let oc2 = pi.add_operational_condition("OC 2");
        assert!(!pi.operational());
        oc2.set();
        assert!(pi.operational());
        oc2.clear();
        assert!(!pi.operational());
        drop(oc2);
        assert!(pi.operational());

        oc1.clear();
        assert!(!pi.operational());
        drop(oc1);
        assert!(pi.operational());
    }

    #[test]
    fn anomalies_publish_their_names() {
        let pi = ProcessInterface::new(&Configuration::new()).expect("process interface");

        let _e1 = pi.add_error("Out of coffee");
        let w1 = pi.add_warning("Low on sugar");
        {
            let st = pi.inner.state.lock().unwrap();
            assert_eq!(vec!["Out of coffee"], st.errors.values().collect::<Vec<_>>());
            assert_eq!(vec!["Low on sugar"], st.warnings.values().collect::<Vec<_>>());
        }

        drop(w1);
        let st = pi.inner.state.lock().unwrap();
        assert!(st.warnings.is_empty());
    }

    #[test]
    fn verbosity_names_round_trip() {
        for name in ["FATAL", "ERROR", "WARNING", "INFO", "DEBUG", "TRACE"] {
            let verbosity = Verbosity::from_name(name).expect("known name");
            assert_eq!(Some(verbosity), Verbosity::from_u8(verbosity as u8));
        }
        assert_eq!(None, Verbosity::from_name("LOUD"));
    }
}
