use serde::Serialize;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum BusError {
    #[error("Path {0} is not registered")]
    UnknownPath(String),
    #[error("Path {0} is already registered")]
    AlreadyRegistered(String),
    #[error("Path {0} is not writeable")]
    NotWriteable(String),
    #[error("Change to {0} was rejected")]
    Rejected(String),
}

/// A value held by a bus path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BusValue {
    Empty,
    Int(i64),
    Float(f64),
    Text(String),
}

impl BusValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BusValue::Int(v) => Some(*v as f64),
            BusValue::Float(v) => Some(*v),
            BusValue::Empty | BusValue::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            BusValue::Int(v) => Some(*v),
            BusValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }
}

impl fmt::Display for BusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusValue::Empty => f.write_str("[]"),
            BusValue::Int(v) => write!(f, "{v}"),
            BusValue::Float(v) => write!(f, "{v}"),
            BusValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<f64> for BusValue {
    fn from(value: f64) -> Self {
        BusValue::Float(value)
    }
}

impl From<i64> for BusValue {
    fn from(value: i64) -> Self {
        BusValue::Int(value)
    }
}

impl From<u8> for BusValue {
    fn from(value: u8) -> Self {
        BusValue::Int(value.into())
    }
}

impl From<&str> for BusValue {
    fn from(value: &str) -> Self {
        BusValue::Text(value.to_string())
    }
}

impl From<String> for BusValue {
    fn from(value: String) -> Self {
        BusValue::Text(value)
    }
}

/// Renders a path's value for observers that want text instead of raw numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Plain,
    Watt,
    Volt,
    Ampere,
    KiloWattHour,
}

impl TextFormat {
    pub fn unit(self) -> &'static str {
        match self {
            TextFormat::Plain => "",
            TextFormat::Watt => "W",
            TextFormat::Volt => "V",
            TextFormat::Ampere => "A",
            TextFormat::KiloWattHour => "kWh",
        }
    }

    pub fn render(self, value: &BusValue) -> String {
        match (self, value.as_f64()) {
            (TextFormat::Plain, _) | (_, None) => value.to_string(),
            (_, Some(v)) => format!("{}{}", (v * 100.0).round() / 100.0, self.unit()),
        }
    }
}

/// Called for every write coming from another bus client. Returning `false`
/// rejects the change.
pub type ChangeHandler = Box<dyn Fn(&str, &BusValue) -> bool + Send + Sync>;

/// The operations this service needs from the data bus.
pub trait MetricPublisher {
    fn register(
        &self,
        path: &str,
        initial: BusValue,
        format: TextFormat,
        writeable: bool,
    ) -> Result<(), BusError>;

    fn write(&self, path: &str, value: BusValue) -> Result<(), BusError>;

    fn read(&self, path: &str) -> Option<BusValue>;

    fn text(&self, path: &str) -> Option<String>;

    fn on_external_change(&self, handler: ChangeHandler);
}

/// Notification sent to subscribers whenever a path changes value.
#[derive(Debug, Clone, PartialEq)]
pub struct PathChange {
    pub path: String,
    pub value: BusValue,
}

#[derive(Debug, Clone)]
struct BusItem {
    value: BusValue,
    format: TextFormat,
    writeable: bool,
}

/// In-process bus service holding the published paths of one device.
/// Clones share the same paths.
#[derive(Clone)]
pub struct LocalBus {
    service_name: Arc<str>,
    items: Arc<Mutex<BTreeMap<String, BusItem>>>,
    change_handler: Arc<Mutex<Option<ChangeHandler>>>,
    changes: broadcast::Sender<PathChange>,
}

impl LocalBus {
    pub fn new(service_name: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            service_name: service_name.into().into(),
            items: Arc::new(Mutex::new(BTreeMap::new())),
            change_handler: Arc::new(Mutex::new(None)),
            changes,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PathChange> {
        self.changes.subscribe()
    }

    pub fn paths(&self) -> Vec<String> {
        self.items().keys().cloned().collect()
    }

    /// JSON object of every path and its current value.
    pub fn dump(&self) -> serde_json::Value {
        let items = self.items();
        serde_json::Value::Object(
            items
                .iter()
                .map(|(path, item)| {
                    let value = serde_json::to_value(&item.value).unwrap_or_default();
                    (path.clone(), value)
                })
                .collect(),
        )
    }

    /// Applies a write made by another bus client. Writeable paths accept any
    /// value the change handler agrees to, and the stored value is echoed back.
    pub fn external_write(&self, path: &str, value: BusValue) -> Result<BusValue, BusError> {
        {
            let items = self.items();
            match items.get(path) {
                None => return Err(BusError::UnknownPath(path.to_string())),
                Some(item) if !item.writeable => {
                    return Err(BusError::NotWriteable(path.to_string()))
                }
                Some(_) => {}
            }
        }

        let accepted = match self.handler().as_ref() {
            Some(handler) => handler(path, &value),
            None => true,
        };
        if !accepted {
            return Err(BusError::Rejected(path.to_string()));
        }

        self.write(path, value.clone())?;
        Ok(value)
    }

    fn items(&self) -> MutexGuard<'_, BTreeMap<String, BusItem>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handler(&self) -> MutexGuard<'_, Option<ChangeHandler>> {
        self.change_handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBus")
            .field("service_name", &self.service_name)
            .field("paths", &self.items().len())
            .finish()
    }
}

impl MetricPublisher for LocalBus {
    fn register(
        &self,
        path: &str,
        initial: BusValue,
        format: TextFormat,
        writeable: bool,
    ) -> Result<(), BusError> {
        let mut items = self.items();
        if items.contains_key(path) {
            return Err(BusError::AlreadyRegistered(path.to_string()));
        }
        debug!("{}: registered {path} = {initial}", self.service_name);
        items.insert(
            path.to_string(),
            BusItem {
                value: initial,
                format,
                writeable,
            },
        );
        Ok(())
    }

    fn write(&self, path: &str, value: BusValue) -> Result<(), BusError> {
        let mut items = self.items();
        let item = items
            .get_mut(path)
            .ok_or_else(|| BusError::UnknownPath(path.to_string()))?;
        if item.value == value {
            return Ok(());
        }
        item.value = value.clone();
        drop(items);

        // Nobody listening is fine.
        let _ = self.changes.send(PathChange {
            path: path.to_string(),
            value,
        });
        Ok(())
    }

    fn read(&self, path: &str) -> Option<BusValue> {
        self.items().get(path).map(|item| item.value.clone())
    }

    fn text(&self, path: &str) -> Option<String> {
        self.items()
            .get(path)
            .map(|item| item.format.render(&item.value))
    }

    fn on_external_change(&self, handler: ChangeHandler) {
        *self.handler() = Some(handler);
    }
}
