//! Network provider settings and multus selector parsing.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::OsdError;

/// Network provider settings for the cluster's daemons.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Network provider, one of `host`, `multus` or empty for the platform default.
    #[serde(default)]
    pub provider: String,
    /// Multus network selectors keyed by interface role (`public`, `cluster`).
    #[serde(default)]
    pub selectors: BTreeMap<String, String>,
    /// Legacy flag equivalent to `provider: host`.
    #[serde(default)]
    pub host_network: bool,
}

impl NetworkSpec {
    /// Indicates if daemons should share the host network namespace.
    pub fn is_host(&self) -> bool {
        self.host_network || self.provider == "host"
    }

    /// Indicates if the multus provider is selected.
    pub fn is_multus(&self) -> bool {
        self.provider == "multus"
    }

    /// Parse the selector for the given interface role, if declared.
    ///
    /// Parsing is lenient; pass a validator to reject selectors the caller
    /// considers malformed.
    pub fn multus_selector(&self, role: &str, validate: Option<MultusValidator>) -> Option<Result<MultusSelector, OsdError>> {
        self.selectors.get(role).map(|raw| MultusSelector::parse(raw, validate))
    }
}

/// Validation hook applied to parsed multus selectors.
///
/// The parser itself accepts selectors with a missing name or interface;
/// callers decide what is acceptable by supplying a hook such as
/// [`require_name_and_interface`].
pub type MultusValidator = fn(&MultusSelector) -> Result<(), String>;

/// A stock validator which rejects selectors missing a name or an interface.
pub fn require_name_and_interface(selector: &MultusSelector) -> Result<(), String> {
    if selector.name.is_empty() {
        return Err("selector is missing the network attachment name".into());
    }
    if selector.interface.is_empty() {
        return Err("selector is missing the interface name".into());
    }
    Ok(())
}

/// A parsed multus network selector.
///
/// Selectors come in a short form `<ns>/<name>@<iface>` where the namespace
/// and interface parts are optional, or as a JSON object
/// `{"name": ..., "namespace": ..., "interface": ...}`. Both forms with the
/// same fields parse to the same value.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct MultusSelector {
    /// Name of the network attachment definition.
    pub name: String,
    /// Namespace holding the attachment definition, empty for the local one.
    pub namespace: String,
    /// Interface name to bind inside the pod.
    pub interface: String,
}

impl MultusSelector {
    /// Parse a selector in either the short or the JSON form.
    pub fn parse(raw: &str, validate: Option<MultusValidator>) -> Result<Self, OsdError> {
        let raw = raw.trim();
        let selector = if raw.starts_with('{') {
            serde_json::from_str::<Self>(raw).map_err(|err| OsdError::Configuration(format!("invalid multus selector JSON: {}", err)))?
        } else {
            Self::parse_short_form(raw)
        };
        if let Some(validate) = validate {
            validate(&selector).map_err(|err| OsdError::Configuration(format!("invalid multus selector {:?}: {}", raw, err)))?;
        }
        Ok(selector)
    }

    fn parse_short_form(raw: &str) -> Self {
        let (rest, interface) = match raw.split_once('@') {
            Some((rest, iface)) => (rest, iface.to_string()),
            None => (raw, String::new()),
        };
        let (namespace, name) = match rest.split_once('/') {
            Some((ns, name)) => (ns.to_string(), name.to_string()),
            None => (String::new(), rest.to_string()),
        };
        Self { name, namespace, interface }
    }
}

impl std::fmt::Display for MultusSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.namespace.is_empty() {
            write!(f, "{}/", self.namespace)?;
        }
        write!(f, "{}", self.name)?;
        if !self.interface.is_empty() {
            write!(f, "@{}", self.interface)?;
        }
        Ok(())
    }
}
