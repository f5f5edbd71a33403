//! Operations/bindings table supplied by the WSDL collaborator.
//!
//! WSDL parsing itself happens outside the core; this module consumes
//! the exposed table only: operation names, SOAPActions, input messages
//! (by element or name) and bindings. The configuration can declare the
//! table inline, which is also how tests construct it.

use serde::Deserialize;

pub const SOAP_11_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_12_ENVELOPE_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoapVersion {
    Soap11,
    Soap12,
}

/// A qualified XML name.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct QName {
    pub namespace: Option<String>,
    pub local: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WsdlOperation {
    pub name: String,
    pub soap_action: Option<String>,
    pub binding: Option<String>,
    /// Input message element, when the WSDL binds by element.
    pub input_element: Option<QName>,
    /// Input message name, when the WSDL binds by name only.
    pub input_name: Option<String>,
    /// Envelope namespace of the operation's binding; selects the fault
    /// version.
    pub envelope_namespace: Option<String>,
}

impl WsdlOperation {
    pub fn soap_version(&self) -> SoapVersion {
        match self.envelope_namespace.as_deref() {
            Some(SOAP_12_ENVELOPE_NS) => SoapVersion::Soap12,
            Some(_) => SoapVersion::Soap11,
            None => SoapVersion::Soap11,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WsdlCatalog {
    pub operations: Vec<WsdlOperation>,
}

impl WsdlCatalog {
    /// Resolve the operation for a request: SOAPAction first, then the
    /// body root's (namespace, local-name) against input elements, then
    /// input local-name alone. Anything but exactly one hit at a stage
    /// falls through; no hit anywhere means no operation.
    pub fn find_operation(
        &self,
        soap_action: Option<&str>,
        body_root: Option<&QName>,
    ) -> Option<&WsdlOperation> {
        if let Some(action) = soap_action.filter(|a| !a.is_empty()) {
            let matches: Vec<&WsdlOperation> = self
                .operations
                .iter()
                .filter(|op| op.soap_action.as_deref() == Some(action))
                .collect();
            if matches.len() == 1 {
                return Some(matches[0]);
            }
        }

        let root = body_root?;
        if root.namespace.is_some() {
            let matches: Vec<&WsdlOperation> = self
                .operations
                .iter()
                .filter(|op| op.input_element.as_ref() == Some(root))
                .collect();
            if matches.len() == 1 {
                return Some(matches[0]);
            }
        }

        let matches: Vec<&WsdlOperation> = self
            .operations
            .iter()
            .filter(|op| {
                op.input_element
                    .as_ref()
                    .map(|element| element.local == root.local)
                    .unwrap_or(false)
                    || op.input_name.as_deref() == Some(root.local.as_str())
            })
            .collect();
        if matches.len() == 1 {
            return Some(matches[0]);
        }
        None
    }

    /// Fault version when no operation was resolved.
    pub fn default_version(&self) -> SoapVersion {
        self.operations
            .first()
            .map(WsdlOperation::soap_version)
            .unwrap_or(SoapVersion::Soap11)
    }
}

/// SOAP-specific request facts handed to the matcher.
#[derive(Clone, Debug, Default)]
pub struct SoapContext {
    pub operation: Option<String>,
    pub soap_action: Option<String>,
    pub binding: Option<String>,
}
