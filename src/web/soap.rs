//! SOAP-over-HTTP handling.
//!
//! Pre-steps before the shared pipeline: reject non-POST, parse the
//! envelope, locate the single element child of `Body`, determine the
//! SOAPAction and resolve the operation from the WSDL collaborator's
//! table. Faults are rendered in the version the operation's binding
//! speaks.

use actix_web::http::StatusCode;
use xmltree::Element;

use crate::exchange::Exchange;
use crate::matcher::select_best;
use crate::query::first_element_child;
use crate::server::ServerState;
use crate::web::handlers::{run_interceptors, run_resource, score_resources};
use crate::wsdl::{QName, SoapContext, SoapVersion, SOAP_12_ENVELOPE_NS};

pub(crate) async fn soap_pipeline(exchange: &mut Exchange, state: &ServerState) {
    if exchange.request.method() != "POST" {
        debug!("rejecting non-POST soap request");
        exchange.state.status = StatusCode::METHOD_NOT_ALLOWED.as_u16();
        exchange.state.set_header("Content-Type", "text/plain");
        exchange.state.body = b"Method Not Allowed".to_vec();
        exchange.state.handled = true;
        return;
    }

    let catalog = state.config.wsdl.clone().unwrap_or_default();
    let envelope = parse_envelope(&exchange.request.body_string());
    let Some(envelope) = envelope else {
        state.metrics.incr("soap.envelope_invalid");
        send_fault(
            exchange,
            catalog.default_version(),
            "Invalid SOAP envelope",
            StatusCode::BAD_REQUEST,
        );
        return;
    };

    let soap_action = extract_soap_action(exchange);
    let operation = catalog.find_operation(soap_action.as_deref(), Some(&envelope.body_root));

    let fault_version = operation
        .map(|op| op.soap_version())
        .unwrap_or(envelope.version);
    let soap_ctx = SoapContext {
        operation: operation.map(|op| op.name.clone()),
        soap_action,
        binding: operation.and_then(|op| op.binding.clone()),
    };
    debug!(
        "soap request: operation={:?} action={:?}",
        soap_ctx.operation, soap_ctx.soap_action
    );

    if !run_interceptors(exchange, state, Some(&soap_ctx)).await {
        return;
    }

    let candidates = score_resources(exchange, state, Some(&soap_ctx));
    let Some(best) = select_best(candidates) else {
        state.metrics.incr("request.no_match");
        send_fault(
            exchange,
            fault_version,
            "No matching operation",
            StatusCode::NOT_FOUND,
        );
        return;
    };

    let resource = best.resource;
    // the SOAP operation names the resource for admission control
    let name = resource
        .matcher
        .operation
        .clone()
        .or_else(|| resource.matcher.path.clone())
        .unwrap_or_default();
    run_resource(exchange, state, resource, &name, Some(&soap_ctx)).await;
}

struct ParsedEnvelope {
    body_root: QName,
    version: SoapVersion,
}

/// Parse the request body and locate the first element child of `Body`.
fn parse_envelope(raw: &str) -> Option<ParsedEnvelope> {
    let root = Element::parse(raw.as_bytes()).ok()?;
    if root.name != "Envelope" {
        return None;
    }
    let version = match root.namespace.as_deref() {
        Some(SOAP_12_ENVELOPE_NS) => SoapVersion::Soap12,
        _ => SoapVersion::Soap11,
    };
    let body = root
        .children
        .iter()
        .find_map(|node| node.as_element().filter(|el| el.name == "Body"))?;
    let first_child = first_element_child(body)?;
    Some(ParsedEnvelope {
        body_root: QName {
            namespace: first_child.namespace.clone(),
            local: first_child.name.clone(),
        },
        version,
    })
}

/// SOAPAction from the request header (trimmed of quotes) or, for SOAP
/// 1.2, from the `action=` parameter of the Content-Type.
fn extract_soap_action(exchange: &Exchange) -> Option<String> {
    if let Some(header) = exchange.request.header("SOAPAction") {
        let action = header.trim().trim_matches('"');
        if !action.is_empty() {
            return Some(action.to_owned());
        }
    }
    let content_type = exchange.request.header("Content-Type")?;
    for part in content_type.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("action=") {
            let action = value.trim_matches('"');
            if !action.is_empty() {
                return Some(action.to_owned());
            }
        }
    }
    None
}

/// Write a version-appropriate fault envelope onto the response-state.
pub(crate) fn send_fault(
    exchange: &mut Exchange,
    version: SoapVersion,
    message: &str,
    status: StatusCode,
) {
    exchange.state.status = status.as_u16();
    exchange
        .state
        .set_header("Content-Type", "application/soap+xml");
    exchange.state.body = fault_envelope(version, message).into_bytes();
    exchange.state.handled = true;
}

fn fault_envelope(version: SoapVersion, message: &str) -> String {
    match version {
        SoapVersion::Soap11 => format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<env:Envelope xmlns:env="http://schemas.xmlsoap.org/soap/envelope/">
  <env:Body>
    <env:Fault>
      <faultcode>env:Server</faultcode>
      <faultstring>{}</faultstring>
    </env:Fault>
  </env:Body>
</env:Envelope>"#,
            xml_escape(message)
        ),
        SoapVersion::Soap12 => format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope">
  <env:Body>
    <env:Fault>
      <env:Code>
        <env:Value>env:Receiver</env:Value>
      </env:Code>
      <env:Reason>
        <env:Text>{}</env:Text>
      </env:Reason>
    </env:Fault>
  </env:Body>
</env:Envelope>"#,
            xml_escape(message)
        ),
    }
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
