//! Outbound HTTP call step.
//!
//! Method, URL, headers and body all pass through template substitution
//! against the current exchange. The response lands in the exchange's
//! response context, where later `${context.response.*}` placeholders
//! and the step's own captures can observe it.

use reqwest::Method;

use super::StepEnv;
use crate::capture::apply_captures;
use crate::config::RemoteStepConfig;
use crate::error::{ApiError, ApiResult};
use crate::exchange::{Exchange, ResponseContext};
use crate::template::TemplateContext;

pub async fn run(
    config: &RemoteStepConfig,
    exchange: &mut Exchange,
    env: &StepEnv<'_>,
) -> ApiResult<()> {
    // Render the request pieces before any await: the template context
    // borrows the exchange.
    let (method, url, headers, body) = {
        let tctx = TemplateContext::new(exchange, env.factory, env.server);
        let method = config
            .method
            .as_deref()
            .map(|m| tctx.render(m))
            .unwrap_or_else(|| "GET".to_owned());
        let url = tctx.render(&config.url);
        let headers: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), tctx.render(value)))
            .collect();
        let body = config.body.as_deref().map(|b| tctx.render(b));
        (method, url, headers, body)
    };

    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| ApiError::step(&format!("invalid remote method {:?}", method)))?;
    debug!("remote step: {} {}", method, url);

    let mut request = env.http_client.request(method, &url);
    let mut has_content_type = false;
    for (name, value) in &headers {
        if name.eq_ignore_ascii_case("content-type") {
            has_content_type = true;
        }
        request = request.header(name, value);
    }
    if let Some(body) = body {
        if !body.is_empty() && !has_content_type {
            request = request.header("Content-Type", "application/json");
        }
        request = request.body(body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| ApiError::step(&format!("remote call failed: {}", e)))?;

    let status_code = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                value.to_str().unwrap_or_default().to_owned(),
            )
        })
        .collect();
    let body = response
        .text()
        .await
        .map_err(|e| ApiError::step(&format!("remote body read failed: {}", e)))?;

    trace!("remote step returned {} ({} bytes)", status_code, body.len());
    exchange.response = Some(ResponseContext {
        status_code,
        headers,
        body,
    });

    apply_captures(
        &config.capture,
        exchange,
        env.factory,
        env.server,
        env.system_namespaces,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImposterConfig;
    use crate::exchange::RequestView;
    use crate::store::{inmemory::InMemoryStoreProvider, StoreFactory};
    use crate::template::ServerInfo;
    use bytes::Bytes;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn remote_step(yaml: &str) -> RemoteStepConfig {
        let config = ImposterConfig::from_yaml(yaml).unwrap();
        match &config.resources[0].steps[0] {
            crate::config::Step::Remote(remote) => remote.clone(),
            _ => panic!("expected a remote step"),
        }
    }

    struct Fixture {
        factory: StoreFactory,
        server: ServerInfo,
        namespaces: BTreeMap<String, String>,
        client: reqwest::Client,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                factory: StoreFactory::new(Arc::new(InMemoryStoreProvider::new(None))),
                server: ServerInfo {
                    port: 8080,
                    url: "http://localhost:8080".to_owned(),
                },
                namespaces: BTreeMap::new(),
                client: reqwest::Client::new(),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn env(&self) -> StepEnv<'_> {
            StepEnv {
                config_dir: self.dir.path(),
                factory: &self.factory,
                server: &self.server,
                system_namespaces: &self.namespaces,
                http_client: &self.client,
            }
        }
    }

    #[tokio::test]
    async fn records_the_response_context_and_captures() {
        let mut upstream = mockito::Server::new_async().await;
        let mock = upstream
            .mock("POST", "/orders")
            .match_header("content-type", "application/json")
            .with_status(201)
            .with_header("X-Order-Id", "o-17")
            .with_body(r#"{"id": "o-17"}"#)
            .create_async()
            .await;

        let fixture = Fixture::new();
        let config = remote_step(&format!(
            r#"
resources:
  - path: /local
    steps:
      - type: remote
        method: POST
        url: {}/orders
        body: '{{"from": "${{context.request.path}}"}}'
        capture:
          orderId:
            expression: "${{context.response.body:$.id}}"
    response: {{content: ok}}
"#,
            upstream.url()
        ));

        let mut exchange = Exchange::new(
            RequestView::new("GET", "/local", vec![], Bytes::new()),
            fixture.factory.request_store(),
        );
        run(&config, &mut exchange, &fixture.env()).await.unwrap();

        mock.assert_async().await;
        let response = exchange.response.as_ref().unwrap();
        assert_eq!(response.status_code, 201);
        assert_eq!(response.header("x-order-id"), Some("o-17"));
        assert_eq!(exchange.store.load("orderId"), Some(json!("o-17")));
    }

    #[tokio::test]
    async fn default_content_type_is_not_forced_when_set() {
        let mut upstream = mockito::Server::new_async().await;
        let mock = upstream
            .mock("POST", "/xml")
            .match_header("content-type", "text/xml")
            .with_status(200)
            .create_async()
            .await;

        let fixture = Fixture::new();
        let config = remote_step(&format!(
            r#"
resources:
  - path: /local
    steps:
      - type: remote
        method: POST
        url: {}/xml
        headers:
          Content-Type: text/xml
        body: <a/>
    response: {{content: ok}}
"#,
            upstream.url()
        ));

        let mut exchange = Exchange::new(
            RequestView::new("GET", "/local", vec![], Bytes::new()),
            fixture.factory.request_store(),
        );
        run(&config, &mut exchange, &fixture.env()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn transport_errors_abort_the_step() {
        let fixture = Fixture::new();
        let config = remote_step(
            r#"
resources:
  - path: /local
    steps:
      - type: remote
        url: http://127.0.0.1:1/unreachable
    response: {content: ok}
"#,
        );
        let mut exchange = Exchange::new(
            RequestView::new("GET", "/local", vec![], Bytes::new()),
            fixture.factory.request_store(),
        );
        let err = run(&config, &mut exchange, &fixture.env()).await.unwrap_err();
        assert!(err.to_string().contains("remote call failed"));
        assert!(exchange.response.is_none());
    }
}
