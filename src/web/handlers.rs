//! Request pipeline orchestration.
//!
//! Every mock request flows through the same stages: interceptor pass,
//! resource matching, admission control, capture, step execution,
//! response composition, write-out. Cleanup hooks registered on the
//! response-state run on every exit path.

use actix_web::{
    http::StatusCode,
    web::{Bytes, Data},
    HttpRequest, HttpResponse,
};

use crate::capture::apply_captures;
use crate::config::{Plugin, Resource};
use crate::error::ApiError;
use crate::exchange::{Exchange, RequestView, ResponseState};
use crate::limiter;
use crate::matcher::{score_matcher, select_best, Candidate};
use crate::respond::{compose_response, finalize_overrides};
use crate::server::ServerState;
use crate::steps::run_steps;
use crate::template::TemplateContext;
use crate::web::soap;
use crate::wsdl::SoapContext;

/// Entry point for all mock traffic; the resource collection governs the
/// whole path namespace, so this hangs off a catch-all route.
pub async fn handle(req: HttpRequest, body: Bytes, state: Data<ServerState>) -> HttpResponse {
    let view = RequestView::from_http(&req, body);
    debug!("handling {} {}", view.method(), view.path());
    state.metrics.incr("request.received");

    let mut exchange = Exchange::new(view, state.stores.request_store());
    match state.config.plugin {
        Plugin::Rest => rest_pipeline(&mut exchange, &state).await,
        Plugin::Soap => soap::soap_pipeline(&mut exchange, &state).await,
    }

    let mut response_state = std::mem::take(&mut exchange.state);
    response_state.run_cleanups();
    write_response(response_state)
}

async fn rest_pipeline(exchange: &mut Exchange, state: &ServerState) {
    if !run_interceptors(exchange, state, None).await {
        return;
    }

    let candidates = score_resources(exchange, state, None);
    let Some(best) = select_best(candidates) else {
        state.metrics.incr("request.no_match");
        not_found(exchange);
        return;
    };

    let resource = best.resource;
    let name = resource.matcher.path.clone().unwrap_or_default();
    run_resource(exchange, state, resource, &name, None).await;
}

/// Run the interceptor pass. Returns false when an interceptor
/// short-circuited the exchange.
pub(crate) async fn run_interceptors(
    exchange: &mut Exchange,
    state: &ServerState,
    soap: Option<&SoapContext>,
) -> bool {
    let interceptors = &state.config.interceptors;
    for (index, interceptor) in interceptors.iter().enumerate() {
        let matched = {
            let tctx = TemplateContext::new(exchange, &state.stores, &state.server_info);
            score_matcher(
                &interceptor.matcher,
                exchange,
                &tctx,
                state.system_namespaces(),
                soap,
            )
        };
        if matched.is_none() {
            continue;
        }

        trace!("interceptor {} matched", index);
        exchange.path_template = interceptor.matcher.path.clone();
        apply_captures(
            &interceptor.matcher.capture,
            exchange,
            &state.stores,
            &state.server_info,
            state.system_namespaces(),
        );

        if let Some(response) = &interceptor.response {
            if let Err(e) = compose_response(response, exchange, &state.compose_env()).await {
                fail_exchange(exchange, &e);
                return false;
            }
        }

        if !interceptor.continue_ {
            state.metrics.incr("request.intercepted");
            exchange.state.handled = true;
            return false;
        }
    }
    true
}

/// Score every resource against the exchange; hard misses drop out here.
pub(crate) fn score_resources<'a>(
    exchange: &Exchange,
    state: &'a ServerState,
    soap: Option<&SoapContext>,
) -> Vec<Candidate<'a>> {
    let tctx = TemplateContext::new(exchange, &state.stores, &state.server_info);
    state
        .config
        .resources
        .iter()
        .enumerate()
        .filter_map(|(index, resource)| {
            score_matcher(
                &resource.matcher,
                exchange,
                &tctx,
                state.system_namespaces(),
                soap,
            )
            .filter(|result| result.score > 0)
            .map(|result| Candidate {
                resource,
                result,
                index,
            })
        })
        .collect()
}

/// The matched-resource tail of the pipeline: admission, capture, steps,
/// response composition.
pub(crate) async fn run_resource(
    exchange: &mut Exchange,
    state: &ServerState,
    resource: &Resource,
    resource_name: &str,
    soap: Option<&SoapContext>,
) {
    exchange.path_template = resource.matcher.path.clone();

    // Admission control runs before anything observable happens.
    let counter_key =
        limiter::resource_key(exchange.request.method(), resource_name, &resource.matcher);
    if let Some(limited) = state.limiter.check(
        &counter_key,
        &resource.matcher.concurrency,
        &mut exchange.state,
    ) {
        state.metrics.incr("request.rate_limited");
        if let Err(e) = compose_response(&limited, exchange, &state.compose_env()).await {
            fail_exchange(exchange, &e);
            return;
        }
        exchange.state.handled = true;
        return;
    }

    apply_captures(
        &resource.matcher.capture,
        exchange,
        &state.stores,
        &state.server_info,
        state.system_namespaces(),
    );

    let step_env = state.step_env();
    if let Err(e) = run_steps(&resource.steps, exchange, &step_env).await {
        state.metrics.incr("request.step_failed");
        fail_exchange(exchange, &e);
        return;
    }

    if exchange.state.handled {
        // a script claimed the response; only its overrides remain
        if let Err(e) = finalize_overrides(exchange, &state.compose_env()).await {
            fail_exchange(exchange, &e);
        }
        return;
    }

    if let Err(e) = compose_response(&resource.response, exchange, &state.compose_env()).await {
        fail_exchange(exchange, &e);
        return;
    }
    state.metrics.incr("request.handled");
    exchange.state.handled = true;
}

fn not_found(exchange: &mut Exchange) {
    debug!("no resource matched {}", exchange.request.path());
    exchange.state.status = StatusCode::NOT_FOUND.as_u16();
    exchange.state.set_header("Content-Type", "text/plain");
    exchange.state.body = b"Resource not found".to_vec();
}

/// A failed step or composition becomes a 500 unless an earlier step or
/// interceptor already claimed the response.
pub(crate) fn fail_exchange(exchange: &mut Exchange, error: &ApiError) {
    warn!("exchange failed: {}", error);
    if exchange.state.handled {
        return;
    }
    exchange.state.status = StatusCode::INTERNAL_SERVER_ERROR.as_u16();
    exchange.state.set_header("Content-Type", "text/plain");
    exchange.state.body = b"An internal error occurred".to_vec();
    exchange.state.handled = true;
}

/// Flush the response-state to the transport: status, headers, body, in
/// that order. A stopped exchange closes the connection without a body.
pub fn write_response(mut state: ResponseState) -> HttpResponse {
    if state.stopped {
        // No hijack primitive under actix; an empty forced-close response
        // is the closest the transport offers.
        let mut builder = HttpResponse::build(StatusCode::OK);
        builder.force_close();
        return builder.finish();
    }

    let status =
        StatusCode::from_u16(state.status).unwrap_or(StatusCode::OK);
    let mut builder = HttpResponse::build(status);
    for (name, value) in &state.headers {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    builder.body(std::mem::take(&mut state.body))
}
